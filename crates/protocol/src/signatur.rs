//! HMAC-SHA256 Signatur fuer den Session-Handshake
//!
//! Signiert wird der String `callId:timestamp` mit einem gemeinsamen
//! Geheimnis. Die Signatur wird hex-kodiert uebertragen. Die Pruefung
//! vergleicht in konstanter Zeit (`ring::hmac::verify`).

use ring::hmac;

fn nachricht(call_id: &str, timestamp: i64) -> String {
    format!("{call_id}:{timestamp}")
}

/// Berechnet die hex-kodierte Signatur fuer `callId:timestamp`
pub fn signieren(geheimnis: &[u8], call_id: &str, timestamp: i64) -> String {
    let schluessel = hmac::Key::new(hmac::HMAC_SHA256, geheimnis);
    let tag = hmac::sign(&schluessel, nachricht(call_id, timestamp).as_bytes());
    hex::encode(tag.as_ref())
}

/// Prueft eine hex-kodierte Signatur in konstanter Zeit
pub fn pruefen(geheimnis: &[u8], call_id: &str, timestamp: i64, signatur: &str) -> bool {
    let bytes = match hex::decode(signatur) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let schluessel = hmac::Key::new(hmac::HMAC_SHA256, geheimnis);
    hmac::verify(&schluessel, nachricht(call_id, timestamp).as_bytes(), &bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatur_gueltig() {
        let sig = signieren(b"geheim", "c1", 1_700_000_000);
        assert_eq!(sig.len(), 64);
        assert!(pruefen(b"geheim", "c1", 1_700_000_000, &sig));
    }

    #[test]
    fn signatur_an_call_und_zeit_gebunden() {
        let sig = signieren(b"geheim", "c1", 1_700_000_000);
        assert!(!pruefen(b"geheim", "c2", 1_700_000_000, &sig));
        assert!(!pruefen(b"geheim", "c1", 1_700_000_001, &sig));
        assert!(!pruefen(b"anders", "c1", 1_700_000_000, &sig));
        assert!(!pruefen(b"geheim", "c1", 1_700_000_000, "kein-hex"));
    }
}
