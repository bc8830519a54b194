//! Handshake-Authentifizierung
//!
//! Drei gleichwertige Verfahren, gewaehlt nach den Feldern der
//! `auth`-Nachricht:
//! - `apiKey`: Vergleich mit dem konfigurierten Schluessel in konstanter Zeit
//! - `token`: EdDSA-signiertes JWT, geprueft gegen den oeffentlichen Schluessel
//! - `timestamp` + `signature`: HMAC-SHA256 ueber `callId:timestamp`
//!
//! Alle Fehler fuehren zum selben generischen Close-Code; Details landen
//! nur im Log.

use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use callbridge_protocol::signatur;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::{GatewayError, GatewayResult};

/// Tokens oberhalb dieser Groesse werden vor dem Parsen abgelehnt
pub const MAX_TOKEN_BYTES: usize = 8 * 1024;

/// Zeitstempel oberhalb dieser Grenze werden als Millisekunden gelesen
const MS_GRENZE: i64 = 100_000_000_000;

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    pub hmac_geheimnis: Option<String>,
    /// Oeffentlicher Ed25519-Schluessel (32 Byte, base64url)
    pub jwt_public_key: Option<String>,
    /// Erlaubte Uhrenabweichung fuer HMAC-Zeitstempel und JWT-Ablauf
    pub max_skew_sek: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            hmac_geheimnis: None,
            jwt_public_key: None,
            max_skew_sek: 300,
        }
    }
}

impl AuthConfig {
    pub fn ist_konfiguriert(&self) -> bool {
        [&self.api_key, &self.hmac_geheimnis, &self.jwt_public_key]
            .iter()
            .any(|v| v.as_deref().is_some_and(|s| !s.is_empty()))
    }
}

// ---------------------------------------------------------------------------
// Authenticator
// ---------------------------------------------------------------------------

/// Verwendetes Verfahren einer erfolgreichen Anmeldung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethode {
    ApiKey,
    Bearer,
    Hmac,
}

impl AuthMethode {
    pub fn als_str(&self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::Bearer => "bearer",
            Self::Hmac => "hmac",
        }
    }
}

/// Anmeldefelder aus der `auth`-Nachricht
#[derive(Debug, Clone, Copy, Default)]
pub struct Anmeldedaten<'a> {
    pub call_id: &'a str,
    pub api_key: Option<&'a str>,
    pub token: Option<&'a str>,
    pub timestamp: Option<i64>,
    pub signatur: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[allow(dead_code)]
    sub: String,
    /// Optional an einen Anruf gebunden
    #[serde(default, rename = "callId")]
    call_id: Option<String>,
}

/// Prueft Handshakes gegen die konfigurierten Geheimnisse
pub struct Authenticator {
    api_key: Option<Vec<u8>>,
    hmac_geheimnis: Option<Vec<u8>>,
    jwt_schluessel: Option<DecodingKey>,
    max_skew: Duration,
}

fn nicht_leer(wert: &Option<String>) -> Option<&str> {
    wert.as_deref().filter(|s| !s.is_empty())
}

impl Authenticator {
    pub fn neu(config: &AuthConfig) -> GatewayResult<Self> {
        let jwt_schluessel = match nicht_leer(&config.jwt_public_key) {
            Some(b64) => {
                let bytes = URL_SAFE_NO_PAD
                    .decode(b64.trim_end_matches('='))
                    .map_err(|e| GatewayError::Konfiguration(format!("jwt_public_key: {e}")))?;
                if bytes.len() != 32 {
                    return Err(GatewayError::Konfiguration(format!(
                        "jwt_public_key muss 32 Byte lang sein, erhalten: {}",
                        bytes.len()
                    )));
                }
                Some(DecodingKey::from_ed_der(&bytes))
            }
            None => None,
        };

        Ok(Self {
            api_key: nicht_leer(&config.api_key).map(|s| s.as_bytes().to_vec()),
            hmac_geheimnis: nicht_leer(&config.hmac_geheimnis).map(|s| s.as_bytes().to_vec()),
            jwt_schluessel,
            max_skew: Duration::from_secs(config.max_skew_sek),
        })
    }

    /// Konfigurierte Verfahren (fuer das Start-Log)
    pub fn methoden(&self) -> Vec<AuthMethode> {
        let mut methoden = Vec::new();
        if self.api_key.is_some() {
            methoden.push(AuthMethode::ApiKey);
        }
        if self.jwt_schluessel.is_some() {
            methoden.push(AuthMethode::Bearer);
        }
        if self.hmac_geheimnis.is_some() {
            methoden.push(AuthMethode::Hmac);
        }
        methoden
    }

    pub fn pruefen(&self, daten: &Anmeldedaten<'_>) -> GatewayResult<AuthMethode> {
        self.pruefen_bei(daten, chrono::Utc::now().timestamp())
    }

    /// Prueft die Anmeldedaten; `jetzt_sek` ist die aktuelle Unix-Zeit
    pub fn pruefen_bei(&self, daten: &Anmeldedaten<'_>, jetzt_sek: i64) -> GatewayResult<AuthMethode> {
        fn leer(v: Option<&str>) -> Option<&str> {
            v.filter(|s| !s.is_empty())
        }

        if let Some(key) = leer(daten.api_key) {
            return self.api_key_pruefen(key).map(|_| AuthMethode::ApiKey);
        }
        if let Some(token) = leer(daten.token) {
            return self
                .token_pruefen(token, daten.call_id)
                .map(|_| AuthMethode::Bearer);
        }
        if let (Some(ts), Some(sig)) = (daten.timestamp, leer(daten.signatur)) {
            return self
                .hmac_pruefen(daten.call_id, ts, sig, jetzt_sek)
                .map(|_| AuthMethode::Hmac);
        }
        Err(GatewayError::auth("keine Anmeldedaten"))
    }

    fn api_key_pruefen(&self, key: &str) -> GatewayResult<()> {
        let erwartet = self
            .api_key
            .as_deref()
            .ok_or_else(|| GatewayError::auth("API-Key nicht konfiguriert"))?;
        if konstante_zeit_gleich(key.as_bytes(), erwartet) {
            Ok(())
        } else {
            Err(GatewayError::auth("API-Key ungueltig"))
        }
    }

    fn token_pruefen(&self, token: &str, call_id: &str) -> GatewayResult<()> {
        let schluessel = self
            .jwt_schluessel
            .as_ref()
            .ok_or_else(|| GatewayError::auth("Bearer-Token nicht konfiguriert"))?;
        if token.len() > MAX_TOKEN_BYTES {
            return Err(GatewayError::auth(format!(
                "Token zu gross: {} Bytes",
                token.len()
            )));
        }

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.validate_exp = true;
        validation.leeway = self.max_skew.as_secs();
        validation.set_required_spec_claims(&["exp", "sub"]);

        let daten = decode::<TokenClaims>(token, schluessel, &validation)
            .map_err(|e| GatewayError::auth(format!("Token ungueltig: {e}")))?;

        match daten.claims.call_id {
            Some(gebunden) if gebunden != call_id => Err(GatewayError::auth(format!(
                "Token gilt fuer anderen Anruf ({gebunden})"
            ))),
            _ => Ok(()),
        }
    }

    fn hmac_pruefen(&self, call_id: &str, timestamp: i64, sig: &str, jetzt_sek: i64) -> GatewayResult<()> {
        let geheimnis = self
            .hmac_geheimnis
            .as_deref()
            .ok_or_else(|| GatewayError::auth("HMAC nicht konfiguriert"))?;

        let ts_sek = if timestamp > MS_GRENZE {
            timestamp / 1000
        } else {
            timestamp
        };
        let abweichung = jetzt_sek.abs_diff(ts_sek);
        if abweichung > self.max_skew.as_secs() {
            return Err(GatewayError::auth(format!(
                "Zeitstempel ausserhalb des Fensters ({abweichung} s)"
            )));
        }

        if signatur::pruefen(geheimnis, call_id, timestamp, sig) {
            Ok(())
        } else {
            Err(GatewayError::auth("HMAC-Signatur ungueltig"))
        }
    }
}

/// Vergleich ohne frueheren Abbruch bei der ersten Abweichung
pub fn konstante_zeit_gleich(a: impl AsRef<[u8]>, b: impl AsRef<[u8]>) -> bool {
    ring::constant_time::verify_slices_are_equal(a.as_ref(), b.as_ref()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use ring::rand::SystemRandom;
    use ring::signature::{Ed25519KeyPair, KeyPair};
    use serde::Serialize;

    const JETZT: i64 = 1_700_000_000;

    fn auth() -> Authenticator {
        Authenticator::neu(&AuthConfig {
            api_key: Some("schluessel-123".into()),
            hmac_geheimnis: Some("geheim".into()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn api_key() {
        let a = auth();
        let ok = Anmeldedaten {
            call_id: "c1",
            api_key: Some("schluessel-123"),
            ..Default::default()
        };
        assert_eq!(a.pruefen_bei(&ok, JETZT).unwrap(), AuthMethode::ApiKey);

        let falsch = Anmeldedaten {
            api_key: Some("schluessel-124"),
            ..ok
        };
        assert!(matches!(
            a.pruefen_bei(&falsch, JETZT),
            Err(GatewayError::AuthFehlgeschlagen(_))
        ));
    }

    #[test]
    fn hmac_in_sekunden_und_millisekunden() {
        let a = auth();
        for ts in [JETZT - 10, (JETZT + 5) * 1000] {
            let sig = signatur::signieren(b"geheim", "c1", ts);
            let daten = Anmeldedaten {
                call_id: "c1",
                timestamp: Some(ts),
                signatur: Some(&sig),
                ..Default::default()
            };
            assert_eq!(a.pruefen_bei(&daten, JETZT).unwrap(), AuthMethode::Hmac);
        }
    }

    #[test]
    fn hmac_ausserhalb_des_fensters() {
        let a = auth();
        let ts = JETZT - 301;
        let sig = signatur::signieren(b"geheim", "c1", ts);
        let daten = Anmeldedaten {
            call_id: "c1",
            timestamp: Some(ts),
            signatur: Some(&sig),
            ..Default::default()
        };
        assert!(a.pruefen_bei(&daten, JETZT).is_err());
    }

    #[test]
    fn hmac_an_call_gebunden() {
        let a = auth();
        let sig = signatur::signieren(b"geheim", "c1", JETZT);
        let daten = Anmeldedaten {
            call_id: "c2",
            timestamp: Some(JETZT),
            signatur: Some(&sig),
            ..Default::default()
        };
        assert!(a.pruefen_bei(&daten, JETZT).is_err());
    }

    #[test]
    fn ohne_anmeldedaten() {
        let a = auth();
        let daten = Anmeldedaten {
            call_id: "c1",
            api_key: Some(""),
            ..Default::default()
        };
        assert!(a.pruefen_bei(&daten, JETZT).is_err());
    }

    #[derive(Serialize)]
    struct Claims<'a> {
        sub: &'a str,
        exp: i64,
        #[serde(rename = "callId", skip_serializing_if = "Option::is_none")]
        call_id: Option<&'a str>,
    }

    fn schluesselpaar() -> (Vec<u8>, String) {
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new()).unwrap();
        let paar = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
        let public = URL_SAFE_NO_PAD.encode(paar.public_key().as_ref());
        (pkcs8.as_ref().to_vec(), public)
    }

    fn token(pkcs8: &[u8], claims: &Claims<'_>) -> String {
        encode(
            &Header::new(Algorithm::EdDSA),
            claims,
            &EncodingKey::from_ed_der(pkcs8),
        )
        .unwrap()
    }

    #[test]
    fn bearer_token() {
        let (pkcs8, public) = schluesselpaar();
        let a = Authenticator::neu(&AuthConfig {
            jwt_public_key: Some(public),
            ..Default::default()
        })
        .unwrap();
        let exp = chrono::Utc::now().timestamp() + 600;

        let gueltig = token(
            &pkcs8,
            &Claims {
                sub: "tenant-a",
                exp,
                call_id: Some("c1"),
            },
        );
        let daten = Anmeldedaten {
            call_id: "c1",
            token: Some(&gueltig),
            ..Default::default()
        };
        assert_eq!(a.pruefen(&daten).unwrap(), AuthMethode::Bearer);

        // An anderen Anruf gebunden
        let daten = Anmeldedaten {
            call_id: "c9",
            ..daten
        };
        assert!(a.pruefen(&daten).is_err());

        // Abgelaufen (jenseits der Toleranz)
        let alt = token(
            &pkcs8,
            &Claims {
                sub: "tenant-a",
                exp: exp - 3600,
                call_id: None,
            },
        );
        let daten = Anmeldedaten {
            call_id: "c1",
            token: Some(&alt),
            ..Default::default()
        };
        assert!(a.pruefen(&daten).is_err());
    }

    #[test]
    fn fremder_schluessel_und_uebergrosses_token() {
        let (pkcs8, _) = schluesselpaar();
        let (_, anderer_public) = schluesselpaar();
        let a = Authenticator::neu(&AuthConfig {
            jwt_public_key: Some(anderer_public),
            ..Default::default()
        })
        .unwrap();
        let t = token(
            &pkcs8,
            &Claims {
                sub: "x",
                exp: chrono::Utc::now().timestamp() + 600,
                call_id: None,
            },
        );
        let daten = Anmeldedaten {
            call_id: "c1",
            token: Some(&t),
            ..Default::default()
        };
        assert!(a.pruefen(&daten).is_err());

        let riesig = "a".repeat(MAX_TOKEN_BYTES + 1);
        let daten = Anmeldedaten {
            token: Some(&riesig),
            ..daten
        };
        assert!(a.pruefen(&daten).is_err());
    }

    #[test]
    fn ungueltiger_public_key() {
        let e = Authenticator::neu(&AuthConfig {
            jwt_public_key: Some(URL_SAFE_NO_PAD.encode([1u8; 16])),
            ..Default::default()
        });
        assert!(matches!(e, Err(GatewayError::Konfiguration(_))));
    }
}
