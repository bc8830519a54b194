//! Limits pro Anruf: gleichzeitige Verbindungen und Nachrichtenrate
//!
//! - Verbindungen werden ueber einen [`VerbindungsGuard`] gezaehlt, der beim
//!   Drop freigibt; ueberzaehlige Verbindungen werden hart abgewiesen
//! - Steuerungsnachrichten laufen durch ein gleitendes Fenster; ueber dem
//!   Limit wird die Nachricht mit `RATE_LIMITED` beantwortet, die Verbindung
//!   bleibt offen
//! - Das Fenster ueberlebt das Schliessen der letzten Verbindung und verfaellt
//!   erst mit seinem juengsten Eintrag; ein Reconnect startet nicht mit
//!   frischem Budget

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use callbridge_core::CallId;
use dashmap::DashMap;

use crate::error::{GatewayError, GatewayResult};

/// Zaehler fuer Verbindungen und Nachrichten pro Anruf
pub struct CallLimits {
    max_verbindungen: u32,
    max_nachrichten: u32,
    fenster: Duration,
    verbindungen: DashMap<CallId, u32>,
    nachrichten: DashMap<CallId, VecDeque<Instant>>,
}

impl CallLimits {
    pub fn neu(max_verbindungen: u32, nachrichten_pro_minute: u32) -> Arc<Self> {
        Self::mit_fenster(max_verbindungen, nachrichten_pro_minute, Duration::from_secs(60))
    }

    pub fn mit_fenster(max_verbindungen: u32, max_nachrichten: u32, fenster: Duration) -> Arc<Self> {
        Arc::new(Self {
            max_verbindungen: max_verbindungen.max(1),
            max_nachrichten: max_nachrichten.max(1),
            fenster,
            verbindungen: DashMap::new(),
            nachrichten: DashMap::new(),
        })
    }

    /// Registriert eine Verbindung; der Guard gibt sie beim Drop wieder frei
    pub fn verbindung_oeffnen(self: &Arc<Self>, call_id: &CallId) -> GatewayResult<VerbindungsGuard> {
        let mut eintrag = self.verbindungen.entry(call_id.clone()).or_insert(0);
        if *eintrag >= self.max_verbindungen {
            tracing::warn!(call_id = %call_id, max = self.max_verbindungen, "Verbindungslimit erreicht");
            return Err(GatewayError::ZuVieleVerbindungen {
                call_id: call_id.clone(),
                max: self.max_verbindungen,
            });
        }
        *eintrag += 1;
        drop(eintrag);

        Ok(VerbindungsGuard {
            limits: Arc::clone(self),
            call_id: call_id.clone(),
        })
    }

    pub fn nachricht_erlauben(&self, call_id: &CallId) -> bool {
        self.nachricht_erlauben_bei(call_id, Instant::now())
    }

    /// Zaehlt eine Steuerungsnachricht; `false` wenn das Fenster voll ist
    ///
    /// Abgelehnte Nachrichten zaehlen nicht mit, damit ein Client nach Ablauf
    /// des Fensters wieder durchkommt.
    pub fn nachricht_erlauben_bei(&self, call_id: &CallId, jetzt: Instant) -> bool {
        let mut fenster = self.nachrichten.entry(call_id.clone()).or_default();
        while let Some(&aeltester) = fenster.front() {
            if jetzt.saturating_duration_since(aeltester) >= self.fenster {
                fenster.pop_front();
            } else {
                break;
            }
        }
        if fenster.len() >= self.max_nachrichten as usize {
            return false;
        }
        fenster.push_back(jetzt);
        true
    }

    pub fn aktive_verbindungen(&self, call_id: &CallId) -> u32 {
        self.verbindungen.get(call_id).map(|v| *v).unwrap_or(0)
    }

    pub fn anzahl_calls(&self) -> usize {
        self.verbindungen.len()
    }

    fn verbindung_schliessen(&self, call_id: &CallId) {
        let leer = match self.verbindungen.get_mut(call_id) {
            Some(mut anzahl) => {
                *anzahl = anzahl.saturating_sub(1);
                *anzahl == 0
            }
            None => false,
        };
        if leer {
            self.verbindungen.remove_if(call_id, |_, anzahl| *anzahl == 0);
        }
        self.fenster_aufraeumen_bei(Instant::now());
    }

    /// Entfernt abgelaufene Fenster von Anrufen ohne Verbindung
    pub fn fenster_aufraeumen_bei(&self, jetzt: Instant) -> usize {
        let vorher = self.nachrichten.len();
        self.nachrichten.retain(|call_id, fenster| {
            let aktuell = fenster
                .back()
                .is_some_and(|&juengster| jetzt.saturating_duration_since(juengster) < self.fenster);
            aktuell || self.verbindungen.contains_key(call_id)
        });
        vorher - self.nachrichten.len()
    }
}

/// Haelt einen Verbindungsplatz eines Anrufs
pub struct VerbindungsGuard {
    limits: Arc<CallLimits>,
    call_id: CallId,
}

impl VerbindungsGuard {
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }
}

impl Drop for VerbindungsGuard {
    fn drop(&mut self) {
        self.limits.verbindung_schliessen(&self.call_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zweite_verbindung_abgewiesen() {
        let limits = CallLimits::neu(1, 100);
        let c = CallId::neu("c1");
        let guard = limits.verbindung_oeffnen(&c).unwrap();
        assert!(matches!(
            limits.verbindung_oeffnen(&c),
            Err(GatewayError::ZuVieleVerbindungen { max: 1, .. })
        ));
        // Anderer Anruf unberuehrt
        let _anderer = limits.verbindung_oeffnen(&CallId::neu("c2")).unwrap();

        drop(guard);
        assert_eq!(limits.aktive_verbindungen(&c), 0);
        assert!(limits.verbindung_oeffnen(&c).is_ok());
    }

    #[test]
    fn gleitendes_nachrichtenfenster() {
        let limits = CallLimits::mit_fenster(1, 3, Duration::from_secs(60));
        let c = CallId::neu("c1");
        let t = Instant::now();
        for _ in 0..3 {
            assert!(limits.nachricht_erlauben_bei(&c, t));
        }
        assert!(!limits.nachricht_erlauben_bei(&c, t + Duration::from_secs(30)));
        assert!(!limits.nachricht_erlauben_bei(&c, t + Duration::from_secs(59)));
        assert!(limits.nachricht_erlauben_bei(&c, t + Duration::from_secs(60)));
    }

    #[test]
    fn aufraeumen_beim_letzten_guard() {
        let limits = CallLimits::neu(2, 5);
        let c = CallId::neu("c1");
        let a = limits.verbindung_oeffnen(&c).unwrap();
        let b = limits.verbindung_oeffnen(&c).unwrap();
        drop(a);
        assert_eq!(limits.aktive_verbindungen(&c), 1);
        drop(b);
        assert_eq!(limits.anzahl_calls(), 0);
    }

    #[test]
    fn reconnect_erbt_das_nachrichtenfenster() {
        let limits = CallLimits::mit_fenster(1, 3, Duration::from_secs(60));
        let c = CallId::neu("c1");
        let t = Instant::now();
        let erste = limits.verbindung_oeffnen(&c).unwrap();
        for _ in 0..3 {
            assert!(limits.nachricht_erlauben_bei(&c, t));
        }
        drop(erste);

        let _zweite = limits.verbindung_oeffnen(&c).unwrap();
        assert!(!limits.nachricht_erlauben_bei(&c, t + Duration::from_secs(1)));
        assert!(limits.nachricht_erlauben_bei(&c, t + Duration::from_secs(60)));
    }

    #[test]
    fn abgelaufene_fenster_ohne_verbindung_verfallen() {
        let limits = CallLimits::mit_fenster(1, 3, Duration::from_secs(60));
        let offen = CallId::neu("offen");
        let weg = CallId::neu("weg");
        let t = Instant::now();
        let _guard = limits.verbindung_oeffnen(&offen).unwrap();
        limits.nachricht_erlauben_bei(&offen, t);
        limits.nachricht_erlauben_bei(&weg, t);

        assert_eq!(limits.fenster_aufraeumen_bei(t + Duration::from_secs(59)), 0);
        assert_eq!(limits.fenster_aufraeumen_bei(t + Duration::from_secs(61)), 1);
        assert!(limits.nachrichten.contains_key(&offen));
        assert!(!limits.nachrichten.contains_key(&weg));
    }
}
