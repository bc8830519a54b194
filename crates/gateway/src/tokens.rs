//! Geteilte Zulassung eines Anrufs ueber alle seine Verbindungen
//!
//! Darf ein Anruf mehrere Verbindungen halten, teilen sie sich ein
//! Concurrency-Token. Jede Verbindung haelt einen [`TokenAnteil`]; erst der
//! letzte Anteil gibt das Token im Ledger frei. Zaehlen und Freigeben laufen
//! unter dem Eintrags-Lock des Anrufs, damit eine gleichzeitig eintreffende
//! Verbindung nie ein gerade freigegebenes Token mitbenutzt.
//!
//! Jeder Anteil meldet das Ergebnis seines eigenen Aufbaus mit dem
//! Breaker-Versuch aus seiner Zulassung.

use std::sync::Arc;

use callbridge_admission::{AdmissionController, AdmissionResult, Registrierung, Versuch};
use callbridge_core::{CallId, CampaignId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Anteile pro Anruf
pub struct CallTokens {
    admission: Arc<AdmissionController>,
    anteile: DashMap<CallId, u32>,
}

impl CallTokens {
    pub fn neu(admission: Arc<AdmissionController>) -> Arc<Self> {
        Arc::new(Self {
            admission,
            anteile: DashMap::new(),
        })
    }

    /// Laesst die Verbindung zu und zaehlt sie zum Token des Anrufs
    pub fn beitreten(
        self: &Arc<Self>,
        call_id: &CallId,
        campaign_id: &CampaignId,
    ) -> AdmissionResult<TokenAnteil> {
        let mut eintrag = self.anteile.entry(call_id.clone()).or_insert(0);
        let zulassung = match self.admission.zulassen(call_id, campaign_id) {
            Ok(z) => z,
            Err(e) => {
                let leer = *eintrag == 0;
                drop(eintrag);
                if leer {
                    self.anteile.remove_if(call_id, |_, n| *n == 0);
                }
                return Err(e);
            }
        };
        *eintrag += 1;
        let verbindungen = *eintrag;
        drop(eintrag);

        tracing::debug!(
            call_id = %call_id,
            registrierung = ?zulassung.registrierung,
            verbindungen,
            "Token-Anteil uebernommen"
        );
        Ok(TokenAnteil {
            tokens: Arc::clone(self),
            call_id: call_id.clone(),
            registrierung: zulassung.registrierung,
            versuch: zulassung.versuch,
            gemeldet: false,
        })
    }

    /// Verbindungen, die sich das Token des Anrufs teilen
    pub fn anteile(&self, call_id: &CallId) -> u32 {
        self.anteile.get(call_id).map(|n| *n).unwrap_or(0)
    }

    fn verlassen(&self, call_id: &CallId) {
        if let Entry::Occupied(mut eintrag) = self.anteile.entry(call_id.clone()) {
            *eintrag.get_mut() = eintrag.get().saturating_sub(1);
            if *eintrag.get() == 0 {
                // Freigabe noch unter dem Eintrags-Lock
                self.admission.freigeben(call_id);
                eintrag.remove();
            }
        }
    }
}

/// Anteil einer Verbindung am Token ihres Anrufs
pub struct TokenAnteil {
    tokens: Arc<CallTokens>,
    call_id: CallId,
    registrierung: Registrierung,
    versuch: Versuch,
    gemeldet: bool,
}

impl TokenAnteil {
    pub fn registrierung(&self) -> Registrierung {
        self.registrierung
    }

    /// Aufbau gelungen
    pub fn bestaetigen(&mut self) {
        self.tokens.admission.bestaetigen(self.versuch);
        self.gemeldet = true;
    }

    /// Aufbau nach der Zulassung gescheitert (zaehlt fuer den Breaker)
    pub fn fehlschlag(&mut self) {
        self.tokens.admission.fehlschlag_melden(self.versuch);
        self.gemeldet = true;
    }
}

impl Drop for TokenAnteil {
    fn drop(&mut self) {
        if !self.gemeldet {
            self.tokens.admission.abbrechen(self.versuch);
        }
        self.tokens.verlassen(&self.call_id);
    }
}
