//! Concurrency-Tokens auf zwei Ebenen (global und pro Kampagne)
//!
//! Alle Mutationen laufen unter einem einzigen Lock; Pruefen und Eintragen
//! sind damit ein atomarer Schritt. Die Registrierung folgt trotzdem der
//! Reihenfolge global → Kampagne und nimmt den globalen Eintrag zurueck,
//! wenn die Kampagne voll ist.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use callbridge_core::{CallId, CampaignId};
use parking_lot::Mutex;

use crate::config::AdmissionConfig;
use crate::error::{AdmissionError, AdmissionResult};

/// Kapazitaetsanspruch eines zugelassenen Anrufs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyToken {
    pub call_id: CallId,
    pub campaign_id: CampaignId,
    pub issued_at: Instant,
    pub ttl: Duration,
}

/// Ergebnis einer Registrierung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registrierung {
    Neu,
    /// Anruf hatte bereits ein Token; nur die Liveness wurde erneuert
    Vorhanden,
}

#[derive(Debug, Default)]
struct LedgerInner {
    global: HashMap<CallId, ConcurrencyToken>,
    campaigns: HashMap<CampaignId, HashSet<CallId>>,
    /// Ablaufzeitpunkt des Liveness-Schluessels
    liveness: HashMap<CallId, Instant>,
}

/// Token-Buchhaltung (prozessweit, thread-safe)
pub struct TokenLedger {
    inner: Mutex<LedgerInner>,
    global_limit: u32,
    campaign_limit: u32,
    campaign_limits: HashMap<String, u32>,
    ttl: Duration,
}

impl TokenLedger {
    pub fn neu(config: &AdmissionConfig) -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
            global_limit: config.global_limit,
            campaign_limit: config.campaign_limit,
            campaign_limits: config.campaign_limits.clone(),
            ttl: config.token_ttl(),
        }
    }

    pub fn global_limit(&self) -> u32 {
        self.global_limit
    }

    /// Limit einer Kampagne (Ueberschreibung oder Standard)
    pub fn limit_fuer(&self, campaign: &CampaignId) -> u32 {
        self.campaign_limits
            .get(campaign.as_str())
            .copied()
            .unwrap_or(self.campaign_limit)
    }

    /// Registriert ein Token; alles oder nichts
    pub fn registrieren_bei(
        &self,
        call_id: &CallId,
        campaign_id: &CampaignId,
        jetzt: Instant,
    ) -> AdmissionResult<Registrierung> {
        let campaign_limit = self.limit_fuer(campaign_id);
        let mut inner = self.inner.lock();

        if inner.global.contains_key(call_id) {
            inner.liveness.insert(call_id.clone(), jetzt + self.ttl);
            return Ok(Registrierung::Vorhanden);
        }

        // 1. Global
        if inner.global.len() >= self.global_limit as usize {
            return Err(AdmissionError::GlobalesLimit {
                limit: self.global_limit,
            });
        }
        inner.global.insert(
            call_id.clone(),
            ConcurrencyToken {
                call_id: call_id.clone(),
                campaign_id: campaign_id.clone(),
                issued_at: jetzt,
                ttl: self.ttl,
            },
        );

        // 2. Kampagne; bei Ablehnung globalen Eintrag zuruecknehmen
        let belegt = inner
            .campaigns
            .get(campaign_id)
            .map(HashSet::len)
            .unwrap_or(0);
        if belegt >= campaign_limit as usize {
            inner.global.remove(call_id);
            return Err(AdmissionError::CampaignLimit {
                campaign: campaign_id.clone(),
                limit: campaign_limit,
            });
        }
        inner
            .campaigns
            .entry(campaign_id.clone())
            .or_default()
            .insert(call_id.clone());
        inner.liveness.insert(call_id.clone(), jetzt + self.ttl);

        Ok(Registrierung::Neu)
    }

    /// Entfernt das Token aus beiden Mengen; unbekannte Anrufe sind kein Fehler
    pub fn freigeben(&self, call_id: &CallId) -> Option<ConcurrencyToken> {
        Self::entfernen(&mut self.inner.lock(), call_id)
    }

    /// Gibt nur frei, wenn das Token zur gemeldeten Kampagne gehoert
    pub fn freigeben_fuer(
        &self,
        call_id: &CallId,
        campaign_id: &CampaignId,
    ) -> AdmissionResult<Option<ConcurrencyToken>> {
        let mut inner = self.inner.lock();
        if let Some(token) = inner.global.get(call_id) {
            if &token.campaign_id != campaign_id {
                return Err(AdmissionError::KampagneAbweichend {
                    call_id: call_id.clone(),
                    token: token.campaign_id.clone(),
                    gemeldet: campaign_id.clone(),
                });
            }
        }
        Ok(Self::entfernen(&mut inner, call_id))
    }

    fn entfernen(inner: &mut LedgerInner, call_id: &CallId) -> Option<ConcurrencyToken> {
        inner.liveness.remove(call_id);
        let token = inner.global.remove(call_id)?;
        if let Some(menge) = inner.campaigns.get_mut(&token.campaign_id) {
            menge.remove(call_id);
            if menge.is_empty() {
                inner.campaigns.remove(&token.campaign_id);
            }
        }
        Some(token)
    }

    /// Erneuert den Liveness-Schluessel; `false` wenn kein Token existiert
    pub fn heartbeat_bei(&self, call_id: &CallId, jetzt: Instant) -> bool {
        let mut inner = self.inner.lock();
        if !inner.global.contains_key(call_id) {
            return false;
        }
        inner.liveness.insert(call_id.clone(), jetzt + self.ttl);
        true
    }

    /// Ob der Liveness-Schluessel zum Zeitpunkt noch existiert
    pub fn liveness_gueltig(&self, call_id: &CallId, jetzt: Instant) -> bool {
        self.inner
            .lock()
            .liveness
            .get(call_id)
            .map(|&ablauf| ablauf > jetzt)
            .unwrap_or(false)
    }

    /// Momentaufnahme aller Tokens
    pub fn tokens(&self) -> Vec<ConcurrencyToken> {
        self.inner.lock().global.values().cloned().collect()
    }

    pub fn anzahl(&self) -> usize {
        self.inner.lock().global.len()
    }

    pub fn campaign_anzahl(&self, campaign_id: &CampaignId) -> usize {
        self.inner
            .lock()
            .campaigns
            .get(campaign_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub fn enthaelt(&self, call_id: &CallId) -> bool {
        self.inner.lock().global.contains_key(call_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(global: u32, campaign: u32) -> TokenLedger {
        TokenLedger::neu(&AdmissionConfig {
            global_limit: global,
            campaign_limit: campaign,
            token_ttl_sek: 10,
            ..Default::default()
        })
    }

    #[test]
    fn globales_limit_ohne_campaign_mutation() {
        let l = ledger(1, 5);
        let t = Instant::now();
        let a = CampaignId::neu("a");
        l.registrieren_bei(&CallId::neu("1"), &a, t).unwrap();
        let e = l
            .registrieren_bei(&CallId::neu("2"), &CampaignId::neu("b"), t)
            .unwrap_err();
        assert_eq!(e, AdmissionError::GlobalesLimit { limit: 1 });
        assert_eq!(l.campaign_anzahl(&CampaignId::neu("b")), 0);
    }

    #[test]
    fn campaign_limit_nimmt_global_zurueck() {
        let l = ledger(10, 1);
        let t = Instant::now();
        let a = CampaignId::neu("a");
        l.registrieren_bei(&CallId::neu("1"), &a, t).unwrap();
        let e = l.registrieren_bei(&CallId::neu("2"), &a, t).unwrap_err();
        assert_eq!(e.scope(), "campaign");
        assert_eq!(l.anzahl(), 1);
        assert!(!l.enthaelt(&CallId::neu("2")));
        // Andere Kampagne ist unabhaengig
        assert!(l
            .registrieren_bei(&CallId::neu("3"), &CampaignId::neu("b"), t)
            .is_ok());
    }

    #[test]
    fn registrierung_ist_idempotent() {
        let l = ledger(1, 1);
        let t = Instant::now();
        let c = CallId::neu("1");
        let a = CampaignId::standard();
        assert_eq!(l.registrieren_bei(&c, &a, t), Ok(Registrierung::Neu));
        assert_eq!(l.registrieren_bei(&c, &a, t), Ok(Registrierung::Vorhanden));
        assert_eq!(l.anzahl(), 1);
    }

    #[test]
    fn freigabe_idempotent_ohne_unterlauf() {
        let l = ledger(2, 2);
        let t = Instant::now();
        assert!(l.freigeben(&CallId::neu("nie")).is_none());
        l.registrieren_bei(&CallId::neu("1"), &CampaignId::standard(), t)
            .unwrap();
        assert!(l.freigeben(&CallId::neu("1")).is_some());
        assert!(l.freigeben(&CallId::neu("1")).is_none());
        assert_eq!(l.anzahl(), 0);
        assert_eq!(l.campaign_anzahl(&CampaignId::standard()), 0);
    }

    #[test]
    fn liveness_laeuft_ab_und_wird_erneuert() {
        let l = ledger(2, 2);
        let t = Instant::now();
        let c = CallId::neu("1");
        l.registrieren_bei(&c, &CampaignId::standard(), t).unwrap();
        assert!(l.liveness_gueltig(&c, t + Duration::from_secs(9)));
        assert!(!l.liveness_gueltig(&c, t + Duration::from_secs(11)));

        assert!(l.heartbeat_bei(&c, t + Duration::from_secs(8)));
        assert!(l.liveness_gueltig(&c, t + Duration::from_secs(17)));
        assert!(!l.heartbeat_bei(&CallId::neu("x"), t));
    }

    #[test]
    fn freigabe_nur_fuer_die_eigene_kampagne() {
        let l = ledger(4, 4);
        let c = CallId::neu("1");
        l.registrieren_bei(&c, &CampaignId::neu("a"), Instant::now())
            .unwrap();

        let e = l.freigeben_fuer(&c, &CampaignId::neu("b")).unwrap_err();
        assert!(matches!(e, AdmissionError::KampagneAbweichend { .. }));
        assert!(l.enthaelt(&c));

        assert!(l.freigeben_fuer(&c, &CampaignId::neu("a")).unwrap().is_some());
        assert_eq!(l.campaign_anzahl(&CampaignId::neu("a")), 0);
        // Unbekannter Anruf: nichts freizugeben, kein Fehler
        assert!(l.freigeben_fuer(&c, &CampaignId::neu("b")).unwrap().is_none());
    }

    #[test]
    fn kampagnen_ueberschreibung() {
        let mut config = AdmissionConfig::default();
        config.campaign_limits.insert("vip".into(), 50);
        let l = TokenLedger::neu(&config);
        assert_eq!(l.limit_fuer(&CampaignId::neu("vip")), 50);
        assert_eq!(l.limit_fuer(&CampaignId::neu("x")), 20);
    }
}
