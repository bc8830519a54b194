//! AdmissionController – Fassade ueber Ledger, Breaker, IP-Schutz und Reaper
//!
//! Wird einmal beim Prozessstart erstellt und per `Arc` an Gateway und
//! Control-Plane weitergereicht. Einziger geteilter, veraenderlicher Zustand
//! zwischen Sessions.
//!
//! Ablauf einer Zulassung:
//! 1. Breaker fragen (offen → Ablehnung mit Wartezeit)
//! 2. Token registrieren (global, dann Kampagne)
//! 3. Aufrufer meldet das Ergebnis des Session-Aufbaus mit
//!    [`bestaetigen`](AdmissionController::bestaetigen) oder
//!    [`fehlschlag_melden`](AdmissionController::fehlschlag_melden), jeweils
//!    mit dem [`Versuch`] aus der Zulassung
//!
//! Kapazitaets-Ablehnungen sagen nichts ueber die Gesundheit des Pfads aus
//! und zaehlen nicht als Fehlschlag.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use callbridge_core::{CallId, CampaignId, TimelineStore};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::breaker::{BreakerStatus, CircuitBreaker, Versuch};
use crate::config::{AdmissionConfig, IpSchutzConfig};
use crate::error::{AdmissionError, AdmissionResult};
use crate::ip_guard::{IpEntscheidung, IpGuard};
use crate::ledger::{Registrierung, TokenLedger};
use crate::reaper::{Reaper, ReaperSnapshot};

/// Erfolgreiche Zulassung
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zulassung {
    pub call_id: CallId,
    pub campaign_id: CampaignId,
    pub registrierung: Registrierung,
    /// Breaker-Versuch, mit dem das Aufbau-Ergebnis gemeldet wird
    pub versuch: Versuch,
}

#[derive(Debug, Default)]
struct Zaehler {
    zugelassen: AtomicU64,
    abgelehnt_global: AtomicU64,
    abgelehnt_campaign: AtomicU64,
    abgelehnt_breaker: AtomicU64,
    abgelehnt_ip: AtomicU64,
    zwangsfreigaben: AtomicU64,
}

/// Momentaufnahme fuer Metriken und Health
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionSnapshot {
    pub zugelassen: u64,
    pub abgelehnt_global: u64,
    pub abgelehnt_campaign: u64,
    pub abgelehnt_breaker: u64,
    pub abgelehnt_ip: u64,
    pub zwangsfreigaben: u64,
    pub aktive_tokens: u64,
    pub breaker: BreakerStatus,
    pub reaper: ReaperSnapshot,
}

/// Zulassungskontrolle des Prozesses
pub struct AdmissionController {
    ledger: Arc<TokenLedger>,
    breaker: CircuitBreaker,
    ip_guard: IpGuard,
    reaper: Arc<Reaper>,
    zwangsfreigaben: broadcast::Sender<CallId>,
    ip_aufraeum_intervall: Duration,
    zaehler: Zaehler,
}

impl AdmissionController {
    pub fn neu(
        config: &AdmissionConfig,
        ip_config: &IpSchutzConfig,
        timeline: TimelineStore,
    ) -> AdmissionResult<Arc<Self>> {
        config.validieren().map_err(AdmissionError::Konfiguration)?;

        let ledger = Arc::new(TokenLedger::neu(config));
        let (zwangsfreigaben, _) = broadcast::channel(256);
        let reaper = Arc::new(Reaper::neu(
            Arc::clone(&ledger),
            timeline,
            config.call_timeout(),
            config.reaper_intervall(),
            zwangsfreigaben.clone(),
        ));

        Ok(Arc::new(Self {
            ledger,
            breaker: CircuitBreaker::neu(config.breaker_schwelle, config.breaker_cooldown()),
            ip_guard: IpGuard::neu(ip_config)?,
            reaper,
            zwangsfreigaben,
            ip_aufraeum_intervall: Duration::from_secs(ip_config.aufraeum_intervall_sek.max(1)),
            zaehler: Zaehler::default(),
        }))
    }

    pub fn zulassen(&self, call_id: &CallId, campaign_id: &CampaignId) -> AdmissionResult<Zulassung> {
        self.zulassen_bei(call_id, campaign_id, Instant::now())
    }

    /// Versucht einen Anruf zuzulassen
    pub fn zulassen_bei(
        &self,
        call_id: &CallId,
        campaign_id: &CampaignId,
        jetzt: Instant,
    ) -> AdmissionResult<Zulassung> {
        let versuch = match self.breaker.erlauben_bei(jetzt) {
            Ok(versuch) => versuch,
            Err(retry_after) => {
                self.zaehler.abgelehnt_breaker.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(call_id = %call_id, retry_ms = retry_after.as_millis() as u64, "Zulassung abgelehnt: Circuit Breaker offen");
                return Err(AdmissionError::BreakerOffen { retry_after });
            }
        };

        match self.ledger.registrieren_bei(call_id, campaign_id, jetzt) {
            Ok(registrierung) => {
                self.zaehler.zugelassen.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(call_id = %call_id, campaign = %campaign_id, ?registrierung, pruefung = versuch.ist_pruefung(), "Anruf zugelassen");
                Ok(Zulassung {
                    call_id: call_id.clone(),
                    campaign_id: campaign_id.clone(),
                    registrierung,
                    versuch,
                })
            }
            Err(e) => {
                self.breaker.abbrechen(versuch);
                match &e {
                    AdmissionError::GlobalesLimit { .. } => {
                        self.zaehler.abgelehnt_global.fetch_add(1, Ordering::Relaxed)
                    }
                    _ => self.zaehler.abgelehnt_campaign.fetch_add(1, Ordering::Relaxed),
                };
                tracing::warn!(call_id = %call_id, campaign = %campaign_id, scope = e.scope(), limit = e.limit(), "Zulassung abgelehnt");
                Err(e)
            }
        }
    }

    /// Session-Aufbau nach der Zulassung gelungen
    pub fn bestaetigen(&self, versuch: Versuch) {
        self.breaker.erfolg(versuch);
    }

    /// Session-Aufbau nach der Zulassung fehlgeschlagen (zaehlt fuer den Breaker)
    pub fn fehlschlag_melden(&self, versuch: Versuch) {
        self.breaker.fehlschlag(versuch);
    }

    /// Session-Aufbau ohne Aussage abgebrochen (z.B. Client getrennt)
    pub fn abbrechen(&self, versuch: Versuch) {
        self.breaker.abbrechen(versuch);
    }

    /// Gibt das Token eines Anrufs frei; idempotent
    pub fn freigeben(&self, call_id: &CallId) -> bool {
        let freigegeben = self.ledger.freigeben(call_id).is_some();
        if freigegeben {
            tracing::debug!(call_id = %call_id, "Token freigegeben");
        }
        freigegeben
    }

    /// Gibt frei und benachrichtigt die laufende Session (z.B. Status-Webhook)
    pub fn zwangsfreigeben(&self, call_id: &CallId, grund: &str) -> bool {
        let freigegeben = self.freigeben(call_id);
        if freigegeben {
            self.zwangsfreigabe_melden(call_id, grund);
        }
        freigegeben
    }

    /// Wie [`zwangsfreigeben`](Self::zwangsfreigeben), aber nur fuer ein Token
    /// der genannten Kampagne
    pub fn zwangsfreigeben_fuer(
        &self,
        call_id: &CallId,
        campaign_id: &CampaignId,
        grund: &str,
    ) -> AdmissionResult<bool> {
        let freigegeben = self.ledger.freigeben_fuer(call_id, campaign_id)?.is_some();
        if freigegeben {
            tracing::debug!(call_id = %call_id, "Token freigegeben");
            self.zwangsfreigabe_melden(call_id, grund);
        }
        Ok(freigegeben)
    }

    fn zwangsfreigabe_melden(&self, call_id: &CallId, grund: &str) {
        self.zaehler.zwangsfreigaben.fetch_add(1, Ordering::Relaxed);
        tracing::info!(call_id = %call_id, grund, "Token zwangsweise freigegeben");
        if self.zwangsfreigaben.send(call_id.clone()).is_err() {
            tracing::debug!(call_id = %call_id, "Keine Session wartet auf die Zwangsfreigabe");
        }
    }

    /// Ob fuer den Anruf noch ein Token existiert
    pub fn ist_zugelassen(&self, call_id: &CallId) -> bool {
        self.ledger.enthaelt(call_id)
    }

    pub fn heartbeat(&self, call_id: &CallId) -> bool {
        self.ledger.heartbeat_bei(call_id, Instant::now())
    }

    pub fn ip_pruefen(&self, ip: IpAddr) -> AdmissionResult<IpEntscheidung> {
        self.ip_pruefen_bei(ip, Instant::now())
    }

    pub fn ip_pruefen_bei(&self, ip: IpAddr, jetzt: Instant) -> AdmissionResult<IpEntscheidung> {
        let ergebnis = self.ip_guard.pruefen_bei(ip, jetzt);
        if ergebnis.is_err() {
            self.zaehler.abgelehnt_ip.fetch_add(1, Ordering::Relaxed);
        }
        ergebnis
    }

    /// Empfaenger fuer Zwangsfreigaben (Reaper und Webhook)
    pub fn abonnieren_zwangsfreigaben(&self) -> broadcast::Receiver<CallId> {
        self.zwangsfreigaben.subscribe()
    }

    pub fn reaper(&self) -> Arc<Reaper> {
        Arc::clone(&self.reaper)
    }

    pub fn aktive_tokens(&self) -> usize {
        self.ledger.anzahl()
    }

    pub fn campaign_anzahl(&self, campaign_id: &CampaignId) -> usize {
        self.ledger.campaign_anzahl(campaign_id)
    }

    pub fn statistik(&self) -> AdmissionSnapshot {
        AdmissionSnapshot {
            zugelassen: self.zaehler.zugelassen.load(Ordering::Relaxed),
            abgelehnt_global: self.zaehler.abgelehnt_global.load(Ordering::Relaxed),
            abgelehnt_campaign: self.zaehler.abgelehnt_campaign.load(Ordering::Relaxed),
            abgelehnt_breaker: self.zaehler.abgelehnt_breaker.load(Ordering::Relaxed),
            abgelehnt_ip: self.zaehler.abgelehnt_ip.load(Ordering::Relaxed),
            zwangsfreigaben: self.zaehler.zwangsfreigaben.load(Ordering::Relaxed),
            aktive_tokens: self.ledger.anzahl() as u64,
            breaker: self.breaker.status(),
            reaper: self.reaper.snapshot(),
        }
    }

    /// Startet Reaper und IP-Aufraeumen bis zum Shutdown-Signal
    pub fn hintergrund_starten(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let reaper = Arc::clone(&self.reaper).starten(shutdown.clone());

        let controller = Arc::clone(self);
        let mut shutdown = shutdown;
        let aufraeumen = tokio::spawn(async move {
            let mut takt = tokio::time::interval(controller.ip_aufraeum_intervall);
            takt.tick().await;
            loop {
                tokio::select! {
                    _ = takt.tick() => {
                        let entfernt = controller.ip_guard.aufraeumen_bei(Instant::now());
                        if entfernt > 0 {
                            tracing::debug!(entfernt, "IP-Eintraege bereinigt");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });

        vec![reaper, aufraeumen]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerZustand;

    fn controller(global: u32, campaign: u32) -> Arc<AdmissionController> {
        let (timeline, _rx) = TimelineStore::neu(8);
        AdmissionController::neu(
            &AdmissionConfig {
                global_limit: global,
                campaign_limit: campaign,
                breaker_schwelle: 2,
                breaker_cooldown_sek: 10,
                ..Default::default()
            },
            &IpSchutzConfig::default(),
            timeline,
        )
        .unwrap()
    }

    #[test]
    fn zulassen_und_freigeben() {
        let c = controller(2, 2);
        let call = CallId::neu("a");
        let z = c.zulassen(&call, &CampaignId::standard()).unwrap();
        assert_eq!(z.registrierung, Registrierung::Neu);
        c.bestaetigen(z.versuch);
        assert_eq!(c.aktive_tokens(), 1);
        assert!(c.freigeben(&call));
        assert!(!c.freigeben(&call));
        assert_eq!(c.aktive_tokens(), 0);
    }

    #[test]
    fn kapazitaet_oeffnet_breaker_nicht() {
        let c = controller(1, 1);
        c.zulassen(&CallId::neu("a"), &CampaignId::standard()).unwrap();
        for i in 0..5 {
            let e = c
                .zulassen(&CallId::neu(format!("x{i}")), &CampaignId::standard())
                .unwrap_err();
            assert_eq!(e.scope(), "global");
        }
        let s = c.statistik();
        assert_eq!(s.breaker.zustand, BreakerZustand::Geschlossen);
        assert_eq!(s.abgelehnt_global, 5);
    }

    #[test]
    fn fehlschlaege_oeffnen_breaker() {
        let c = controller(10, 10);
        let t = Instant::now();
        for i in 0..2 {
            let call = CallId::neu(format!("f{i}"));
            let z = c.zulassen_bei(&call, &CampaignId::standard(), t).unwrap();
            c.freigeben(&call);
            c.fehlschlag_melden(z.versuch);
        }
        let e = c
            .zulassen_bei(&CallId::neu("neu"), &CampaignId::standard(), t)
            .unwrap_err();
        assert_eq!(e.scope(), "circuit");
        assert!(e.retry_after().is_some());
        assert_eq!(c.statistik().abgelehnt_breaker, 1);
    }

    #[test]
    fn zwangsfreigabe_wird_gemeldet() {
        let c = controller(2, 2);
        let mut rx = c.abonnieren_zwangsfreigaben();
        let call = CallId::neu("z");
        c.zulassen(&call, &CampaignId::standard()).unwrap();
        assert!(c.zwangsfreigeben(&call, "completed"));
        assert_eq!(rx.try_recv().unwrap(), call);
        assert!(!c.zwangsfreigeben(&call, "completed"));
        assert_eq!(c.statistik().zwangsfreigaben, 1);
    }

    #[test]
    fn halboffener_versuch_gehoert_der_zulassung() {
        let c = controller(10, 10);
        let t = Instant::now();
        // Vor dem Oeffnen zugelassen, Aufbau dauert an
        let alt = c.zulassen_bei(&CallId::neu("alt"), &CampaignId::standard(), t).unwrap();
        for i in 0..2 {
            let z = c
                .zulassen_bei(&CallId::neu(format!("f{i}")), &CampaignId::standard(), t)
                .unwrap();
            c.fehlschlag_melden(z.versuch);
        }
        let spaeter = t + Duration::from_secs(10);
        let pruefung = c
            .zulassen_bei(&CallId::neu("pruefung"), &CampaignId::standard(), spaeter)
            .unwrap();
        assert!(pruefung.versuch.ist_pruefung());

        c.abbrechen(alt.versuch);
        c.bestaetigen(alt.versuch);
        assert_eq!(c.statistik().breaker.zustand, BreakerZustand::HalbOffen);
        let e = c
            .zulassen_bei(&CallId::neu("zweite"), &CampaignId::standard(), spaeter)
            .unwrap_err();
        assert_eq!(e.scope(), "circuit");

        c.bestaetigen(pruefung.versuch);
        assert_eq!(c.statistik().breaker.zustand, BreakerZustand::Geschlossen);
    }
}
