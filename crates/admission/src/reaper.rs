//! Reaper fuer haengende Sessions
//!
//! Laeuft in festem Intervall ueber alle Tokens:
//! - Liveness-Schluessel abgelaufen → Zwangsfreigabe, zaehlt als Leak
//! - Letztes Timeline-Ereignis aelter als der Call-Timeout → `call.timeout`
//!   in die Timeline, Zwangsfreigabe, zaehlt als Timeout
//!
//! Jede Zwangsfreigabe wird auf einem Broadcast-Kanal gemeldet, damit die
//! betroffene Session sich schliessen kann.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use callbridge_core::timeline::art;
use callbridge_core::{CallId, TimelineStore};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::ledger::TokenLedger;

/// Ergebnis eines Durchlaufs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepErgebnis {
    pub leaks: Vec<CallId>,
    pub timeouts: Vec<CallId>,
}

impl SweepErgebnis {
    pub fn anzahl(&self) -> usize {
        self.leaks.len() + self.timeouts.len()
    }
}

/// Gauges und Zaehler des Reapers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperSnapshot {
    /// Im letzten Durchlauf gefundene haengende Sessions
    pub stuck_aktuell: u64,
    pub aktive_tokens: u64,
    pub max_tokens: u64,
    pub leaks_gesamt: u64,
    pub timeouts_gesamt: u64,
    pub durchlaeufe: u64,
}

#[derive(Debug, Default)]
struct ReaperZaehler {
    stuck_aktuell: AtomicU64,
    leaks: AtomicU64,
    timeouts: AtomicU64,
    durchlaeufe: AtomicU64,
}

/// Periodischer Aufraeumer fuer Concurrency-Tokens
pub struct Reaper {
    ledger: Arc<TokenLedger>,
    timeline: TimelineStore,
    call_timeout: Duration,
    intervall: Duration,
    zwangsfreigaben: broadcast::Sender<CallId>,
    zaehler: ReaperZaehler,
}

impl Reaper {
    pub fn neu(
        ledger: Arc<TokenLedger>,
        timeline: TimelineStore,
        call_timeout: Duration,
        intervall: Duration,
        zwangsfreigaben: broadcast::Sender<CallId>,
    ) -> Self {
        Self {
            ledger,
            timeline,
            call_timeout,
            intervall,
            zwangsfreigaben,
            zaehler: ReaperZaehler::default(),
        }
    }

    pub fn sweep(&self) -> SweepErgebnis {
        self.sweep_bei(Instant::now())
    }

    /// Ein Durchlauf ueber alle registrierten Tokens
    pub fn sweep_bei(&self, jetzt: Instant) -> SweepErgebnis {
        let mut ergebnis = SweepErgebnis::default();

        for token in self.ledger.tokens() {
            let call_id = &token.call_id;

            if !self.ledger.liveness_gueltig(call_id, jetzt) {
                if self.ledger.freigeben(call_id).is_some() {
                    tracing::warn!(call_id = %call_id, campaign = %token.campaign_id, "Token ohne Liveness freigegeben (Leak)");
                    let _ = self.zwangsfreigaben.send(call_id.clone());
                    ergebnis.leaks.push(call_id.clone());
                }
                continue;
            }

            let alter = self
                .timeline
                .letztes_alter(call_id, jetzt)
                .unwrap_or_else(|| jetzt.saturating_duration_since(token.issued_at));
            if alter > self.call_timeout {
                self.timeline.anhaengen_bei(
                    call_id,
                    art::CALL_TIMEOUT,
                    serde_json::json!({
                        "reason": "inactive",
                        "idleSeconds": alter.as_secs(),
                    }),
                    jetzt,
                );
                if self.ledger.freigeben(call_id).is_some() {
                    tracing::warn!(call_id = %call_id, alter_sek = alter.as_secs(), "Haengende Session freigegeben (Timeout)");
                    let _ = self.zwangsfreigaben.send(call_id.clone());
                    ergebnis.timeouts.push(call_id.clone());
                }
            }
        }

        self.zaehler
            .stuck_aktuell
            .store(ergebnis.anzahl() as u64, Ordering::Relaxed);
        self.zaehler
            .leaks
            .fetch_add(ergebnis.leaks.len() as u64, Ordering::Relaxed);
        self.zaehler
            .timeouts
            .fetch_add(ergebnis.timeouts.len() as u64, Ordering::Relaxed);
        self.zaehler.durchlaeufe.fetch_add(1, Ordering::Relaxed);

        if ergebnis.anzahl() > 0 {
            tracing::info!(
                leaks = ergebnis.leaks.len(),
                timeouts = ergebnis.timeouts.len(),
                aktiv = self.ledger.anzahl(),
                "Reaper-Durchlauf"
            );
        }
        ergebnis
    }

    pub fn snapshot(&self) -> ReaperSnapshot {
        ReaperSnapshot {
            stuck_aktuell: self.zaehler.stuck_aktuell.load(Ordering::Relaxed),
            aktive_tokens: self.ledger.anzahl() as u64,
            max_tokens: self.ledger.global_limit() as u64,
            leaks_gesamt: self.zaehler.leaks.load(Ordering::Relaxed),
            timeouts_gesamt: self.zaehler.timeouts.load(Ordering::Relaxed),
            durchlaeufe: self.zaehler.durchlaeufe.load(Ordering::Relaxed),
        }
    }

    /// Startet den periodischen Durchlauf bis zum Shutdown-Signal
    pub fn starten(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut takt = tokio::time::interval(self.intervall);
            takt.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Der erste Tick kommt sofort
            takt.tick().await;
            tracing::info!(intervall_sek = self.intervall.as_secs(), "Reaper gestartet");

            loop {
                tokio::select! {
                    _ = takt.tick() => {
                        self.sweep();
                    }
                    _ = shutdown.changed() => {
                        tracing::debug!("Reaper beendet");
                        break;
                    }
                }
            }
        })
    }
}
