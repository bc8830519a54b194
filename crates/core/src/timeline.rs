//! Call-Timeline – geordnetes Ereignisprotokoll pro Anruf
//!
//! Jeder Zustandswechsel einer Session und ausgewaehlte Nachrichtentypen
//! werden hier in Anhaenge-Reihenfolge abgelegt. Ereignisse, die beim
//! Mandanten ankommen muessen, werden zusaetzlich in eine beschraenkte
//! Zustell-Queue gespiegelt (Webhook-Zustellung liegt ausserhalb).
//!
//! Der Reaper liest ueber [`TimelineStore::letztes_alter`] das Alter des
//! juengsten Ereignisses, um haengende Sessions zu erkennen.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::error::{CallbridgeError, Result};
use crate::types::CallId;

/// Bekannte Ereignisarten
pub mod art {
    pub const SESSION_CONNECTED: &str = "session.connected";
    pub const SESSION_ACTIVE: &str = "session.active";
    pub const SESSION_PAUSED: &str = "session.paused";
    pub const SESSION_RESUMED: &str = "session.resumed";
    pub const SESSION_CLOSED: &str = "session.closed";
    pub const SILENCE: &str = "silence";
    pub const STT_FINAL: &str = "stt.final";
    pub const LLM_REPLY: &str = "llm.reply";
    pub const BARGE_IN: &str = "control.bargein";
    pub const TOOL_CALL: &str = "tool.call";
    pub const DTMF: &str = "dtmf.send";
    pub const TRANSFER: &str = "transfer";
    pub const CONFIG: &str = "config.updated";
    pub const PROVIDER_FALLBACK: &str = "provider.fallback";
    pub const CALL_TIMEOUT: &str = "call.timeout";
    pub const CALL_STATUS: &str = "call.status";
}

/// Ereignisarten, die an Mandanten-Endpunkte zugestellt werden
const ZUSTELL_ARTEN: &[&str] = &[
    art::SESSION_CONNECTED,
    art::SESSION_ACTIVE,
    art::SESSION_CLOSED,
    art::TRANSFER,
    art::DTMF,
    art::TOOL_CALL,
    art::CALL_TIMEOUT,
    art::CALL_STATUS,
];

// ---------------------------------------------------------------------------
// TimelineEvent
// ---------------------------------------------------------------------------

/// Ein einzelnes Timeline-Ereignis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    pub id: Uuid,
    pub call_id: CallId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl TimelineEvent {
    /// Muss das Ereignis an den Mandanten zugestellt werden?
    pub fn ist_zustellpflichtig(&self) -> bool {
        ZUSTELL_ARTEN.contains(&self.kind.as_str())
    }
}

struct Eintrag {
    event: TimelineEvent,
    /// Monotoner Zeitpunkt fuer die Altersberechnung des Reapers
    zeitpunkt: Instant,
}

// ---------------------------------------------------------------------------
// TimelineStore
// ---------------------------------------------------------------------------

/// Prozessweiter Timeline-Speicher (guenstig klonbar)
#[derive(Clone)]
pub struct TimelineStore {
    inner: Arc<TimelineInner>,
}

struct TimelineInner {
    calls: DashMap<CallId, Vec<Eintrag>>,
    zustellung: mpsc::Sender<TimelineEvent>,
    verworfen: AtomicU64,
}

impl TimelineStore {
    /// Erstellt einen Store mit beschraenkter Zustell-Queue
    ///
    /// Gibt den Empfaenger der Queue zurueck; der Aufrufer ist fuer das
    /// Abarbeiten verantwortlich.
    pub fn neu(zustell_kapazitaet: usize) -> (Self, mpsc::Receiver<TimelineEvent>) {
        let (tx, rx) = mpsc::channel(zustell_kapazitaet.max(1));
        let store = Self {
            inner: Arc::new(TimelineInner {
                calls: DashMap::new(),
                zustellung: tx,
                verworfen: AtomicU64::new(0),
            }),
        };
        (store, rx)
    }

    /// Haengt ein Ereignis an die Timeline des Anrufs an
    pub fn anhaengen(
        &self,
        call_id: &CallId,
        kind: &str,
        payload: serde_json::Value,
    ) -> TimelineEvent {
        self.anhaengen_bei(call_id, kind, payload, Instant::now())
    }

    /// Wie [`anhaengen`](Self::anhaengen), mit explizitem Zeitpunkt
    pub fn anhaengen_bei(
        &self,
        call_id: &CallId,
        kind: &str,
        payload: serde_json::Value,
        jetzt: Instant,
    ) -> TimelineEvent {
        let event = TimelineEvent {
            id: Uuid::new_v4(),
            call_id: call_id.clone(),
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        };

        // Der Entry-Lock serialisiert Anhaenge pro Anruf
        self.inner
            .calls
            .entry(call_id.clone())
            .or_default()
            .push(Eintrag {
                event: event.clone(),
                zeitpunkt: jetzt,
            });

        tracing::debug!(call_id = %call_id, kind, "Timeline-Ereignis");

        if event.ist_zustellpflichtig() {
            if let Err(e) = self.zustellen(&event) {
                self.inner.verworfen.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    call_id = %call_id,
                    fehler = %e,
                    voruebergehend = e.ist_voruebergehend(),
                    "Ereignis nicht gespiegelt"
                );
            }
        }

        event
    }

    fn zustellen(&self, event: &TimelineEvent) -> Result<()> {
        self.inner
            .zustellung
            .try_send(event.clone())
            .map_err(|e| match e {
                TrySendError::Full(ev) => CallbridgeError::ZustellungVoll(ev.kind),
                TrySendError::Closed(ev) => CallbridgeError::ZustellungGeschlossen(ev.kind),
            })
    }

    /// Alle Ereignisse eines Anrufs in Anhaenge-Reihenfolge
    pub fn timeline(&self, call_id: &CallId) -> Vec<TimelineEvent> {
        self.inner
            .calls
            .get(call_id)
            .map(|eintraege| eintraege.iter().map(|e| e.event.clone()).collect())
            .unwrap_or_default()
    }

    /// Alter des juengsten Ereignisses (None wenn der Anruf keine Ereignisse hat)
    pub fn letztes_alter(&self, call_id: &CallId, jetzt: Instant) -> Option<Duration> {
        self.inner
            .calls
            .get(call_id)
            .and_then(|eintraege| eintraege.last().map(|e| e.zeitpunkt))
            .map(|zeitpunkt| jetzt.saturating_duration_since(zeitpunkt))
    }

    /// Entfernt Timelines, deren juengstes Ereignis aelter als `max_alter` ist
    ///
    /// Gibt die Anzahl entfernter Anrufe zurueck.
    pub fn aufraeumen(&self, max_alter: Duration, jetzt: Instant) -> usize {
        let vorher = self.inner.calls.len();
        self.inner.calls.retain(|_, eintraege| {
            eintraege
                .last()
                .map(|e| jetzt.saturating_duration_since(e.zeitpunkt) <= max_alter)
                .unwrap_or(false)
        });
        vorher - self.inner.calls.len()
    }

    /// Anzahl Anrufe mit Timeline
    pub fn anzahl_calls(&self) -> usize {
        self.inner.calls.len()
    }

    /// Anzahl Ereignisse, die wegen voller Zustell-Queue nicht gespiegelt wurden
    pub fn verworfen(&self) -> u64 {
        self.inner.verworfen.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ereignisse_in_anhaenge_reihenfolge() {
        let (store, _rx) = TimelineStore::neu(16);
        let call = CallId::neu("c1");
        store.anhaengen(&call, art::SESSION_CONNECTED, json!({}));
        store.anhaengen(&call, art::SESSION_ACTIVE, json!({"agentId": "a1"}));
        store.anhaengen(&call, art::SILENCE, json!({"ms": 3000}));

        let arten: Vec<String> = store.timeline(&call).into_iter().map(|e| e.kind).collect();
        assert_eq!(arten, vec!["session.connected", "session.active", "silence"]);
    }

    #[test]
    fn unbekannter_call_leer() {
        let (store, _rx) = TimelineStore::neu(4);
        assert!(store.timeline(&CallId::neu("x")).is_empty());
        assert!(store
            .letztes_alter(&CallId::neu("x"), Instant::now())
            .is_none());
    }

    #[tokio::test]
    async fn zustellpflichtige_ereignisse_gespiegelt() {
        let (store, mut rx) = TimelineStore::neu(4);
        let call = CallId::neu("c2");
        store.anhaengen(&call, art::SILENCE, json!({}));
        store.anhaengen(&call, art::CALL_TIMEOUT, json!({}));

        let gespiegelt = rx.recv().await.unwrap();
        assert_eq!(gespiegelt.kind, art::CALL_TIMEOUT);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn volle_queue_verwirft_nur_spiegelung() {
        let (store, _rx) = TimelineStore::neu(1);
        let call = CallId::neu("c3");
        store.anhaengen(&call, art::SESSION_CONNECTED, json!({}));
        store.anhaengen(&call, art::SESSION_ACTIVE, json!({}));
        assert_eq!(store.verworfen(), 1);
        assert_eq!(store.timeline(&call).len(), 2);
    }

    #[test]
    fn geschlossene_queue_endgueltig() {
        let (store, rx) = TimelineStore::neu(4);
        drop(rx);
        let event = store.anhaengen(&CallId::neu("c4"), art::SESSION_CLOSED, json!({}));
        let fehler = store.zustellen(&event).unwrap_err();
        assert!(matches!(fehler, CallbridgeError::ZustellungGeschlossen(ref k) if k == "session.closed"));
        assert!(!fehler.ist_voruebergehend());
        assert_eq!(store.verworfen(), 1);
    }

    #[test]
    fn alter_und_aufraeumen() {
        let (store, _rx) = TimelineStore::neu(4);
        let t0 = Instant::now();
        store.anhaengen_bei(&CallId::neu("alt"), art::SILENCE, json!({}), t0);
        store.anhaengen_bei(
            &CallId::neu("neu"),
            art::SILENCE,
            json!({}),
            t0 + Duration::from_secs(100),
        );

        let jetzt = t0 + Duration::from_secs(120);
        assert_eq!(
            store.letztes_alter(&CallId::neu("alt"), jetzt),
            Some(Duration::from_secs(120))
        );
        assert_eq!(store.aufraeumen(Duration::from_secs(60), jetzt), 1);
        assert_eq!(store.anzahl_calls(), 1);
    }
}
