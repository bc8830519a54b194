//! Werkzeug-Aufrufe der Reasoning-Engine
//!
//! Ein Aufruf sendet `tool.call` an den Client und wartet auf das passende
//! `tool.result`. Der Orchestrierungsschritt ruht bis dahin; bei Zeitlimit
//! oder Barge-in wird der offene Aufruf verworfen.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use callbridge_core::timeline::art;
use callbridge_core::{CallId, TimelineStore};
use callbridge_protocol::OutboundMessage;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::provider::{ProviderError, ProviderResult};

pub struct ToolBroker {
    call_id: CallId,
    ausgang: mpsc::Sender<OutboundMessage>,
    timeline: TimelineStore,
    offen: DashMap<String, oneshot::Sender<Value>>,
    timeout_ms: AtomicU64,
}

impl ToolBroker {
    pub fn neu(
        call_id: CallId,
        ausgang: mpsc::Sender<OutboundMessage>,
        timeline: TimelineStore,
        timeout: Duration,
    ) -> Self {
        Self {
            call_id,
            ausgang,
            timeline,
            offen: DashMap::new(),
            timeout_ms: AtomicU64::new(timeout.as_millis() as u64),
        }
    }

    pub fn timeout_setzen(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Ruft ein Werkzeug beim Client auf und wartet auf das Ergebnis
    pub async fn aufrufen(&self, name: &str, arguments: Value) -> ProviderResult<Value> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.offen.insert(id.clone(), tx);

        self.timeline.anhaengen(
            &self.call_id,
            art::TOOL_CALL,
            serde_json::json!({ "id": id, "name": name }),
        );
        tracing::debug!(call_id = %self.call_id, tool = name, id = %id, "Werkzeug-Aufruf");

        let aufruf = OutboundMessage::ToolCall {
            id: id.clone(),
            name: name.to_string(),
            arguments,
        };
        if self.ausgang.send(aufruf).await.is_err() {
            self.offen.remove(&id);
            return Err(ProviderError::Abgebrochen);
        }

        let ms = self.timeout_ms.load(Ordering::Relaxed);
        let ergebnis = tokio::time::timeout(Duration::from_millis(ms), rx).await;
        self.offen.remove(&id);
        match ergebnis {
            Ok(Ok(wert)) => Ok(wert),
            Ok(Err(_)) => Err(ProviderError::Abgebrochen),
            Err(_) => {
                tracing::warn!(call_id = %self.call_id, tool = name, id = %id, "Werkzeug-Zeitlimit");
                Err(ProviderError::Zeitlimit { provider: "tool", ms })
            }
        }
    }

    /// Liefert ein `tool.result`; `false` fuer unbekannte oder abgelaufene IDs
    pub fn ergebnis(&self, id: &str, result: Value) -> bool {
        match self.offen.remove(id) {
            Some((_, tx)) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Verwirft alle offenen Aufrufe
    pub fn abbrechen(&self) {
        self.offen.clear();
    }

    pub fn offene(&self) -> usize {
        self.offen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn broker(timeout_ms: u64) -> (Arc<ToolBroker>, mpsc::Receiver<OutboundMessage>, TimelineStore) {
        let (tx, rx) = mpsc::channel(8);
        let (timeline, _zustellung) = TimelineStore::neu(8);
        let b = ToolBroker::neu(
            CallId::neu("c1"),
            tx,
            timeline.clone(),
            Duration::from_millis(timeout_ms),
        );
        (Arc::new(b), rx, timeline)
    }

    #[tokio::test]
    async fn aufruf_und_ergebnis() {
        let (b, mut rx, timeline) = broker(1_000);
        let aufrufer = Arc::clone(&b);
        let task = tokio::spawn(async move {
            aufrufer
                .aufrufen("lookup", serde_json::json!({"kunde": 7}))
                .await
        });

        let id = match rx.recv().await.unwrap() {
            OutboundMessage::ToolCall { id, name, .. } => {
                assert_eq!(name, "lookup");
                id
            }
            andere => panic!("unerwartet: {andere:?}"),
        };
        assert!(!b.ergebnis("unbekannt", Value::Null));
        assert!(b.ergebnis(&id, serde_json::json!({"status": "gold"})));

        let wert = task.await.unwrap().unwrap();
        assert_eq!(wert["status"], "gold");
        assert_eq!(b.offene(), 0);
        assert_eq!(timeline.timeline(&CallId::neu("c1"))[0].kind, art::TOOL_CALL);
    }

    #[tokio::test(start_paused = true)]
    async fn zeitlimit() {
        let (b, _rx, _timeline) = broker(500);
        let e = b.aufrufen("lookup", Value::Null).await.unwrap_err();
        assert_eq!(
            e,
            ProviderError::Zeitlimit {
                provider: "tool",
                ms: 500
            }
        );
        assert_eq!(b.offene(), 0);
    }
}
