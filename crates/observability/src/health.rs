//! Health-Check-Endpunkt fuer Callbridge
//!
//! Endpoint: `GET /health`
//! Response: JSON mit Status, Version, Uptime, laufenden Sessions und
//! Zustand des Circuit Breakers. Waehrend des Shutdowns antwortet der
//! Endpunkt mit 503, damit der Load Balancer keine Anrufe mehr zuteilt.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use callbridge_admission::BreakerZustand;
use serde::{Deserialize, Serialize};

use crate::metrics::MetrikQuellen;

/// Status des Health-Checks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Antwort des Health-Check-Endpunkts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub active_sessions: u64,
    pub circuit_breaker: String,
    pub timestamp: String,
}

const BREAKER_GESCHLOSSEN: u8 = 0;
const BREAKER_HALB_OFFEN: u8 = 1;
const BREAKER_OFFEN: u8 = 2;

/// Geteilter Zustand fuer den Health-Check-Handler
#[derive(Clone)]
pub struct HealthState {
    start_time: Arc<Instant>,
    aktive_sessions: Arc<AtomicU64>,
    breaker: Arc<AtomicU8>,
    herunterfahren: Arc<AtomicBool>,
}

impl HealthState {
    pub fn neu() -> Self {
        Self {
            start_time: Arc::new(Instant::now()),
            aktive_sessions: Arc::new(AtomicU64::new(0)),
            breaker: Arc::new(AtomicU8::new(BREAKER_GESCHLOSSEN)),
            herunterfahren: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Uebernimmt Sessions und Breaker-Zustand aus den Snapshots
    pub fn aktualisieren(&self, quellen: &MetrikQuellen) {
        if let Some(g) = &quellen.gateway {
            self.aktive_sessions.store(g.sessions_aktiv, Ordering::Relaxed);
        }
        if let Some(a) = &quellen.admission {
            let wert = match a.breaker.zustand {
                BreakerZustand::Geschlossen => BREAKER_GESCHLOSSEN,
                BreakerZustand::HalbOffen => BREAKER_HALB_OFFEN,
                BreakerZustand::Offen => BREAKER_OFFEN,
            };
            self.breaker.store(wert, Ordering::Relaxed);
        }
    }

    pub fn herunterfahren_setzen(&self) {
        self.herunterfahren.store(true, Ordering::Relaxed);
    }

    pub fn status(&self) -> HealthStatus {
        if self.herunterfahren.load(Ordering::Relaxed) {
            return HealthStatus::Unhealthy;
        }
        match self.breaker.load(Ordering::Relaxed) {
            BREAKER_GESCHLOSSEN => HealthStatus::Healthy,
            _ => HealthStatus::Degraded,
        }
    }

    fn breaker_name(&self) -> &'static str {
        match self.breaker.load(Ordering::Relaxed) {
            BREAKER_GESCHLOSSEN => "closed",
            BREAKER_HALB_OFFEN => "half-open",
            _ => "open",
        }
    }

    pub fn antwort(&self) -> HealthResponse {
        HealthResponse {
            status: self.status(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.uptime_seconds(),
            active_sessions: self.aktive_sessions.load(Ordering::Relaxed),
            circuit_breaker: self.breaker_name().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::neu()
    }
}

/// Axum-Router fuer den `/health`-Endpunkt
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
}

/// `GET /health` – gibt den Serverstatus zurueck
async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let response = state.antwort();
    let http_status = match response.status {
        // 200 auch bei degraded, der Health-Check soll nicht failen
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (http_status, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use callbridge_admission::{AdmissionSnapshot, BreakerStatus, ReaperSnapshot};
    use callbridge_gateway::GatewaySnapshot;

    fn mit_breaker(zustand: BreakerZustand) -> MetrikQuellen {
        MetrikQuellen {
            admission: Some(AdmissionSnapshot {
                zugelassen: 0,
                abgelehnt_global: 0,
                abgelehnt_campaign: 0,
                abgelehnt_breaker: 0,
                abgelehnt_ip: 0,
                zwangsfreigaben: 0,
                aktive_tokens: 0,
                breaker: BreakerStatus {
                    zustand,
                    fehler_folge: 0,
                    letzter_fehler: None,
                    naechster_versuch: None,
                },
                reaper: ReaperSnapshot::default(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn frisch_gestartet_ist_healthy() {
        let state = HealthState::neu();
        assert!(state.uptime_seconds() < 5);
        assert_eq!(state.status(), HealthStatus::Healthy);
        assert_eq!(state.antwort().circuit_breaker, "closed");
    }

    #[test]
    fn offener_breaker_ist_degraded() {
        let state = HealthState::neu();
        state.aktualisieren(&mit_breaker(BreakerZustand::Offen));
        assert_eq!(state.status(), HealthStatus::Degraded);
        assert_eq!(state.antwort().circuit_breaker, "open");

        state.aktualisieren(&mit_breaker(BreakerZustand::Geschlossen));
        assert_eq!(state.status(), HealthStatus::Healthy);
    }

    #[test]
    fn shutdown_ist_unhealthy() {
        let state = HealthState::neu();
        state.herunterfahren_setzen();
        assert_eq!(state.status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn sessions_aus_gateway_snapshot() {
        let state = HealthState::neu();
        state.aktualisieren(&MetrikQuellen {
            gateway: Some(GatewaySnapshot {
                sessions_aktiv: 4,
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(state.antwort().active_sessions, 4);
    }

    #[test]
    fn health_response_serialisierung() {
        let state = HealthState::neu();
        let json = serde_json::to_string(&state.antwort()).unwrap();
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(json.contains("\"circuit_breaker\":\"closed\""));
        assert!(json.contains("\"uptime_seconds\":"));
    }
}
