//! # callbridge-observability
//!
//! Observability-Crate fuer Callbridge:
//! - Prometheus-kompatible Metriken (`/metrics`)
//! - Health-Check-Endpunkt (`/health`)
//! - Structured Logging via tracing-subscriber (text oder JSON)
//! - Request-Timing Middleware

pub mod health;
pub mod logging;
pub mod metrics;
pub mod middleware;

pub use health::{health_router, HealthResponse, HealthState, HealthStatus};
pub use logging::logging_initialisieren;
pub use metrics::{metrics_router, CallbridgeMetrics, MetrikQuellen};
pub use middleware::{request_timing_layer, timing_middleware};

use std::time::Duration;

use axum::Router;
use tokio::sync::watch;

/// Router mit `GET /metrics` und `GET /health`
pub fn observability_router(metriken: CallbridgeMetrics, health: HealthState) -> Router {
    Router::new()
        .merge(metrics_router(metriken))
        .merge(health_router(health))
}

/// Holt periodisch Snapshots und uebertraegt sie in Metriken und Health.
///
/// Laeuft bis zum Shutdown-Signal.
pub async fn aktualisierung_starten<F>(
    metriken: CallbridgeMetrics,
    health: HealthState,
    intervall: Duration,
    mut quellen: F,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    F: FnMut() -> MetrikQuellen + Send,
{
    let mut ticker = tokio::time::interval(intervall);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = quellen();
                metriken.aktualisieren(&snapshot);
                health.aktualisieren(&snapshot);
            }
            Ok(()) = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    health.herunterfahren_setzen();
                    tracing::debug!("Metrik-Aktualisierung beendet");
                    break;
                }
            }
        }
    }
}
