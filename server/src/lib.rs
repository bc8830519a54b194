//! callbridge-server – Bibliotheks-Root
//!
//! Verdrahtet Zulassungskontrolle, Session-Gateway, Media-Bridge und die
//! HTTP-Schnittstelle (Metriken, Health, Control-Webhooks) zu einem Prozess.

pub mod config;
pub mod control;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use callbridge_admission::AdmissionController;
use callbridge_core::{TimelineEvent, TimelineStore};
use callbridge_gateway::{
    EchoReasoner, EnergieRecognizer, GatewayServer, GatewayState, ProviderSet, TonSynthesizer,
};
use callbridge_media::MediaBridge;
use callbridge_observability::{
    observability_router, request_timing_layer, timing_middleware, CallbridgeMetrics,
    HealthState, MetrikQuellen,
};
use config::ServerConfig;
use control::{control_router, ControlState};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

/// Haelt den laufenden Server-Zustand zusammen
pub struct Server {
    pub config: ServerConfig,
}

impl Server {
    /// Erstellt einen neuen Server aus der gegebenen Konfiguration
    pub fn neu(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Startet alle Subsysteme und laeuft bis zum Shutdown-Signal
    ///
    /// Reihenfolge:
    /// 1. Timeline und Zustell-Queue
    /// 2. Zulassungskontrolle mit Reaper und IP-Aufraeumen
    /// 3. Session-Gateway (Framed TCP)
    /// 4. HTTP: Metriken, Health, Control-Routen
    /// 5. Auf das Shutdown-Signal warten, Sessions auslaufen lassen
    pub async fn starten(self, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let config = self.config;
        config.validieren()?;

        let (timeline, zustellung) = TimelineStore::neu(config.observability.zustell_kapazitaet);
        let mut hintergrund: Vec<JoinHandle<()>> = vec![
            tokio::spawn(zustellung_abarbeiten(zustellung)),
            tokio::spawn(timeline_aufraeumen(
                timeline.clone(),
                Duration::from_secs(config.observability.timeline_max_alter_sek.max(60)),
                shutdown_rx.clone(),
            )),
        ];

        let admission = AdmissionController::neu(&config.admission, &config.ip_schutz, timeline.clone())
            .context("Zulassungskontrolle")?;
        hintergrund.extend(admission.hintergrund_starten(shutdown_rx.clone()));

        let provider = ProviderSet::neu(
            Arc::new(EnergieRecognizer::default()),
            Arc::new(EchoReasoner),
            Arc::new(TonSynthesizer),
        );
        let gateway_state = GatewayState::neu(
            config.gateway_config(),
            Arc::clone(&admission),
            timeline.clone(),
            provider,
        )
        .context("Session-Gateway")?;

        let bridge = config
            .bridge
            .aktiviert
            .then(|| MediaBridge::neu(config.bridge_config()));

        let session_addr = config.session_bind_adresse()?;
        tracing::info!(
            session = %session_addr,
            http = %config.http_bind_adresse()?,
            bridge = bridge.is_some(),
            global_limit = config.admission.global_limit,
            "Server startet"
        );

        let gateway = GatewayServer::neu(Arc::clone(&gateway_state), session_addr);
        let gateway_task = tokio::spawn(gateway.starten(shutdown_rx.clone()));

        let http_task = if config.observability.aktiviert {
            let metriken = CallbridgeMetrics::neu()?;
            let health = HealthState::neu();

            let gateway_statistik = Arc::clone(&gateway_state.statistik);
            let bridge_statistik = bridge.as_ref().map(MediaBridge::statistik);
            let quellen_admission = Arc::clone(&admission);
            hintergrund.push(tokio::spawn(callbridge_observability::aktualisierung_starten(
                metriken.clone(),
                health.clone(),
                Duration::from_millis(config.observability.metrik_intervall_ms),
                move || MetrikQuellen {
                    gateway: Some(gateway_statistik.snapshot()),
                    admission: Some(quellen_admission.statistik()),
                    bridge: bridge_statistik.as_ref().map(|s| s.snapshot()),
                },
                shutdown_rx.clone(),
            )));

            let control = ControlState::neu(
                Arc::clone(&admission),
                timeline.clone(),
                bridge,
                config.auth.api_key.clone(),
                shutdown_rx.clone(),
            );
            if control.api_key.is_none() {
                tracing::warn!("Kein API-Key konfiguriert, Control-Routen sind ungeschuetzt");
            }
            let app = observability_router(metriken.clone(), health)
                .merge(control_router(control))
                .layer(axum::middleware::from_fn_with_state(metriken, timing_middleware))
                .layer(cors_layer(&config.netzwerk.cors_origins))
                .layer(request_timing_layer());

            let http_addr = config.http_bind_adresse()?;
            let listener = tokio::net::TcpListener::bind(http_addr)
                .await
                .with_context(|| format!("HTTP-Port {http_addr} nicht verfuegbar"))?;
            tracing::info!(adresse = %http_addr, "HTTP-Schnittstelle gestartet");

            let mut shutdown = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                let signal = async move {
                    while shutdown.changed().await.is_ok() {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                };
                if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(signal).await {
                    tracing::error!(fehler = %e, "HTTP-Server beendet mit Fehler");
                }
            }))
        } else {
            None
        };

        let gateway_ergebnis = gateway_task.await.context("Gateway-Task abgestuerzt")?;
        if let Some(task) = http_task {
            let _ = task.await;
        }
        for task in hintergrund {
            task.abort();
        }
        gateway_ergebnis.context("Session-Gateway")?;

        tracing::info!(
            offene_tokens = admission.aktive_tokens(),
            "Server beendet"
        );
        Ok(())
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    }
    let erlaubt: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new()
        .allow_origin(erlaubt)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Arbeitet die Zustell-Queue der Timeline ab
///
/// Die eigentliche Webhook-Zustellung an Mandanten liegt ausserhalb des
/// Prozesses; hier wird jedes zustellpflichtige Ereignis protokolliert.
pub async fn zustellung_abarbeiten(mut zustellung: mpsc::Receiver<TimelineEvent>) {
    while let Some(event) = zustellung.recv().await {
        tracing::info!(
            call_id = %event.call_id,
            art = %event.kind,
            id = %event.id,
            "Ereignis zur Zustellung"
        );
    }
    tracing::debug!("Zustell-Queue geschlossen");
}

async fn timeline_aufraeumen(
    timeline: TimelineStore,
    max_alter: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut takt = tokio::time::interval(Duration::from_secs(60));
    takt.tick().await;
    loop {
        tokio::select! {
            _ = takt.tick() => {
                let entfernt = timeline.aufraeumen(max_alter, std::time::Instant::now());
                if entfernt > 0 {
                    tracing::debug!(entfernt, "Alte Timelines verworfen");
                }
            }
            Ok(()) = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callbridge_core::CallId;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn aufraeumen_endet_mit_shutdown() {
        let (timeline, _rx) = TimelineStore::neu(8);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(timeline_aufraeumen(timeline, Duration::from_secs(60), rx));
        tokio::time::sleep(Duration::from_secs(120)).await;
        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn zustellung_laeuft_bis_queue_geschlossen() {
        let (timeline, rx) = TimelineStore::neu(8);
        let task = tokio::spawn(zustellung_abarbeiten(rx));
        timeline.anhaengen(&CallId::neu("c1"), "session.closed", json!({}));
        drop(timeline);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn ungueltige_konfiguration_startet_nicht() {
        let (_tx, rx) = watch::channel(false);
        let ergebnis = Server::neu(ServerConfig::default()).starten(rx).await;
        assert!(ergebnis.is_err());
    }
}
