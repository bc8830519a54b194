//! Prometheus-kompatible Metriken fuer Callbridge
//!
//! Registrierte Metriken:
//! - `callbridge_sessions_active` – Gauge: Laufende Sessions
//! - `callbridge_sessions_total` – Counter: Angenommene Sessions
//! - `callbridge_admission_tokens_active` – Gauge: Vergebene Concurrency-Tokens
//! - `callbridge_admission_rejections_total` – Counter (scope): Abgelehnte Zulassungen
//! - `callbridge_admission_forced_releases_total` – Counter: Zwangsfreigaben
//! - `callbridge_reaper_stuck_sessions` – Gauge: Haengende Sessions im letzten Lauf
//! - `callbridge_reaper_reaped_total` – Counter (reason): Vom Reaper freigegebene Tokens
//! - `callbridge_circuit_breaker_state` – Gauge: 0 geschlossen, 1 halb offen, 2 offen
//! - `callbridge_jitter_packets_total` – Counter (outcome): spaet / verdeckt
//! - `callbridge_rtp_packets_total` – Counter (direction): Media-Bridge
//! - `callbridge_rtp_dropped_total` – Counter (reason): Verworfene RTP-Pakete
//! - `callbridge_http_requests_total` – Counter (method, path, status)
//! - `callbridge_http_request_duration_seconds` – Histogram (method, path)
//!
//! Die Zaehler der Komponenten sind kumulative Atomics; [`CallbridgeMetrics::aktualisieren`]
//! uebertraegt deren Snapshots in die Registry.

use std::sync::Arc;

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use callbridge_admission::AdmissionSnapshot;
use callbridge_gateway::GatewaySnapshot;
use callbridge_media::BridgeSnapshot;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Alle Callbridge-Prometheus-Metriken
#[derive(Clone)]
pub struct CallbridgeMetrics {
    pub registry: Arc<Registry>,

    // Sessions
    pub sessions_active: IntGauge,
    pub sessions_total: IntCounter,

    // Zulassung
    pub admission_tokens_active: IntGauge,
    pub admission_rejections_total: IntCounterVec,
    pub admission_forced_releases_total: IntCounter,
    pub reaper_stuck_sessions: IntGauge,
    pub reaper_reaped_total: IntCounterVec,
    pub circuit_breaker_state: IntGauge,

    // Medien
    pub jitter_packets_total: IntCounterVec,
    pub rtp_packets_total: IntCounterVec,
    pub rtp_dropped_total: IntCounterVec,

    // HTTP-Metriken
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,
}

/// Snapshots aller Komponenten zu einem Zeitpunkt
#[derive(Debug, Clone, Default)]
pub struct MetrikQuellen {
    pub gateway: Option<GatewaySnapshot>,
    pub admission: Option<AdmissionSnapshot>,
    pub bridge: Option<BridgeSnapshot>,
}

impl CallbridgeMetrics {
    /// Erstellt und registriert alle Metriken in einer neuen Registry
    pub fn neu() -> Result<Self> {
        let registry = Registry::new();

        // --- Sessions ---
        let sessions_active = IntGauge::with_opts(Opts::new(
            "callbridge_sessions_active",
            "Anzahl laufender Sessions",
        ))?;
        registry.register(Box::new(sessions_active.clone()))?;

        let sessions_total = IntCounter::with_opts(Opts::new(
            "callbridge_sessions_total",
            "Gesamtanzahl angenommener Sessions",
        ))?;
        registry.register(Box::new(sessions_total.clone()))?;

        // --- Zulassung ---
        let admission_tokens_active = IntGauge::with_opts(Opts::new(
            "callbridge_admission_tokens_active",
            "Aktuell vergebene Concurrency-Tokens",
        ))?;
        registry.register(Box::new(admission_tokens_active.clone()))?;

        let admission_rejections_total = IntCounterVec::new(
            Opts::new(
                "callbridge_admission_rejections_total",
                "Abgelehnte Zulassungen nach Geltungsbereich",
            ),
            &["scope"],
        )?;
        registry.register(Box::new(admission_rejections_total.clone()))?;

        let admission_forced_releases_total = IntCounter::with_opts(Opts::new(
            "callbridge_admission_forced_releases_total",
            "Zwangsweise freigegebene Tokens",
        ))?;
        registry.register(Box::new(admission_forced_releases_total.clone()))?;

        let reaper_stuck_sessions = IntGauge::with_opts(Opts::new(
            "callbridge_reaper_stuck_sessions",
            "Im letzten Reaper-Lauf gefundene haengende Sessions",
        ))?;
        registry.register(Box::new(reaper_stuck_sessions.clone()))?;

        let reaper_reaped_total = IntCounterVec::new(
            Opts::new(
                "callbridge_reaper_reaped_total",
                "Vom Reaper freigegebene Tokens",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(reaper_reaped_total.clone()))?;

        let circuit_breaker_state = IntGauge::with_opts(Opts::new(
            "callbridge_circuit_breaker_state",
            "Circuit Breaker: 0 geschlossen, 1 halb offen, 2 offen",
        ))?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        // --- Medien ---
        let jitter_packets_total = IntCounterVec::new(
            Opts::new(
                "callbridge_jitter_packets_total",
                "Jitter-Buffer: verspaetete und verdeckte Pakete",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(jitter_packets_total.clone()))?;

        let rtp_packets_total = IntCounterVec::new(
            Opts::new("callbridge_rtp_packets_total", "RTP-Pakete der Media-Bridge"),
            &["direction"],
        )?;
        registry.register(Box::new(rtp_packets_total.clone()))?;

        let rtp_dropped_total = IntCounterVec::new(
            Opts::new(
                "callbridge_rtp_dropped_total",
                "Verworfene RTP-Pakete der Media-Bridge",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(rtp_dropped_total.clone()))?;

        // --- HTTP-Metriken ---
        let http_requests_total = IntCounterVec::new(
            Opts::new("callbridge_http_requests_total", "Gesamtanzahl HTTP-Anfragen"),
            &["method", "path", "status"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "callbridge_http_request_duration_seconds",
                "HTTP-Antwortzeit in Sekunden",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
            &["method", "path"],
        )?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            sessions_active,
            sessions_total,
            admission_tokens_active,
            admission_rejections_total,
            admission_forced_releases_total,
            reaper_stuck_sessions,
            reaper_reaped_total,
            circuit_breaker_state,
            jitter_packets_total,
            rtp_packets_total,
            rtp_dropped_total,
            http_requests_total,
            http_request_duration_seconds,
        })
    }

    /// Uebertraegt die Snapshots der Komponenten in die Registry
    pub fn aktualisieren(&self, quellen: &MetrikQuellen) {
        if let Some(g) = &quellen.gateway {
            self.sessions_active.set(als_i64(g.sessions_aktiv));
            nachziehen(&self.sessions_total, g.sessions_gesamt);
            nachziehen(
                &self.jitter_packets_total.with_label_values(&["late"]),
                g.pakete_spaet,
            );
            nachziehen(
                &self.jitter_packets_total.with_label_values(&["concealed"]),
                g.pakete_verdeckt,
            );
            nachziehen(
                &self.admission_rejections_total.with_label_values(&["connection"]),
                g.verbindungslimit,
            );
        }

        if let Some(a) = &quellen.admission {
            self.admission_tokens_active.set(als_i64(a.aktive_tokens));
            for (scope, wert) in [
                ("global", a.abgelehnt_global),
                ("campaign", a.abgelehnt_campaign),
                ("breaker", a.abgelehnt_breaker),
                ("ip", a.abgelehnt_ip),
            ] {
                nachziehen(&self.admission_rejections_total.with_label_values(&[scope]), wert);
            }
            nachziehen(&self.admission_forced_releases_total, a.zwangsfreigaben);
            self.reaper_stuck_sessions.set(als_i64(a.reaper.stuck_aktuell));
            nachziehen(
                &self.reaper_reaped_total.with_label_values(&["leak"]),
                a.reaper.leaks_gesamt,
            );
            nachziehen(
                &self.reaper_reaped_total.with_label_values(&["timeout"]),
                a.reaper.timeouts_gesamt,
            );
            self.circuit_breaker_state.set(a.breaker.zustand.als_gauge());
        }

        if let Some(b) = &quellen.bridge {
            nachziehen(&self.rtp_packets_total.with_label_values(&["in"]), b.pakete_empfangen);
            nachziehen(&self.rtp_packets_total.with_label_values(&["out"]), b.pakete_gesendet);
            for (grund, wert) in [
                ("invalid", b.pakete_verworfen),
                ("decode", b.dekodierfehler),
                ("uplink_full", b.uplink_verworfen),
            ] {
                nachziehen(&self.rtp_dropped_total.with_label_values(&[grund]), wert);
            }
        }
    }

    /// Exportiert alle Metriken im Prometheus-Textformat
    pub fn exportieren(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Counter auf einen kumulativen Zaehlerstand anheben
fn nachziehen(counter: &IntCounter, stand: u64) {
    let differenz = stand.saturating_sub(counter.get());
    if differenz > 0 {
        counter.inc_by(differenz);
    }
}

fn als_i64(wert: u64) -> i64 {
    i64::try_from(wert).unwrap_or(i64::MAX)
}

/// Axum-Router fuer den `/metrics`-Endpunkt
pub fn metrics_router(metriken: CallbridgeMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metriken)
}

async fn metrics_handler(State(metriken): State<CallbridgeMetrics>) -> impl IntoResponse {
    match metriken.exportieren() {
        Ok(text) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4",
            )],
            text,
        )
            .into_response(),
        Err(err) => {
            tracing::error!("Metriken-Export fehlgeschlagen: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callbridge_admission::{BreakerStatus, BreakerZustand, ReaperSnapshot};

    fn admission_snapshot() -> AdmissionSnapshot {
        AdmissionSnapshot {
            zugelassen: 10,
            abgelehnt_global: 3,
            abgelehnt_campaign: 1,
            abgelehnt_breaker: 0,
            abgelehnt_ip: 2,
            zwangsfreigaben: 4,
            aktive_tokens: 6,
            breaker: BreakerStatus {
                zustand: BreakerZustand::Offen,
                fehler_folge: 5,
                letzter_fehler: None,
                naechster_versuch: None,
            },
            reaper: ReaperSnapshot {
                stuck_aktuell: 1,
                aktive_tokens: 6,
                max_tokens: 100,
                leaks_gesamt: 2,
                timeouts_gesamt: 1,
                durchlaeufe: 7,
            },
        }
    }

    #[test]
    fn metriken_erstellen_erfolgreich() {
        let metriken = CallbridgeMetrics::neu().unwrap();
        assert!(!metriken.registry.gather().is_empty());
    }

    #[test]
    fn admission_snapshot_wird_uebertragen() {
        let metriken = CallbridgeMetrics::neu().unwrap();
        metriken.aktualisieren(&MetrikQuellen {
            admission: Some(admission_snapshot()),
            ..Default::default()
        });

        assert_eq!(metriken.admission_tokens_active.get(), 6);
        assert_eq!(metriken.circuit_breaker_state.get(), 2);
        assert_eq!(metriken.reaper_stuck_sessions.get(), 1);
        assert_eq!(
            metriken
                .admission_rejections_total
                .with_label_values(&["global"])
                .get(),
            3
        );
        assert_eq!(
            metriken.reaper_reaped_total.with_label_values(&["leak"]).get(),
            2
        );
    }

    #[test]
    fn counter_folgen_dem_kumulativen_stand() {
        let metriken = CallbridgeMetrics::neu().unwrap();
        let mut snapshot = admission_snapshot();
        metriken.aktualisieren(&MetrikQuellen {
            admission: Some(snapshot.clone()),
            ..Default::default()
        });
        snapshot.abgelehnt_global = 8;
        metriken.aktualisieren(&MetrikQuellen {
            admission: Some(snapshot.clone()),
            ..Default::default()
        });
        // Zweimal derselbe Stand zaehlt nicht doppelt
        metriken.aktualisieren(&MetrikQuellen {
            admission: Some(snapshot),
            ..Default::default()
        });
        assert_eq!(
            metriken
                .admission_rejections_total
                .with_label_values(&["global"])
                .get(),
            8
        );
        assert_eq!(metriken.admission_forced_releases_total.get(), 4);
    }

    #[test]
    fn gateway_und_bridge_snapshot() {
        let metriken = CallbridgeMetrics::neu().unwrap();
        metriken.aktualisieren(&MetrikQuellen {
            gateway: Some(GatewaySnapshot {
                sessions_gesamt: 12,
                sessions_aktiv: 3,
                pakete_spaet: 5,
                pakete_verdeckt: 9,
                ..Default::default()
            }),
            bridge: Some(BridgeSnapshot {
                pakete_empfangen: 100,
                pakete_gesendet: 90,
                pakete_verworfen: 2,
                dekodierfehler: 0,
                uplink_verworfen: 1,
            }),
            admission: None,
        });

        assert_eq!(metriken.sessions_active.get(), 3);
        assert_eq!(metriken.sessions_total.get(), 12);
        assert_eq!(
            metriken
                .jitter_packets_total
                .with_label_values(&["concealed"])
                .get(),
            9
        );
        assert_eq!(metriken.rtp_packets_total.with_label_values(&["in"]).get(), 100);
        assert_eq!(
            metriken
                .rtp_dropped_total
                .with_label_values(&["uplink_full"])
                .get(),
            1
        );
    }

    #[test]
    fn metriken_export_prometheus_format() {
        let metriken = CallbridgeMetrics::neu().unwrap();
        metriken.sessions_active.set(5);
        metriken.aktualisieren(&MetrikQuellen {
            admission: Some(admission_snapshot()),
            ..Default::default()
        });

        let output = metriken.exportieren().unwrap();
        assert!(output.contains("callbridge_sessions_active"));
        assert!(output.contains("callbridge_admission_rejections_total{scope=\"global\"} 3"));
        assert!(output.contains("callbridge_circuit_breaker_state 2"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }
}
