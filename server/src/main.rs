//! Callbridge Server – Einstiegspunkt
//!
//! Laedt die Konfiguration, initialisiert das Logging und startet den Server.
//! Ctrl-C loest einen geordneten Shutdown aus: Sessions erhalten `end`
//! mit Grund `shutdown`, danach werden Tokens und Legs freigegeben.

use anyhow::Result;
use callbridge_observability::logging_initialisieren;
use callbridge_server::{config::ServerConfig, Server};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    // Konfigurationsdatei-Pfad aus Umgebungsvariable oder Standard
    let config_pfad = std::env::var("CALLBRIDGE_CONFIG").unwrap_or_else(|_| "config.toml".into());

    let mut config = ServerConfig::laden(&config_pfad)?;
    config.umgebung_anwenden()?;

    logging_initialisieren(&config.logging.level, &config.logging.format);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_pfad,
        "Callbridge Server wird initialisiert"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown-Signal empfangen, Server wird beendet"),
            Err(e) => tracing::error!(fehler = %e, "Signal-Handler fehlgeschlagen, beende"),
        }
        let _ = shutdown_tx.send(true);
    });

    Server::neu(config).starten(shutdown_rx).await
}
