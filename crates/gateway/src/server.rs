//! TCP-Listener – Bindet Socket, prueft Quelladressen, startet Sessions
//!
//! Jede akzeptierte Verbindung bekommt einen eigenen tokio-Task mit einer
//! [`SessionConnection`]. Adressen, die der IP-Schutz ablehnt, erhalten
//! noch eine `error`-Nachricht und einen Close-Frame (4003), bevor der
//! Socket geschlossen wird.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use callbridge_protocol::{Frame, FrameCodec};
use futures_util::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;

use crate::error::GatewayError;
use crate::session::SessionConnection;
use crate::state::GatewayState;
use crate::stats::GatewayStatistik;

/// Wartezeit auf laufende Sessions nach dem Shutdown-Signal
const NACHLAUF: Duration = Duration::from_secs(5);

pub struct GatewayServer {
    state: Arc<GatewayState>,
    bind_addr: SocketAddr,
}

impl GatewayServer {
    pub fn neu(state: Arc<GatewayState>, bind_addr: SocketAddr) -> Self {
        Self { state, bind_addr }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Bindet den Socket und akzeptiert bis zum Shutdown-Signal
    pub async fn starten(self, shutdown_rx: watch::Receiver<bool>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.starten_mit_listener(listener, shutdown_rx).await
    }

    /// Wie [`starten`](Self::starten), mit bereits gebundenem Listener
    pub async fn starten_mit_listener(
        self,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let lokale_addr = listener.local_addr()?;
        tracing::info!(adresse = %lokale_addr, "Session-Gateway gestartet");

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = self.state.admission.ip_pruefen(peer_addr.ip()) {
                            GatewayStatistik::erhoehen(&self.state.statistik.zulassung_abgelehnt);
                            tracing::warn!(peer = %peer_addr, scope = e.scope(), fehler = %e, "Verbindung abgelehnt");
                            sessions.spawn(abweisen(stream, GatewayError::Zulassung(e)));
                            continue;
                        }
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(peer = %peer_addr, fehler = %e, "TCP_NODELAY nicht gesetzt");
                        }

                        tracing::debug!(peer = %peer_addr, "Verbindung akzeptiert");
                        let verbindung = SessionConnection::neu(Arc::clone(&self.state), Some(peer_addr));
                        sessions.spawn(verbindung.verarbeiten(stream, shutdown_rx.clone()));
                    }
                    Err(e) => {
                        tracing::error!(fehler = %e, "TCP-Accept-Fehler");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },

                // Beendete Tasks einsammeln
                Some(ergebnis) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = ergebnis {
                        if e.is_panic() {
                            tracing::error!(fehler = %e, "Session-Task abgestuerzt");
                        }
                    }
                }

                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Session-Gateway: Shutdown-Signal empfangen");
                        break;
                    }
                }
            }
        }

        drop(listener);
        let offen = sessions.len();
        if offen > 0 {
            tracing::info!(offen, "Warte auf laufende Sessions");
            let warten = async { while sessions.join_next().await.is_some() {} };
            if tokio::time::timeout(NACHLAUF, warten).await.is_err() {
                tracing::warn!(offen = sessions.len(), "Sessions nach Nachlauf abgebrochen");
                sessions.abort_all();
            }
        }

        tracing::info!("Session-Gateway gestoppt");
        Ok(())
    }
}

async fn abweisen(stream: TcpStream, fehler: GatewayError) {
    let mut framed = Framed::new(stream, FrameCodec::new());
    if let Ok(frame) = Frame::json(&fehler.als_nachricht()) {
        if let Err(e) = framed.send(frame).await {
            tracing::debug!(fehler = %e, "Ablehnung nicht zugestellt");
            return;
        }
    }
    let code = fehler.close_code();
    if let Err(e) = framed
        .send(Frame::close(code.code(), format!("{code:?}")))
        .await
    {
        tracing::debug!(fehler = %e, "Close-Frame nicht zugestellt");
    }
}
