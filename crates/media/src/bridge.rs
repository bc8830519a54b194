//! Media-Bridge – RTP/UDP auf der Telefonie-Seite, Session-Uplink zum Gateway
//!
//! ## Architektur
//!
//! ```text
//! Telefonie-Gateway --RTP/UDP--> recv_from
//!                                   |
//!                                   v
//!                          RtpPacket::decode   (Fehler: zaehlen, weiter)
//!                                   |
//!                                   v
//!                AudioFrame::dekodieren (seq + ts aus dem Header) --> SessionUplink --> Gateway
//!
//! Gateway --tts.chunk--> PCM-Queue --20 ms Takt--> RtpEndpoint::paketieren --> send_to
//! ```
//!
//! Ein Leg laeuft in einem eigenen Task. Die Gegenstelle wird beim ersten
//! gueltigen Paket gelernt (symmetrisches RTP), sofern kein festes Ziel
//! konfiguriert ist.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use callbridge_protocol::{codec, Codec, OutboundMessage, RtpPacket};
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{MediaError, MediaResult};
use crate::frame::AudioFrame;
use crate::rtp_endpoint::RtpEndpoint;
use crate::uplink::{SessionUplink, UplinkConfig};

/// Maximale UDP-Paketgroesse
const UDP_BUFFER_SIZE: usize = 1500;

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Konfiguration der Media-Bridge
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Lokale RTP-Adresse eines Legs (Port 0 = beliebig)
    pub bind_adresse: SocketAddr,
    /// Festes RTP-Ziel; ohne Angabe wird die Gegenstelle gelernt
    pub ziel: Option<SocketAddr>,
    /// Codec der ausgehenden Richtung
    pub codec: Codec,
    pub sample_rate: u32,
    pub frame_ms: u32,
    /// Payload-Type fuer linear16
    pub dynamischer_pt: u8,
    /// Maximal gepufferte Ausgabe-Frames
    pub max_ausgabe_frames: usize,
    pub uplink: UplinkConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_adresse: SocketAddr::from(([0, 0, 0, 0], 0)),
            ziel: None,
            codec: Codec::Mulaw,
            sample_rate: 8_000,
            frame_ms: 20,
            dynamischer_pt: 96,
            max_ausgabe_frames: 500,
            uplink: UplinkConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Statistik
// ---------------------------------------------------------------------------

/// Zaehler der Bridge (ueber alle Legs)
#[derive(Debug, Default)]
pub struct BridgeStatistik {
    pub pakete_empfangen: AtomicU64,
    pub pakete_gesendet: AtomicU64,
    /// Ungueltige RTP-Pakete oder unbekannter Payload-Type
    pub pakete_verworfen: AtomicU64,
    pub dekodierfehler: AtomicU64,
    /// Wegen voller Uplink-Queue verworfene Frames
    pub uplink_verworfen: AtomicU64,
}

impl BridgeStatistik {
    fn zaehlen(zaehler: &AtomicU64) {
        zaehler.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BridgeSnapshot {
        BridgeSnapshot {
            pakete_empfangen: self.pakete_empfangen.load(Ordering::Relaxed),
            pakete_gesendet: self.pakete_gesendet.load(Ordering::Relaxed),
            pakete_verworfen: self.pakete_verworfen.load(Ordering::Relaxed),
            dekodierfehler: self.dekodierfehler.load(Ordering::Relaxed),
            uplink_verworfen: self.uplink_verworfen.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeSnapshot {
    pub pakete_empfangen: u64,
    pub pakete_gesendet: u64,
    pub pakete_verworfen: u64,
    pub dekodierfehler: u64,
    pub uplink_verworfen: u64,
}

// ---------------------------------------------------------------------------
// MediaBridge
// ---------------------------------------------------------------------------

/// Erzeugt Media-Legs
#[derive(Clone)]
pub struct MediaBridge {
    config: BridgeConfig,
    statistik: Arc<BridgeStatistik>,
}

/// Handle auf ein laufendes Leg
pub struct LegHandle {
    pub lokale_adresse: SocketAddr,
    pub task: JoinHandle<MediaResult<()>>,
}

impl MediaBridge {
    pub fn neu(config: BridgeConfig) -> Self {
        Self {
            config,
            statistik: Arc::new(BridgeStatistik::default()),
        }
    }

    pub fn statistik(&self) -> Arc<BridgeStatistik> {
        Arc::clone(&self.statistik)
    }

    /// Oeffnet ein Leg: bindet den UDP-Socket, startet Uplink und Leg-Task
    pub async fn leg_starten(
        &self,
        call_id: String,
        shutdown: watch::Receiver<bool>,
    ) -> MediaResult<LegHandle> {
        let socket = UdpSocket::bind(self.config.bind_adresse).await?;
        let lokale_adresse = socket.local_addr()?;
        let platzhalter = SocketAddr::from(([0, 0, 0, 0], 0));
        let endpunkt = RtpEndpoint::neu(
            self.config.ziel.unwrap_or(platzhalter),
            self.config.codec,
            self.config.dynamischer_pt,
        )?;

        tracing::info!(
            call_id = %call_id,
            addr = %lokale_adresse,
            ssrc = endpunkt.ssrc(),
            "Media-Leg geoeffnet"
        );

        let leg = Leg {
            config: self.config.clone(),
            statistik: Arc::clone(&self.statistik),
            socket,
            endpunkt,
            ziel_bekannt: self.config.ziel.is_some(),
            ausgabe: VecDeque::new(),
            call_id,
        };
        let task = tokio::spawn(leg.laufen(shutdown));
        Ok(LegHandle {
            lokale_adresse,
            task,
        })
    }
}

// ---------------------------------------------------------------------------
// Leg
// ---------------------------------------------------------------------------

struct Leg {
    config: BridgeConfig,
    statistik: Arc<BridgeStatistik>,
    socket: UdpSocket,
    endpunkt: RtpEndpoint,
    ziel_bekannt: bool,
    /// PCM-Frames fuer die Telefonie-Seite
    ausgabe: VecDeque<Vec<i16>>,
    call_id: String,
}

impl Leg {
    async fn laufen(mut self, mut shutdown: watch::Receiver<bool>) -> MediaResult<()> {
        let (uplink, mut nachrichten) =
            SessionUplink::starten(self.config.uplink.clone(), self.call_id.clone());
        let mut takt =
            tokio::time::interval(Duration::from_millis(self.config.frame_ms.max(1) as u64));
        takt.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut buf = [0u8; UDP_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::debug!(call_id = %self.call_id, "Leg: Shutdown");
                    break;
                }
                empfangen = self.socket.recv_from(&mut buf) => {
                    let (laenge, absender) = match empfangen {
                        Ok(e) => e,
                        Err(e) => {
                            tracing::warn!(call_id = %self.call_id, fehler = %e, "UDP-Empfangsfehler");
                            continue;
                        }
                    };
                    if let Some(frame) = self.paket_verarbeiten(&buf[..laenge], absender) {
                        if !uplink.audio_senden(frame) {
                            BridgeStatistik::zaehlen(&self.statistik.uplink_verworfen);
                        }
                    }
                }
                nachricht = nachrichten.recv() => match nachricht {
                    Some(OutboundMessage::End { reason }) => {
                        tracing::info!(call_id = %self.call_id, grund = %reason, "Session beendet, Leg schliesst");
                        break;
                    }
                    Some(n) => self.nachricht_verarbeiten(n),
                    None => {
                        tracing::debug!(call_id = %self.call_id, "Uplink beendet");
                        break;
                    }
                },
                _ = takt.tick() => {
                    self.frame_senden().await;
                }
            }
        }

        let ergebnis = uplink.beenden().await;
        if let Err(e) = &ergebnis {
            tracing::warn!(call_id = %self.call_id, fehler = %e, "Uplink mit Fehler beendet");
        }
        tracing::info!(call_id = %self.call_id, "Media-Leg geschlossen");
        match ergebnis {
            Err(e @ (MediaError::Abgelehnt { .. } | MediaError::VersucheErschoepft(_))) => Err(e),
            _ => Ok(()),
        }
    }

    /// Parst ein RTP-Paket und dekodiert es zu einem Frame
    ///
    /// Umsortieren und Verdecken uebernimmt der Jitter Buffer der Session.
    fn paket_verarbeiten(&mut self, daten: &[u8], absender: SocketAddr) -> Option<AudioFrame> {
        BridgeStatistik::zaehlen(&self.statistik.pakete_empfangen);

        let paket = match RtpPacket::decode(daten) {
            Ok(p) => p,
            Err(e) => {
                BridgeStatistik::zaehlen(&self.statistik.pakete_verworfen);
                tracing::trace!(peer = %absender, fehler = %e, "Ungueltiges RTP-Paket verworfen");
                return None;
            }
        };

        let Some(codec) =
            Codec::aus_payload_type(paket.header.payload_type, self.config.dynamischer_pt)
        else {
            BridgeStatistik::zaehlen(&self.statistik.pakete_verworfen);
            tracing::trace!(pt = paket.header.payload_type, "Unbekannter Payload-Type");
            return None;
        };

        if !self.ziel_bekannt {
            self.endpunkt.ziel_setzen(absender);
            self.ziel_bekannt = true;
            tracing::debug!(call_id = %self.call_id, ziel = %absender, "RTP-Gegenstelle gelernt");
        }

        match AudioFrame::dekodieren(
            paket.header.sequence,
            paket.header.timestamp,
            codec,
            self.config.sample_rate,
            paket.payload,
        ) {
            Ok(frame) => Some(frame),
            Err(e) => {
                BridgeStatistik::zaehlen(&self.statistik.dekodierfehler);
                tracing::trace!(fehler = %e, "RTP-Payload nicht dekodierbar");
                None
            }
        }
    }

    fn nachricht_verarbeiten(&mut self, nachricht: OutboundMessage) {
        match &nachricht {
            OutboundMessage::TtsChunk { turn, .. } => {
                let Some(pcm) = nachricht.tts_pcm() else {
                    tracing::debug!(turn, "tts.chunk nicht dekodierbar");
                    return;
                };
                let pro_frame =
                    codec::samples_pro_frame(self.config.sample_rate, self.config.frame_ms).max(1);
                for chunk in pcm.chunks(pro_frame) {
                    if self.ausgabe.len() >= self.config.max_ausgabe_frames {
                        self.ausgabe.pop_front();
                    }
                    let mut frame = chunk.to_vec();
                    frame.resize(pro_frame, 0);
                    self.ausgabe.push_back(frame);
                }
            }
            OutboundMessage::ControlBargein { turn } => {
                tracing::debug!(call_id = %self.call_id, turn, verworfen = self.ausgabe.len(), "Barge-in: Ausgabe geleert");
                self.ausgabe.clear();
            }
            OutboundMessage::DtmfSend { digits, method } => {
                tracing::info!(call_id = %self.call_id, digits = %digits, methode = ?method, "DTMF an Telefonie-Leg");
            }
            OutboundMessage::Transfer { to, mode } => {
                tracing::info!(call_id = %self.call_id, ziel = %to, modus = ?mode, "Transfer an Telefonie-Leg");
            }
            andere => {
                tracing::trace!(typ = andere.typ(), "Gateway-Nachricht ohne Media-Bezug");
            }
        }
    }

    async fn frame_senden(&mut self) {
        if !self.ziel_bekannt {
            return;
        }
        let Some(frame) = self.ausgabe.pop_front() else {
            return;
        };
        let paket = self.endpunkt.paketieren(&frame);
        match self.socket.send_to(&paket, self.endpunkt.ziel()).await {
            Ok(_) => BridgeStatistik::zaehlen(&self.statistik.pakete_gesendet),
            Err(e) => {
                tracing::warn!(fehler = %e, ziel = %self.endpunkt.ziel(), "UDP-Sendefehler");
            }
        }
    }
}
