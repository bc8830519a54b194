//! Session-Uplink – Verbindung eines Media-Legs zum Session-Gateway
//!
//! Baut eine Framed-TCP-Verbindung zum Gateway auf, authentifiziert sich per
//! HMAC-Signatur, startet die Session und leitet danach Audio in beide
//! Richtungen weiter.
//!
//! ## Reconnect
//! Bei Verbindungsabbruch wird mit exponentiellem Backoff neu verbunden
//! (`backoff_basis_ms · 2^n`, gedeckelt auf `backoff_max_ms`, hoechstens
//! `max_versuche` Versuche in Folge). Waehrend der Trennung anfallendes
//! Audio landet in einem begrenzten Ring; bei Ueberlauf faellt das aelteste
//! Frame heraus. Sequenznummer und Zeitstempel jedes Frames stammen aus dem
//! RTP-Header und werden unveraendert weitergereicht, damit der Jitter Buffer
//! des Gateways umsortieren und Luecken verdecken kann. Ablehnungen mit nicht wiederholbarem Close-Code (z.B.
//! Auth-Fehler) beenden den Uplink sofort.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use callbridge_protocol::{
    codec, signatur, Codec, Frame, FrameCodec, InboundMessage, OutboundMessage, RealtimeOptions,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::error::{MediaError, MediaResult};
use crate::frame::AudioFrame;

type UplinkFramed = Framed<TcpStream, FrameCodec>;

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Konfiguration des Session-Uplinks
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    /// Adresse des Session-Gateways (host:port)
    pub gateway_adresse: String,
    /// Gemeinsames HMAC-Geheimnis fuer den Handshake
    pub hmac_geheimnis: String,
    pub campaign_id: Option<String>,
    pub agent_id: String,
    /// Abtastrate des Uplink-Audios (linear16)
    pub sample_rate: u32,
    pub backoff_basis_ms: u64,
    pub backoff_max_ms: u64,
    pub max_versuche: u32,
    /// Frames, die waehrend einer Trennung gepuffert werden
    pub ring_kapazitaet: usize,
    pub handshake_timeout_ms: u64,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            gateway_adresse: "127.0.0.1:9400".into(),
            hmac_geheimnis: String::new(),
            campaign_id: None,
            agent_id: "default".into(),
            sample_rate: 8_000,
            backoff_basis_ms: 200,
            backoff_max_ms: 5_000,
            max_versuche: 8,
            ring_kapazitaet: 50,
            handshake_timeout_ms: 5_000,
        }
    }
}

impl UplinkConfig {
    /// Wartezeit vor dem `versuch`-ten erneuten Verbindungsversuch (ab 1)
    pub fn backoff(&self, versuch: u32) -> Duration {
        let exponent = versuch.saturating_sub(1).min(16);
        let ms = self
            .backoff_basis_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

// ---------------------------------------------------------------------------
// AudioRing
// ---------------------------------------------------------------------------

/// Begrenzter FIFO fuer Audio waehrend einer Trennung (aeltestes faellt raus)
#[derive(Debug)]
pub struct AudioRing {
    frames: VecDeque<AudioFrame>,
    kapazitaet: usize,
    verworfen: u64,
}

impl AudioRing {
    pub fn neu(kapazitaet: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(kapazitaet),
            kapazitaet: kapazitaet.max(1),
            verworfen: 0,
        }
    }

    pub fn einlegen(&mut self, frame: AudioFrame) {
        if self.frames.len() >= self.kapazitaet {
            self.frames.pop_front();
            self.verworfen += 1;
        }
        self.frames.push_back(frame);
    }

    pub fn entnehmen(&mut self) -> Option<AudioFrame> {
        self.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn verworfen(&self) -> u64 {
        self.verworfen
    }
}

// ---------------------------------------------------------------------------
// SessionUplink
// ---------------------------------------------------------------------------

/// Handle auf einen laufenden Uplink
///
/// Droppen des Handles beendet den Uplink (die Session wird mit `end`
/// geschlossen).
pub struct SessionUplink {
    audio_tx: mpsc::Sender<AudioFrame>,
    task: JoinHandle<MediaResult<()>>,
}

/// Ausgang einer einzelnen Verbindung
enum Verbindungsende {
    /// Leg wurde lokal beendet oder Gateway hat regulaer beendet
    Fertig,
    /// Verbindung verloren, neu verbinden
    Getrennt,
}

impl SessionUplink {
    /// Startet den Uplink-Task
    ///
    /// Nachrichten des Gateways (z.B. `tts.chunk`, `dtmf.send`) kommen auf
    /// dem zurueckgegebenen Empfaenger an.
    pub fn starten(
        config: UplinkConfig,
        call_id: String,
    ) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (audio_tx, audio_rx) = mpsc::channel(config.ring_kapazitaet.max(8));
        let (nachrichten_tx, nachrichten_rx) = mpsc::channel(256);

        let task = tokio::spawn(uplink_loop(config, call_id, audio_rx, nachrichten_tx));
        (Self { audio_tx, task }, nachrichten_rx)
    }

    /// Uebergibt einen dekodierten Frame (nicht blockierend; bei voller Queue verworfen)
    pub fn audio_senden(&self, frame: AudioFrame) -> bool {
        self.audio_tx.try_send(frame).is_ok()
    }

    /// Beendet den Uplink und wartet auf das Ergebnis
    pub async fn beenden(self) -> MediaResult<()> {
        let Self { audio_tx, task } = self;
        drop(audio_tx);
        task.await
            .map_err(|e| MediaError::Intern(format!("Uplink-Task abgebrochen: {e}")))?
    }
}

async fn uplink_loop(
    config: UplinkConfig,
    call_id: String,
    mut audio_rx: mpsc::Receiver<AudioFrame>,
    nachrichten_tx: mpsc::Sender<OutboundMessage>,
) -> MediaResult<()> {
    let mut ring = AudioRing::neu(config.ring_kapazitaet);
    let mut fehlversuche = 0u32;

    loop {
        match verbinden(&config, &call_id).await {
            Ok(mut framed) => {
                if fehlversuche > 0 {
                    tracing::info!(call_id = %call_id, versuche = fehlversuche, "Uplink wieder verbunden");
                }
                fehlversuche = 0;
                match verbindung_bedienen(
                    &mut framed,
                    &config,
                    &mut ring,
                    &mut audio_rx,
                    &nachrichten_tx,
                )
                .await
                {
                    Ok(Verbindungsende::Fertig) => return Ok(()),
                    Ok(Verbindungsende::Getrennt) => {
                        tracing::warn!(call_id = %call_id, "Uplink getrennt, verbinde neu");
                    }
                    Err(e) if e.ist_wiederholbar() => {
                        tracing::warn!(call_id = %call_id, fehler = %e, "Uplink-Fehler, verbinde neu");
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) if e.ist_wiederholbar() => {
                tracing::debug!(call_id = %call_id, fehler = %e, "Verbindungsversuch fehlgeschlagen");
            }
            Err(e) => {
                tracing::warn!(call_id = %call_id, fehler = %e, "Uplink abgelehnt");
                return Err(e);
            }
        }

        fehlversuche += 1;
        if fehlversuche >= config.max_versuche {
            tracing::error!(call_id = %call_id, versuche = fehlversuche, "Uplink aufgegeben");
            return Err(MediaError::VersucheErschoepft(fehlversuche));
        }

        // Backoff; Audio landet derweil im Ring
        let schlaf = tokio::time::sleep(config.backoff(fehlversuche));
        tokio::pin!(schlaf);
        loop {
            tokio::select! {
                _ = &mut schlaf => break,
                frame = audio_rx.recv() => match frame {
                    Some(frame) => ring.einlegen(frame),
                    None => return Ok(()),
                },
            }
        }
    }
}

/// Session-Frame mit Sequenz und Zeitstempel des RTP-Pakets (linear16)
fn audio_frame(frame: &AudioFrame) -> Frame {
    Frame::Audio {
        seq: frame.seq,
        timestamp: frame.timestamp,
        payload: Bytes::from(codec::encode(&frame.samples, Codec::Linear16)),
    }
}

/// Verbindet, authentifiziert und startet die Session
async fn verbinden(config: &UplinkConfig, call_id: &str) -> MediaResult<UplinkFramed> {
    let stream = TcpStream::connect(&config.gateway_adresse).await?;
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, FrameCodec::new());

    let timestamp = chrono::Utc::now().timestamp();
    let auth = InboundMessage::Auth {
        call_id: call_id.to_string(),
        campaign_id: config.campaign_id.clone(),
        api_key: None,
        token: None,
        timestamp: Some(timestamp),
        signature: Some(signatur::signieren(
            config.hmac_geheimnis.as_bytes(),
            call_id,
            timestamp,
        )),
        options: RealtimeOptions {
            audio_format: Codec::Linear16,
            sample_rate: config.sample_rate,
            ..Default::default()
        },
    };
    framed.send(Frame::json(&auth)?).await?;

    let frist = Duration::from_millis(config.handshake_timeout_ms);
    tokio::time::timeout(frist, auf_connected_warten(&mut framed))
        .await
        .map_err(|_| MediaError::protokoll("Handshake-Timeout"))??;

    let start = InboundMessage::Start {
        agent_id: config.agent_id.clone(),
    };
    framed.send(Frame::json(&start)?).await?;
    tracing::debug!(call_id, adresse = %config.gateway_adresse, "Uplink-Session gestartet");
    Ok(framed)
}

async fn auf_connected_warten(framed: &mut UplinkFramed) -> MediaResult<()> {
    while let Some(frame) = framed.next().await {
        match frame? {
            Frame::Json(bytes) => match serde_json::from_slice::<OutboundMessage>(&bytes) {
                Ok(OutboundMessage::Connected { session_id, .. }) => {
                    tracing::trace!(session_id = %session_id, "Handshake bestaetigt");
                    return Ok(());
                }
                Ok(OutboundMessage::Error { code, message, .. }) => {
                    tracing::debug!(?code, message = %message, "Fehler im Handshake");
                }
                Ok(andere) => {
                    return Err(MediaError::protokoll(format!(
                        "Unerwartete Nachricht im Handshake: {}",
                        andere.typ()
                    )))
                }
                Err(e) => return Err(MediaError::protokoll(format!("Ungueltiges JSON: {e}"))),
            },
            Frame::Close { code, grund } => return Err(MediaError::Abgelehnt { code, grund }),
            Frame::Audio { .. } => {}
        }
    }
    Err(MediaError::protokoll("Verbindung im Handshake geschlossen"))
}

/// Bedient eine aufgebaute Verbindung bis zur Trennung
async fn verbindung_bedienen(
    framed: &mut UplinkFramed,
    config: &UplinkConfig,
    ring: &mut AudioRing,
    audio_rx: &mut mpsc::Receiver<AudioFrame>,
    nachrichten_tx: &mpsc::Sender<OutboundMessage>,
) -> MediaResult<Verbindungsende> {
    // Gepuffertes Audio zuerst nachliefern
    while let Some(frame) = ring.entnehmen() {
        if framed.send(audio_frame(&frame)).await.is_err() {
            ring.einlegen(frame);
            return Ok(Verbindungsende::Getrennt);
        }
    }

    loop {
        tokio::select! {
            frame = audio_rx.recv() => match frame {
                Some(frame) => {
                    if framed.send(audio_frame(&frame)).await.is_err() {
                        ring.einlegen(frame);
                        return Ok(Verbindungsende::Getrennt);
                    }
                }
                None => {
                    // Leg beendet: Session regulaer schliessen
                    let ende = InboundMessage::End {
                        reason: Some("leg_closed".into()),
                    };
                    if let Ok(frame) = Frame::json(&ende) {
                        let _ = framed.send(frame).await;
                    }
                    return Ok(Verbindungsende::Fertig);
                }
            },
            eingehend = framed.next() => match eingehend {
                Some(Ok(Frame::Json(bytes))) => {
                    let nachricht = match serde_json::from_slice::<OutboundMessage>(&bytes) {
                        Ok(n) => n,
                        Err(e) => {
                            tracing::debug!(fehler = %e, "Unbekannte Gateway-Nachricht ignoriert");
                            continue;
                        }
                    };
                    match nachricht {
                        OutboundMessage::Ping { timestamp } => {
                            let pong = InboundMessage::Pong { timestamp: Some(timestamp) };
                            framed.send(Frame::json(&pong)?).await?;
                        }
                        OutboundMessage::End { reason } => {
                            tracing::debug!(grund = %reason, "Gateway hat die Session beendet");
                            let _ = nachrichten_tx.send(OutboundMessage::End { reason }).await;
                            return Ok(Verbindungsende::Fertig);
                        }
                        andere => {
                            if nachrichten_tx.send(andere).await.is_err() {
                                return Ok(Verbindungsende::Fertig);
                            }
                        }
                    }
                }
                Some(Ok(Frame::Close { code, grund })) => {
                    if code == callbridge_protocol::CloseCode::Normal.code() {
                        return Ok(Verbindungsende::Fertig);
                    }
                    return Err(MediaError::Abgelehnt { code, grund });
                }
                Some(Ok(Frame::Audio { .. })) => {
                    tracing::trace!(sample_rate = config.sample_rate, "Binaeres Audio vom Gateway ignoriert");
                }
                Some(Err(e)) => {
                    tracing::debug!(fehler = %e, "Lesefehler auf dem Uplink");
                    return Ok(Verbindungsende::Getrennt);
                }
                None => return Ok(Verbindungsende::Getrennt),
            },
        }
    }
}
