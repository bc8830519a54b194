//! Session-Verbindung – State Machine einer einzelnen Gateway-Verbindung
//!
//! Jede Verbindung laeuft in einem eigenen tokio-Task und besitzt ihren
//! Jitter Buffer, ihren Energie-Analyzer und ihre Timer exklusiv.
//!
//! ## State Machine
//! ```text
//! Verbindend -> Authentifiziert -> Aktiv <-> Pausiert
//!     |               |              |          |
//!     +---------------+--------------+----------+--> Schliessend -> Geschlossen
//! ```
//!
//! ## Aufbau
//! 1. `auth` muss innerhalb von `auth_timeout_ms` als erste Nachricht kommen
//! 2. Verbindungslimit pro Anruf
//! 3. Zulassung (Concurrency-Token, Circuit Breaker); weitere Verbindungen
//!    desselben Anrufs teilen sich das Token
//! 4. Erkennungsstrom oeffnen; Fehlschlag zaehlt fuer den Breaker
//! 5. `connected`
//!
//! Jede Ablehnung sendet eine `error`-Nachricht und einen Close-Frame mit
//! eigenem Code.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use callbridge_core::timeline::art;
use callbridge_core::{CallId, CampaignId, EnergyWindow};
use callbridge_media::{AudioFrame, EnergyAnalyzer, JitterBuffer};
use callbridge_protocol::{
    CloseCode, ErrorCode, Frame, FrameCodec, InboundMessage, OrchestrationConfig, OutboundMessage,
    RealtimeOptions,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Framed;

use crate::auth::{Anmeldedaten, AuthMethode};
use crate::error::{GatewayError, GatewayResult};
use crate::limits::VerbindungsGuard;
use crate::orchestrator::{OrchestratorHandle, OrchestratorKontext};
use crate::provider::AsrStrom;
use crate::state::GatewayState;
use crate::stats::GatewayStatistik;
use crate::timers::{SessionTimers, TimerEreignis};
use crate::tokens::TokenAnteil;

type SessionFramed<S> = Framed<S, FrameCodec>;

/// Aktuelle Zeit als std-Instant; folgt der (ggf. pausierten) tokio-Uhr
fn jetzt() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

// ---------------------------------------------------------------------------
// Zustand
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionZustand {
    Verbindend,
    Authentifiziert,
    Aktiv,
    Pausiert,
    Schliessend,
    Geschlossen,
}

impl SessionZustand {
    pub fn als_str(&self) -> &'static str {
        match self {
            Self::Verbindend => "connecting",
            Self::Authentifiziert => "authenticated",
            Self::Aktiv => "active",
            Self::Pausiert => "paused",
            Self::Schliessend => "closing",
            Self::Geschlossen => "closed",
        }
    }
}

/// Warum die Hauptschleife endet
#[derive(Debug)]
enum Ende {
    /// `end` vom Client
    Client(String),
    /// Verbindung weg; nichts mehr senden
    Getrennt,
    Shutdown,
    Fehler(GatewayError),
}

impl Ende {
    fn grund(&self) -> String {
        match self {
            Self::Client(grund) => grund.clone(),
            Self::Getrennt => "disconnected".into(),
            Self::Shutdown => "shutdown".into(),
            Self::Fehler(GatewayError::HeartbeatTimeout) => "heartbeat_timeout".into(),
            Self::Fehler(GatewayError::Zwangsfreigabe) => "released".into(),
            Self::Fehler(_) => "error".into(),
        }
    }
}

impl From<std::io::Error> for Ende {
    fn from(_: std::io::Error) -> Self {
        Self::Getrennt
    }
}

type Schritt = Result<(), Ende>;

/// Ergebnis eines erfolgreichen Aufbaus
struct Aufbau {
    call_id: CallId,
    campaign_id: CampaignId,
    options: RealtimeOptions,
    methode: AuthMethode,
    asr: AsrStrom,
    _verbindung: VerbindungsGuard,
    _token: TokenAnteil,
}

// ---------------------------------------------------------------------------
// SessionConnection
// ---------------------------------------------------------------------------

/// Verarbeitet eine einzelne Session-Verbindung
pub struct SessionConnection {
    state: Arc<GatewayState>,
    peer: Option<SocketAddr>,
}

impl SessionConnection {
    pub fn neu(state: Arc<GatewayState>, peer: Option<SocketAddr>) -> Self {
        Self { state, peer }
    }

    /// Laeuft bis `end`, Trennung, Timeout oder Shutdown
    pub async fn verarbeiten<S>(self, stream: S, mut shutdown: watch::Receiver<bool>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut framed = Framed::new(
            stream,
            FrameCodec::with_max_size(self.state.config.session.max_frame_bytes),
        );

        let aufbau = tokio::select! {
            ergebnis = self.aufbauen(&mut framed) => ergebnis,
            Ok(()) = shutdown.changed() => Err(GatewayError::intern("Shutdown waehrend des Aufbaus")),
        };
        let aufbau = match aufbau {
            Ok(aufbau) => aufbau,
            Err(e) => {
                self.ablehnen(&mut framed, &e).await;
                return;
            }
        };

        let call_id = aufbau.call_id.clone();
        let mut sitzung = Sitzung::neu(&self.state, &aufbau, self.peer);
        let (ausgang_tx, mut ausgang_rx) = mpsc::channel(self.state.config.session.ausgang_kapazitaet);
        let (energie, mut energie_rx) = EnergyAnalyzer::neu(sitzung.energie_config(&aufbau.options));
        sitzung.energie = Some(energie);

        let Aufbau {
            asr,
            _verbindung,
            _token,
            ..
        } = aufbau;
        let orchestrator = OrchestratorHandle::starten(
            OrchestratorKontext {
                call_id: call_id.clone(),
                options: sitzung.options.clone(),
                config: sitzung.config.clone(),
                provider: self.state.provider.clone(),
                ausgang: ausgang_tx,
                timeline: self.state.timeline.clone(),
                statistik: Arc::clone(&self.state.statistik),
            },
            asr,
        );

        let ende = match sitzung.verbunden_melden(&mut framed).await {
            Ok(()) => {
                let mut freigaben = Some(self.state.admission.abonnieren_zwangsfreigaben());
                sitzung
                    .hauptschleife(
                        &mut framed,
                        &orchestrator,
                        &mut ausgang_rx,
                        &mut energie_rx,
                        &mut freigaben,
                        &mut shutdown,
                    )
                    .await
            }
            Err(ende) => ende,
        };

        sitzung.schliessen(&mut framed, orchestrator, ende).await;
        drop(_verbindung);
        drop(_token);
    }

    async fn aufbauen<S>(&self, framed: &mut SessionFramed<S>) -> GatewayResult<Aufbau>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let session_cfg = &self.state.config.session;
        let frist = session_cfg.auth_timeout();
        let nachricht = tokio::time::timeout(frist, auth_empfangen(framed))
            .await
            .map_err(|_| GatewayError::AuthTimeout(frist))??;

        let InboundMessage::Auth {
            call_id,
            campaign_id,
            api_key,
            token,
            timestamp,
            signature,
            options,
        } = nachricht
        else {
            return Err(GatewayError::auth("erste Nachricht ist kein auth"));
        };

        let methode = self.state.auth.pruefen(&Anmeldedaten {
            call_id: &call_id,
            api_key: api_key.as_deref(),
            token: token.as_deref(),
            timestamp,
            signatur: signature.as_deref(),
        })?;

        let call_id = CallId::neu(call_id);
        let campaign_id = campaign_id
            .filter(|c| !c.trim().is_empty())
            .map(CampaignId::neu)
            .unwrap_or_default();

        let verbindung = self.state.limits.verbindung_oeffnen(&call_id)?;

        let mut token = self.state.tokens.beitreten(&call_id, &campaign_id)?;

        let asr = match self
            .state
            .provider
            .asr
            .oeffnen(&call_id, &options, &session_cfg.orchestrierung)
            .await
        {
            Ok(asr) => asr,
            Err(e) => {
                token.fehlschlag();
                return Err(e.into());
            }
        };
        token.bestaetigen();

        Ok(Aufbau {
            call_id,
            campaign_id,
            options,
            methode,
            asr,
            _verbindung: verbindung,
            _token: token,
        })
    }

    /// Sendet `error` und Close-Frame fuer einen gescheiterten Aufbau
    async fn ablehnen<S>(&self, framed: &mut SessionFramed<S>, fehler: &GatewayError)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let statistik = &self.state.statistik;
        match fehler {
            GatewayError::AuthFehlgeschlagen(_) | GatewayError::AuthTimeout(_) => {
                GatewayStatistik::erhoehen(&statistik.auth_fehlgeschlagen)
            }
            GatewayError::ZuVieleVerbindungen { .. } => {
                GatewayStatistik::erhoehen(&statistik.verbindungslimit)
            }
            GatewayError::Zulassung(_) => GatewayStatistik::erhoehen(&statistik.zulassung_abgelehnt),
            _ => {}
        }

        let code = fehler.close_code();
        tracing::warn!(peer = ?self.peer, code = code.code(), fehler = %fehler, "Session abgelehnt");

        if matches!(fehler, GatewayError::Io(_)) {
            return;
        }
        if let Ok(frame) = Frame::json(&fehler.als_nachricht()) {
            if let Err(e) = framed.send(frame).await {
                tracing::debug!(peer = ?self.peer, fehler = %e, "Ablehnung nicht zugestellt");
                return;
            }
        }
        if let Err(e) = framed
            .send(Frame::close(code.code(), format!("{code:?}")))
            .await
        {
            tracing::debug!(peer = ?self.peer, fehler = %e, "Close-Frame nicht zugestellt");
        }
    }
}

/// Wartet auf die `auth`-Nachricht; alles andere ist ein Auth-Fehler
async fn auth_empfangen<S>(framed: &mut SessionFramed<S>) -> GatewayResult<InboundMessage>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match framed.next().await {
        Some(Ok(Frame::Json(bytes))) => match InboundMessage::parsen(&bytes) {
            Ok(nachricht @ InboundMessage::Auth { .. }) => Ok(nachricht),
            Ok(andere) => Err(GatewayError::auth(format!(
                "{} vor auth",
                andere.typ()
            ))),
            Err(e) => Err(GatewayError::auth(format!("ungueltiges auth: {e}"))),
        },
        Some(Ok(Frame::Audio { .. })) => Err(GatewayError::auth("Audio vor auth")),
        Some(Ok(Frame::Close { code, .. })) => Err(GatewayError::Protokoll(format!(
            "Close {code} vor auth"
        ))),
        Some(Err(e)) => Err(e.into()),
        None => Err(GatewayError::Io(std::io::ErrorKind::UnexpectedEof.into())),
    }
}

async fn schlafen_bis(frist: Option<std::time::Instant>) {
    match frist {
        Some(frist) => tokio::time::sleep_until(tokio::time::Instant::from_std(frist)).await,
        None => std::future::pending().await,
    }
}

async fn freigabe_empfangen(
    rx: &mut Option<broadcast::Receiver<CallId>>,
) -> Result<CallId, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn senden<S>(framed: &mut SessionFramed<S>, nachricht: &OutboundMessage) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    framed.send(Frame::json(nachricht)?).await
}

// ---------------------------------------------------------------------------
// Laufende Session
// ---------------------------------------------------------------------------

struct Sitzung {
    state: Arc<GatewayState>,
    call_id: CallId,
    campaign_id: CampaignId,
    session_id: String,
    methode: AuthMethode,
    peer: Option<SocketAddr>,
    options: RealtimeOptions,
    config: OrchestrationConfig,
    zustand: SessionZustand,
    jitter: JitterBuffer,
    energie: Option<EnergyAnalyzer>,
    timers: SessionTimers,
    sprechend: bool,
    gestartet: std::time::Instant,
    frames: u64,
}

impl Sitzung {
    fn neu(state: &Arc<GatewayState>, aufbau: &Aufbau, peer: Option<SocketAddr>) -> Self {
        let session_cfg = &state.config.session;
        let config = session_cfg.orchestrierung.clone();
        let t = jetzt();
        Self {
            state: Arc::clone(state),
            call_id: aufbau.call_id.clone(),
            campaign_id: aufbau.campaign_id.clone(),
            session_id: uuid::Uuid::new_v4().to_string(),
            methode: aufbau.methode,
            peer,
            options: aufbau.options.clone(),
            timers: SessionTimers::neu(
                Duration::from_millis(config.silence_timeout_ms),
                session_cfg.ping_intervall(),
                session_cfg.heartbeat_timeout(),
                t,
            ),
            config,
            zustand: SessionZustand::Authentifiziert,
            jitter: JitterBuffer::neu(state.config.jitter.clone()),
            energie: None,
            sprechend: false,
            gestartet: t,
            frames: 0,
        }
    }

    fn energie_config(&self, options: &RealtimeOptions) -> callbridge_media::EnergyConfig {
        let mut config = self.state.config.energie.clone();
        config.sample_rate = options.sample_rate;
        config
    }

    fn timeline(&self, kind: &str, payload: serde_json::Value) {
        self.state.timeline.anhaengen(&self.call_id, kind, payload);
    }

    async fn verbunden_melden<S>(&mut self, framed: &mut SessionFramed<S>) -> Schritt
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let statistik = &self.state.statistik;
        GatewayStatistik::erhoehen(&statistik.sessions_gesamt);
        GatewayStatistik::erhoehen(&statistik.sessions_aktiv);

        self.timeline(
            art::SESSION_CONNECTED,
            json!({
                "sessionId": self.session_id,
                "campaignId": self.campaign_id.as_str(),
                "method": self.methode.als_str(),
                "audioFormat": self.options.audio_format,
                "sampleRate": self.options.sample_rate,
            }),
        );
        tracing::info!(
            call_id = %self.call_id,
            session_id = %self.session_id,
            campaign = %self.campaign_id,
            methode = self.methode.als_str(),
            peer = ?self.peer,
            "Session verbunden"
        );

        senden(
            framed,
            &OutboundMessage::Connected {
                call_id: self.call_id.as_str().to_string(),
                session_id: self.session_id.clone(),
                options: self.options.clone(),
            },
        )
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn hauptschleife<S>(
        &mut self,
        framed: &mut SessionFramed<S>,
        orchestrator: &OrchestratorHandle,
        ausgang_rx: &mut mpsc::Receiver<OutboundMessage>,
        energie_rx: &mut mpsc::Receiver<EnergyWindow>,
        freigaben: &mut Option<broadcast::Receiver<CallId>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Ende
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let frame_ms = self.state.config.jitter.frame_ms.max(1) as u64;
        let mut takt = tokio::time::interval(Duration::from_millis(frame_ms));
        takt.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let frist = self.timers.naechste_frist();
            let schritt: Schritt = tokio::select! {
                frame = framed.next() => match frame {
                    Some(Ok(frame)) => self.frame_verarbeiten(frame, framed, orchestrator).await,
                    Some(Err(e)) => {
                        tracing::debug!(call_id = %self.call_id, fehler = %e, "Frame-Lesefehler");
                        Err(Ende::Getrennt)
                    }
                    None => Err(Ende::Getrennt),
                },

                _ = takt.tick() => {
                    self.abspielen(orchestrator);
                    Ok(())
                }

                Some(fenster) = energie_rx.recv() => {
                    self.fenster_melden(fenster, framed, orchestrator).await
                }

                Some(nachricht) = ausgang_rx.recv() => {
                    senden(framed, &nachricht).await.map_err(Ende::from)
                }

                _ = schlafen_bis(frist) => self.timer_pruefen(framed, orchestrator).await,

                freigabe = freigabe_empfangen(freigaben) => match freigabe {
                    Ok(id) if id == self.call_id => Err(Ende::Fehler(GatewayError::Zwangsfreigabe)),
                    Ok(_) => Ok(()),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(call_id = %self.call_id, verpasst = n, "Freigabe-Meldungen verpasst");
                        if self.state.admission.ist_zugelassen(&self.call_id) {
                            Ok(())
                        } else {
                            Err(Ende::Fehler(GatewayError::Zwangsfreigabe))
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        *freigaben = None;
                        Ok(())
                    }
                },

                Ok(()) = shutdown.changed() => {
                    if *shutdown.borrow() {
                        Err(Ende::Shutdown)
                    } else {
                        Ok(())
                    }
                }
            };

            if let Err(ende) = schritt {
                return ende;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Eingehende Frames
    // -----------------------------------------------------------------------

    async fn frame_verarbeiten<S>(
        &mut self,
        frame: Frame,
        framed: &mut SessionFramed<S>,
        orchestrator: &OrchestratorHandle,
    ) -> Schritt
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.timers.lebenszeichen(jetzt());
        match frame {
            Frame::Json(bytes) => self.json_verarbeiten(&bytes, framed, orchestrator).await,
            Frame::Audio {
                seq,
                timestamp,
                payload,
            } => {
                self.audio_verarbeiten(seq, timestamp, payload);
                Ok(())
            }
            Frame::Close { code, grund } => {
                tracing::debug!(call_id = %self.call_id, code, grund = %grund, "Client schliesst");
                Err(Ende::Getrennt)
            }
        }
    }

    fn audio_verarbeiten(&mut self, seq: u16, timestamp: u32, payload: Bytes) {
        let statistik = &self.state.statistik;
        if self.zustand != SessionZustand::Aktiv {
            GatewayStatistik::erhoehen(&statistik.audio_verworfen);
            tracing::trace!(call_id = %self.call_id, zustand = self.zustand.als_str(), "Audio ausserhalb von active verworfen");
            return;
        }
        match AudioFrame::dekodieren(
            seq,
            timestamp,
            self.options.audio_format,
            self.options.sample_rate,
            payload.to_vec(),
        ) {
            Ok(frame) => {
                let t = jetzt();
                self.jitter.push(frame, t);
                self.timers.audio_empfangen(t);
                self.frames += 1;
                GatewayStatistik::erhoehen(&statistik.audio_frames);
            }
            Err(e) => {
                GatewayStatistik::erhoehen(&statistik.dekodierfehler);
                tracing::debug!(call_id = %self.call_id, seq, fehler = %e, "Audio-Frame nicht dekodierbar");
            }
        }
    }

    async fn json_verarbeiten<S>(
        &mut self,
        bytes: &[u8],
        framed: &mut SessionFramed<S>,
        orchestrator: &OrchestratorHandle,
    ) -> Schritt
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let geparst = InboundMessage::parsen(bytes);
        let ist_end = matches!(geparst, Ok(InboundMessage::End { .. }));

        if !ist_end && !self.state.limits.nachricht_erlauben(&self.call_id) {
            GatewayStatistik::erhoehen(&self.state.statistik.rate_limitiert);
            tracing::debug!(call_id = %self.call_id, "Nachrichtenlimit ueberschritten");
            let antwort = OutboundMessage::Error {
                code: ErrorCode::RateLimited,
                message: "Too many messages".into(),
                scope: Some("call".into()),
                limit: Some(self.state.config.session.nachrichten_pro_minute),
                retry_after_ms: None,
            };
            senden(framed, &antwort).await?;
            return Ok(());
        }

        match geparst {
            Ok(nachricht) => self.dispatch(nachricht, framed, orchestrator).await,
            Err(e) => {
                GatewayStatistik::erhoehen(&self.state.statistik.nachrichten_ungueltig);
                tracing::debug!(call_id = %self.call_id, fehler = %e, "Ungueltige Nachricht");
                senden(framed, &OutboundMessage::fehler(ErrorCode::InvalidMessage, e.to_string())).await?;
                Ok(())
            }
        }
    }

    async fn ungueltiger_zustand<S>(&self, framed: &mut SessionFramed<S>, typ: &str) -> Schritt
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let antwort = OutboundMessage::fehler(
            ErrorCode::InvalidState,
            format!("'{typ}' not allowed in state {}", self.zustand.als_str()),
        );
        senden(framed, &antwort).await?;
        Ok(())
    }

    async fn dispatch<S>(
        &mut self,
        nachricht: InboundMessage,
        framed: &mut SessionFramed<S>,
        orchestrator: &OrchestratorHandle,
    ) -> Schritt
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        use SessionZustand::*;

        let typ = nachricht.typ();
        tracing::trace!(call_id = %self.call_id, typ, "Nachricht empfangen");

        match (nachricht, self.zustand) {
            (InboundMessage::Start { agent_id }, Authentifiziert) => {
                self.zustand = Aktiv;
                self.timeline(art::SESSION_ACTIVE, json!({ "agentId": agent_id }));
                tracing::info!(call_id = %self.call_id, agent = %agent_id, "Session aktiv");
            }

            (InboundMessage::Pause, Aktiv) => {
                self.zustand = Pausiert;
                if let Some(energie) = self.energie.as_mut() {
                    energie.aussetzen();
                }
                self.timers.pausieren();
                self.jitter.reset();
                self.timeline(art::SESSION_PAUSED, json!({}));
            }

            (InboundMessage::Resume, Pausiert) => {
                self.zustand = Aktiv;
                if let Some(energie) = self.energie.as_mut() {
                    energie.fortsetzen();
                }
                self.timers.fortsetzen(jetzt());
                self.timeline(art::SESSION_RESUMED, json!({}));
            }

            (InboundMessage::DtmfSend { digits, method }, Aktiv | Pausiert) => {
                self.timeline(art::DTMF, json!({ "digits": digits, "method": method }));
                senden(framed, &OutboundMessage::DtmfSend { digits, method }).await?;
            }

            (InboundMessage::Transfer { to, mode }, Aktiv | Pausiert) => {
                self.timeline(art::TRANSFER, json!({ "to": to, "mode": mode }));
                tracing::info!(call_id = %self.call_id, ziel = %to, "Transfer angefordert");
                senden(framed, &OutboundMessage::Transfer { to, mode }).await?;
            }

            (InboundMessage::Config { config: patch }, _) => match self.config.anwenden(&patch) {
                Ok(neu) => {
                    self.timers
                        .stille_timeout_setzen(Duration::from_millis(neu.silence_timeout_ms));
                    orchestrator.konfigurieren(neu.clone());
                    self.config = neu;
                    self.timeline(
                        art::CONFIG,
                        serde_json::to_value(&patch).unwrap_or_default(),
                    );
                }
                Err(grund) => {
                    senden(framed, &OutboundMessage::fehler(ErrorCode::InvalidMessage, grund))
                        .await?;
                }
            },

            (InboundMessage::Ping { timestamp }, _) => {
                self.state.admission.heartbeat(&self.call_id);
                senden(framed, &OutboundMessage::Pong { timestamp }).await?;
            }

            (InboundMessage::Pong { .. }, _) => {
                self.state.admission.heartbeat(&self.call_id);
            }

            (InboundMessage::ToolResult { id, result }, _) => {
                if !orchestrator.tool_ergebnis(&id, result) {
                    senden(
                        framed,
                        &OutboundMessage::fehler(
                            ErrorCode::InvalidMessage,
                            format!("unknown tool call id '{id}'"),
                        ),
                    )
                    .await?;
                }
            }

            (InboundMessage::End { reason }, _) => {
                return Err(Ende::Client(reason.unwrap_or_else(|| "client_end".into())));
            }

            _ => return self.ungueltiger_zustand(framed, typ).await,
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Audio-Pfad
    // -----------------------------------------------------------------------

    /// Ein Frame pro Takt in Wiedergabe-Reihenfolge an Analyzer und Erkennung
    fn abspielen(&mut self, orchestrator: &OrchestratorHandle) {
        if self.zustand != SessionZustand::Aktiv {
            return;
        }
        let Some(slot) = self.jitter.pop(jetzt()) else {
            return;
        };
        let samples = slot.frame.samples;
        if let Some(energie) = self.energie.as_mut() {
            energie.push_pcm16(&samples);
        }
        if self.options.enable_transcription && !orchestrator.audio(samples) {
            GatewayStatistik::erhoehen(&self.state.statistik.asr_verworfen);
        }
    }

    async fn fenster_melden<S>(
        &mut self,
        fenster: EnergyWindow,
        framed: &mut SessionFramed<S>,
        orchestrator: &OrchestratorHandle,
    ) -> Schritt
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let speaking = fenster.speaking;
        let confidence = fenster.vad_confidence;
        if self.state.config.session.emotion_fenster_senden {
            senden(framed, &OutboundMessage::EmotionWindow(fenster)).await?;
        }
        if speaking != self.sprechend {
            self.sprechend = speaking;
            senden(framed, &OutboundMessage::EmotionState { speaking, confidence }).await?;
            if speaking {
                orchestrator.sprache_erkannt();
            }
        }
        Ok(())
    }

    async fn timer_pruefen<S>(
        &mut self,
        framed: &mut SessionFramed<S>,
        orchestrator: &OrchestratorHandle,
    ) -> Schritt
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        for ereignis in self.timers.pruefen(jetzt()) {
            match ereignis {
                TimerEreignis::Stille { seit } => {
                    GatewayStatistik::erhoehen(&self.state.statistik.stille_ereignisse);
                    tracing::debug!(call_id = %self.call_id, stille_ms = seit.as_millis() as u64, "Stille erkannt, Turn-Ende");
                    self.timeline(
                        art::SILENCE,
                        json!({
                            "idleMs": seit.as_millis() as u64,
                            "timeoutMs": self.timers.stille_timeout().as_millis() as u64,
                        }),
                    );
                    orchestrator.turn_ende();
                }
                TimerEreignis::PingFaellig => {
                    self.state.admission.heartbeat(&self.call_id);
                    let ping = OutboundMessage::Ping {
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    };
                    senden(framed, &ping).await?;
                }
                TimerEreignis::HeartbeatTimeout => {
                    tracing::warn!(call_id = %self.call_id, "Heartbeat-Timeout");
                    return Err(Ende::Fehler(GatewayError::HeartbeatTimeout));
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Schliessen
    // -----------------------------------------------------------------------

    async fn schliessen<S>(
        &mut self,
        framed: &mut SessionFramed<S>,
        orchestrator: OrchestratorHandle,
        ende: Ende,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.zustand = SessionZustand::Schliessend;
        self.timers.stoppen();
        orchestrator.beenden().await;

        let grund = ende.grund();
        if !matches!(ende, Ende::Getrennt) {
            if let Ende::Fehler(e) = &ende {
                if let Ok(frame) = Frame::json(&e.als_nachricht()) {
                    let _ = framed.send(frame).await;
                }
            }
            if let Ok(frame) = Frame::json(&OutboundMessage::End {
                reason: grund.clone(),
            }) {
                let _ = framed.send(frame).await;
            }
            let code = match &ende {
                Ende::Fehler(e) => e.close_code(),
                _ => CloseCode::Normal,
            };
            let _ = framed.send(Frame::close(code.code(), grund.clone())).await;
        }

        let jitter = self.jitter.statistik();
        let statistik = &self.state.statistik;
        statistik
            .pakete_spaet
            .fetch_add(jitter.packets_late, std::sync::atomic::Ordering::Relaxed);
        statistik
            .pakete_verdeckt
            .fetch_add(jitter.packets_concealed, std::sync::atomic::Ordering::Relaxed);
        statistik.session_beendet();

        let dauer = jetzt().saturating_duration_since(self.gestartet);
        self.timeline(
            art::SESSION_CLOSED,
            json!({
                "reason": grund,
                "durationMs": dauer.as_millis() as u64,
                "frames": self.frames,
                "jitter": {
                    "packetsReceived": jitter.packets_received,
                    "packetsPlayed": jitter.packets_played,
                    "packetsLate": jitter.packets_late,
                    "packetsConcealed": jitter.packets_concealed,
                    "packetsDuplicate": jitter.packets_duplicate,
                    "jitterMs": jitter.jitter_ms,
                },
            }),
        );
        self.zustand = SessionZustand::Geschlossen;
        tracing::info!(
            call_id = %self.call_id,
            session_id = %self.session_id,
            grund = %grund,
            dauer_ms = dauer.as_millis() as u64,
            frames = self.frames,
            "Session geschlossen"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zustandsnamen() {
        assert_eq!(SessionZustand::Verbindend.als_str(), "connecting");
        assert_eq!(SessionZustand::Pausiert.als_str(), "paused");
        assert_eq!(SessionZustand::Geschlossen.als_str(), "closed");
    }

    #[test]
    fn endgruende() {
        assert_eq!(Ende::Shutdown.grund(), "shutdown");
        assert_eq!(
            Ende::Fehler(GatewayError::HeartbeatTimeout).grund(),
            "heartbeat_timeout"
        );
        assert_eq!(Ende::Fehler(GatewayError::Zwangsfreigabe).grund(), "released");
        assert_eq!(Ende::Client("hangup".into()).grund(), "hangup");
    }
}
