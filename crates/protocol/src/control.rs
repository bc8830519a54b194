//! Session-Protokoll: Steuerungsnachrichten
//!
//! Definiert alle JSON-Nachrichten, die ueber die Session-Verbindung
//! zwischen Media-Bridge (bzw. Client) und Session-Gateway laufen.
//!
//! ## Design
//! - Tagged Enums (`"type"`-Feld) fuer typsichere Nachrichtentypen
//! - Eingehende Nachrichten werden vor dem Dispatch pro Typ auf
//!   Pflichtfelder geprueft ([`InboundMessage::parsen`]); ungueltige
//!   Nachrichten fuehren zu einer `error`-Antwort, nie zum Verbindungsabbau
//! - Harte Ablehnungen (Auth, Verbindungslimit, Admission) schliessen die
//!   Verbindung mit einem eigenen [`CloseCode`]

use base64::{engine::general_purpose::STANDARD, Engine as _};
use callbridge_core::EnergyWindow;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::codec::{self, Codec};
use crate::options::{OrchestrationPatch, RealtimeOptions};

// ---------------------------------------------------------------------------
// Fehler- und Close-Codes
// ---------------------------------------------------------------------------

/// Maschinenlesbare Fehler-Codes in `error`-Nachrichten
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthFailed,
    InvalidMessage,
    InvalidState,
    RateLimited,
    ConnectionLimit,
    AdmissionRejected,
    IpBlocked,
    ProviderFailure,
    Timeout,
    InternalError,
}

/// Close-Codes beim Schliessen der Session-Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    Normal = 1000,
    InternerFehler = 1011,
    AuthFehlgeschlagen = 4001,
    IpGesperrt = 4003,
    AuthTimeout = 4004,
    ZuVieleVerbindungen = 4008,
    HeartbeatTimeout = 4010,
    Zwangsfreigabe = 4012,
    ZulassungAbgelehnt = 4029,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn aus_code(code: u16) -> Option<Self> {
        Some(match code {
            1000 => Self::Normal,
            1011 => Self::InternerFehler,
            4001 => Self::AuthFehlgeschlagen,
            4003 => Self::IpGesperrt,
            4004 => Self::AuthTimeout,
            4008 => Self::ZuVieleVerbindungen,
            4010 => Self::HeartbeatTimeout,
            4012 => Self::Zwangsfreigabe,
            4029 => Self::ZulassungAbgelehnt,
            _ => return None,
        })
    }

    /// Ob ein Client nach diesem Code erneut verbinden sollte
    pub fn ist_wiederholbar(self) -> bool {
        matches!(
            self,
            Self::InternerFehler | Self::HeartbeatTimeout | Self::ZulassungAbgelehnt
        )
    }
}

// ---------------------------------------------------------------------------
// Eingehende Nachrichten
// ---------------------------------------------------------------------------

/// Nachrichten an das Session-Gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    /// Handshake; muss die erste Nachricht der Verbindung sein
    #[serde(rename = "auth", rename_all = "camelCase")]
    Auth {
        call_id: String,
        campaign_id: Option<String>,
        api_key: Option<String>,
        token: Option<String>,
        timestamp: Option<i64>,
        signature: Option<String>,
        #[serde(default)]
        options: RealtimeOptions,
    },
    #[serde(rename = "start", rename_all = "camelCase")]
    Start { agent_id: String },
    #[serde(rename = "pause")]
    Pause,
    #[serde(rename = "resume")]
    Resume,
    #[serde(rename = "dtmf.send")]
    DtmfSend {
        digits: String,
        method: Option<String>,
    },
    #[serde(rename = "transfer")]
    Transfer { to: String, mode: Option<String> },
    #[serde(rename = "config")]
    Config { config: OrchestrationPatch },
    #[serde(rename = "ping")]
    Ping { timestamp: i64 },
    #[serde(rename = "pong")]
    Pong { timestamp: Option<i64> },
    #[serde(rename = "tool.result")]
    ToolResult { id: String, result: Value },
    #[serde(rename = "end")]
    End { reason: Option<String> },
}

/// Fehler der Nachrichten-Validierung
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidierungsFehler {
    #[error("Kein gueltiges JSON-Objekt: {0}")]
    KeinJson(String),

    #[error("Feld 'type' fehlt")]
    FehlenderTyp,

    #[error("Unbekannter Nachrichtentyp: {0}")]
    UnbekannterTyp(String),

    #[error("{typ}: Pflichtfeld '{feld}' fehlt oder ist ungueltig")]
    FehlendesFeld { typ: String, feld: &'static str },

    #[error("{typ}: {grund}")]
    Ungueltig { typ: String, grund: String },
}

#[derive(Clone, Copy)]
enum Feldart {
    Text,
    Zahl,
    Objekt,
    Beliebig,
}

/// Pflichtfelder pro Nachrichtentyp (None = unbekannter Typ)
fn pflichtfelder(typ: &str) -> Option<&'static [(&'static str, Feldart)]> {
    let felder: &'static [(&'static str, Feldart)] = match typ {
        "auth" => &[("callId", Feldart::Text)],
        "start" => &[("agentId", Feldart::Text)],
        "pause" | "resume" | "pong" | "end" => &[],
        "dtmf.send" => &[("digits", Feldart::Text)],
        "transfer" => &[("to", Feldart::Text)],
        "config" => &[("config", Feldart::Objekt)],
        "ping" => &[("timestamp", Feldart::Zahl)],
        "tool.result" => &[("id", Feldart::Text), ("result", Feldart::Beliebig)],
        _ => return None,
    };
    Some(felder)
}

fn feld_gueltig(wert: Option<&Value>, art: Feldart) -> bool {
    match (wert, art) {
        (Some(Value::String(s)), Feldart::Text) => !s.trim().is_empty(),
        (Some(v), Feldart::Zahl) => v.is_i64() || v.is_u64(),
        (Some(Value::Object(_)), Feldart::Objekt) => true,
        (Some(v), Feldart::Beliebig) => !v.is_null(),
        _ => false,
    }
}

impl InboundMessage {
    /// Parst und validiert eine eingehende JSON-Nachricht
    ///
    /// Pflichtfelder werden pro Typ geprueft, bevor deserialisiert wird.
    pub fn parsen(bytes: &[u8]) -> Result<Self, ValidierungsFehler> {
        let wert: Value =
            serde_json::from_slice(bytes).map_err(|e| ValidierungsFehler::KeinJson(e.to_string()))?;
        let objekt = wert
            .as_object()
            .ok_or_else(|| ValidierungsFehler::KeinJson("kein Objekt".into()))?;
        let typ = objekt
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ValidierungsFehler::FehlenderTyp)?
            .to_string();

        let felder =
            pflichtfelder(&typ).ok_or_else(|| ValidierungsFehler::UnbekannterTyp(typ.clone()))?;
        for (feld, art) in felder {
            if !feld_gueltig(objekt.get(*feld), *art) {
                return Err(ValidierungsFehler::FehlendesFeld {
                    typ: typ.clone(),
                    feld: *feld,
                });
            }
        }

        let nachricht: InboundMessage =
            serde_json::from_value(wert).map_err(|e| ValidierungsFehler::Ungueltig {
                typ: typ.clone(),
                grund: e.to_string(),
            })?;
        nachricht.inhalt_pruefen(&typ)?;
        Ok(nachricht)
    }

    /// Inhaltliche Pruefungen, die ueber Feld-Existenz hinausgehen
    fn inhalt_pruefen(&self, typ: &str) -> Result<(), ValidierungsFehler> {
        let ungueltig = |grund: String| ValidierungsFehler::Ungueltig {
            typ: typ.to_string(),
            grund,
        };
        match self {
            Self::DtmfSend { digits, .. } => {
                if let Some(c) = digits
                    .chars()
                    .find(|c| !(c.is_ascii_digit() || matches!(c, '*' | '#' | 'A'..='D' | 'w')))
                {
                    return Err(ungueltig(format!("ungueltige DTMF-Ziffer '{c}'")));
                }
            }
            Self::Auth { options, .. } => options.validieren().map_err(ungueltig)?,
            _ => {}
        }
        Ok(())
    }

    /// Nachrichtentyp fuer Logging
    pub fn typ(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Start { .. } => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::DtmfSend { .. } => "dtmf.send",
            Self::Transfer { .. } => "transfer",
            Self::Config { .. } => "config",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::ToolResult { .. } => "tool.result",
            Self::End { .. } => "end",
        }
    }
}

// ---------------------------------------------------------------------------
// Ausgehende Nachrichten
// ---------------------------------------------------------------------------

/// Nachrichten vom Session-Gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected {
        call_id: String,
        session_id: String,
        options: RealtimeOptions,
    },
    #[serde(rename = "stt.partial")]
    SttPartial { turn: u64, text: String },
    #[serde(rename = "stt.final")]
    SttFinal { turn: u64, text: String },
    #[serde(rename = "llm.delta")]
    LlmDelta { turn: u64, text: String },
    /// Synthetisiertes Audio, base64-kodiert im Session-Codec
    #[serde(rename = "tts.chunk", rename_all = "camelCase")]
    TtsChunk {
        turn: u64,
        seq: u32,
        audio: String,
        format: Codec,
        sample_rate: u32,
    },
    #[serde(rename = "tool.call")]
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    #[serde(rename = "control.bargein")]
    ControlBargein { turn: u64 },
    #[serde(rename = "emotion.window")]
    EmotionWindow(EnergyWindow),
    #[serde(rename = "emotion.state")]
    EmotionState { speaking: bool, confidence: f32 },
    #[serde(rename = "error", rename_all = "camelCase")]
    Error {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },
    #[serde(rename = "ping")]
    Ping { timestamp: i64 },
    #[serde(rename = "pong")]
    Pong { timestamp: i64 },
    /// An das Telefonie-Leg weitergereicht
    #[serde(rename = "dtmf.send")]
    DtmfSend {
        digits: String,
        method: Option<String>,
    },
    /// An das Telefonie-Leg weitergereicht
    #[serde(rename = "transfer")]
    Transfer { to: String, mode: Option<String> },
    #[serde(rename = "end")]
    End { reason: String },
}

impl OutboundMessage {
    /// Einfache `error`-Nachricht
    pub fn fehler(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            scope: None,
            limit: None,
            retry_after_ms: None,
        }
    }

    /// `tts.chunk` aus PCM16-Samples im gewuenschten Codec
    pub fn tts_chunk(turn: u64, seq: u32, pcm: &[i16], format: Codec, sample_rate: u32) -> Self {
        Self::TtsChunk {
            turn,
            seq,
            audio: STANDARD.encode(codec::encode(pcm, format)),
            format,
            sample_rate,
        }
    }

    /// Dekodiert das Audio eines `tts.chunk` zu PCM16
    pub fn tts_pcm(&self) -> Option<Vec<i16>> {
        match self {
            Self::TtsChunk { audio, format, .. } => {
                let bytes = STANDARD.decode(audio).ok()?;
                codec::decode(&bytes, *format).ok()
            }
            _ => None,
        }
    }

    /// Nachrichtentyp fuer Logging
    pub fn typ(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::SttPartial { .. } => "stt.partial",
            Self::SttFinal { .. } => "stt.final",
            Self::LlmDelta { .. } => "llm.delta",
            Self::TtsChunk { .. } => "tts.chunk",
            Self::ToolCall { .. } => "tool.call",
            Self::ControlBargein { .. } => "control.bargein",
            Self::EmotionWindow(_) => "emotion.window",
            Self::EmotionState { .. } => "emotion.state",
            Self::Error { .. } => "error",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::DtmfSend { .. } => "dtmf.send",
            Self::Transfer { .. } => "transfer",
            Self::End { .. } => "end",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_mit_agent_id() {
        let msg = InboundMessage::parsen(br#"{"type":"start","agentId":"agent-7"}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::Start {
                agent_id: "agent-7".into()
            }
        );
    }

    #[test]
    fn start_ohne_agent_id_abgelehnt() {
        let fehler = InboundMessage::parsen(br#"{"type":"start"}"#).unwrap_err();
        assert_eq!(
            fehler,
            ValidierungsFehler::FehlendesFeld {
                typ: "start".into(),
                feld: "agentId"
            }
        );
        assert!(InboundMessage::parsen(br#"{"type":"start","agentId":"  "}"#).is_err());
    }

    #[test]
    fn pflichtfelder_pro_typ() {
        assert!(InboundMessage::parsen(br#"{"type":"transfer"}"#).is_err());
        assert!(InboundMessage::parsen(br#"{"type":"dtmf.send"}"#).is_err());
        assert!(InboundMessage::parsen(br#"{"type":"ping"}"#).is_err());
        assert!(InboundMessage::parsen(br#"{"type":"ping","timestamp":"x"}"#).is_err());
        assert!(InboundMessage::parsen(br#"{"type":"config","config":3}"#).is_err());
        assert!(InboundMessage::parsen(br#"{"type":"tool.result","id":"t1"}"#).is_err());
        assert!(InboundMessage::parsen(br#"{"type":"transfer","to":"+4930123"}"#).is_ok());
        assert!(InboundMessage::parsen(br#"{"type":"pause"}"#).is_ok());
    }

    #[test]
    fn dtmf_ziffern_geprueft() {
        let ok = InboundMessage::parsen(br#"{"type":"dtmf.send","digits":"12*#","method":"rfc2833"}"#);
        assert!(ok.is_ok());
        let falsch = InboundMessage::parsen(br#"{"type":"dtmf.send","digits":"12x"}"#);
        assert!(matches!(falsch, Err(ValidierungsFehler::Ungueltig { .. })));
    }

    #[test]
    fn unbekannter_typ_und_kaputtes_json() {
        assert_eq!(
            InboundMessage::parsen(br#"{"type":"dance"}"#),
            Err(ValidierungsFehler::UnbekannterTyp("dance".into()))
        );
        assert_eq!(
            InboundMessage::parsen(br#"{"agentId":"a"}"#),
            Err(ValidierungsFehler::FehlenderTyp)
        );
        assert!(matches!(
            InboundMessage::parsen(b"{nope"),
            Err(ValidierungsFehler::KeinJson(_))
        ));
    }

    #[test]
    fn config_mit_unbekanntem_feld_abgelehnt() {
        let fehler =
            InboundMessage::parsen(br#"{"type":"config","config":{"tempo":2}}"#).unwrap_err();
        assert!(matches!(fehler, ValidierungsFehler::Ungueltig { .. }));
    }

    #[test]
    fn auth_mit_optionen() {
        let msg = InboundMessage::parsen(
            br#"{"type":"auth","callId":"c1","timestamp":1700000000,"signature":"ab",
                "options":{"audioFormat":"mulaw","sampleRate":8000}}"#,
        )
        .unwrap();
        match msg {
            InboundMessage::Auth {
                call_id, options, ..
            } => {
                assert_eq!(call_id, "c1");
                assert_eq!(options.audio_format, Codec::Mulaw);
            }
            andere => panic!("unerwartet: {andere:?}"),
        }
    }

    #[test]
    fn fehler_nachricht_mit_scope() {
        let msg = OutboundMessage::Error {
            code: ErrorCode::AdmissionRejected,
            message: "limit".into(),
            scope: Some("campaign".into()),
            limit: Some(5),
            retry_after_ms: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "ADMISSION_REJECTED");
        assert_eq!(json["scope"], "campaign");
        assert!(json.get("retryAfterMs").is_none());
    }

    #[test]
    fn tts_chunk_audio_kodiert() {
        let pcm = vec![100i16, -100, 2000];
        let msg = OutboundMessage::tts_chunk(1, 0, &pcm, Codec::Linear16, 16_000);
        assert_eq!(msg.tts_pcm().unwrap(), pcm);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "tts.chunk");
        assert_eq!(json["sampleRate"], 16_000);
    }

    #[test]
    fn emotion_window_flach_serialisiert() {
        let fenster = EnergyWindow {
            start_ms: 0,
            end_ms: 250,
            energy_db: -20.0,
            speaking: true,
            noise_floor_db: -50.0,
            snr_db: 30.0,
            bands: Default::default(),
            vad_confidence: 0.9,
        };
        let json = serde_json::to_value(OutboundMessage::EmotionWindow(fenster)).unwrap();
        assert_eq!(json["type"], "emotion.window");
        assert_eq!(json["speaking"], true);
    }

    #[test]
    fn close_codes_eindeutig() {
        for code in [
            CloseCode::AuthFehlgeschlagen,
            CloseCode::ZuVieleVerbindungen,
            CloseCode::ZulassungAbgelehnt,
            CloseCode::IpGesperrt,
        ] {
            assert_eq!(CloseCode::aus_code(code.code()), Some(code));
        }
        assert!(!CloseCode::AuthFehlgeschlagen.ist_wiederholbar());
    }
}
