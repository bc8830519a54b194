//! Fehlertypen fuer das Session-Gateway

use std::time::Duration;

use callbridge_admission::AdmissionError;
use callbridge_core::CallId;
use callbridge_protocol::{CloseCode, ErrorCode, OutboundMessage};
use thiserror::Error;

use crate::provider::ProviderError;

/// Fehlertyp fuer das Session-Gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// IO-Fehler (Socket, Frame-Codec)
    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake abgelehnt; der Grund wird nur geloggt
    #[error("Authentifizierung fehlgeschlagen: {0}")]
    AuthFehlgeschlagen(String),

    #[error("Keine Authentifizierung innerhalb von {0:?}")]
    AuthTimeout(Duration),

    #[error("Zu viele Verbindungen fuer {call_id} (max {max})")]
    ZuVieleVerbindungen { call_id: CallId, max: u32 },

    #[error("Zulassung abgelehnt: {0}")]
    Zulassung(#[from] AdmissionError),

    #[error("Heartbeat-Timeout")]
    HeartbeatTimeout,

    /// Token wurde von aussen freigegeben (Reaper, Status-Webhook)
    #[error("Token zwangsweise freigegeben")]
    Zwangsfreigabe,

    #[error("Provider-Fehler: {0}")]
    Provider(#[from] ProviderError),

    #[error("Protokollfehler: {0}")]
    Protokoll(String),

    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    #[error("Interner Fehler: {0}")]
    Intern(String),
}

impl GatewayError {
    pub fn intern(msg: impl Into<String>) -> Self {
        Self::Intern(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::AuthFehlgeschlagen(msg.into())
    }

    /// Close-Code, mit dem die Verbindung geschlossen wird
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::AuthFehlgeschlagen(_) => CloseCode::AuthFehlgeschlagen,
            Self::AuthTimeout(_) => CloseCode::AuthTimeout,
            Self::ZuVieleVerbindungen { .. } => CloseCode::ZuVieleVerbindungen,
            Self::Zulassung(e) if e.scope() == "ip" => CloseCode::IpGesperrt,
            Self::Zulassung(_) => CloseCode::ZulassungAbgelehnt,
            Self::HeartbeatTimeout => CloseCode::HeartbeatTimeout,
            Self::Zwangsfreigabe => CloseCode::Zwangsfreigabe,
            Self::Io(_)
            | Self::Provider(_)
            | Self::Protokoll(_)
            | Self::Konfiguration(_)
            | Self::Intern(_) => CloseCode::InternerFehler,
        }
    }

    /// `error`-Nachricht, die vor dem Schliessen gesendet wird
    ///
    /// Auth-Fehler bleiben generisch, damit keine Details nach aussen gehen.
    pub fn als_nachricht(&self) -> OutboundMessage {
        match self {
            Self::AuthFehlgeschlagen(_) => {
                OutboundMessage::fehler(ErrorCode::AuthFailed, "Authentication failed")
            }
            Self::AuthTimeout(_) => {
                OutboundMessage::fehler(ErrorCode::Timeout, "Authentication timed out")
            }
            Self::ZuVieleVerbindungen { max, .. } => OutboundMessage::Error {
                code: ErrorCode::ConnectionLimit,
                message: "Too many connections for this call".into(),
                scope: Some("call".into()),
                limit: Some(*max),
                retry_after_ms: None,
            },
            Self::Zulassung(e) => OutboundMessage::Error {
                code: if e.scope() == "ip" {
                    ErrorCode::IpBlocked
                } else {
                    ErrorCode::AdmissionRejected
                },
                message: e.to_string(),
                scope: Some(e.scope().into()),
                limit: e.limit(),
                retry_after_ms: e.retry_after().map(|d| d.as_millis() as u64),
            },
            Self::HeartbeatTimeout => {
                OutboundMessage::fehler(ErrorCode::Timeout, "Heartbeat timed out")
            }
            Self::Provider(e) => OutboundMessage::fehler(ErrorCode::ProviderFailure, e.to_string()),
            Self::Zwangsfreigabe => {
                OutboundMessage::fehler(ErrorCode::InternalError, "Session released")
            }
            Self::Protokoll(grund) => OutboundMessage::fehler(ErrorCode::InvalidMessage, grund.clone()),
            Self::Io(_) | Self::Konfiguration(_) | Self::Intern(_) => {
                OutboundMessage::fehler(ErrorCode::InternalError, "Internal error")
            }
        }
    }
}

/// Result-Typ fuer das Session-Gateway
pub type GatewayResult<T> = Result<T, GatewayError>;
