//! Fehlertypen fuer die Media-Engine

use callbridge_protocol::{CodecError, RtpError};
use thiserror::Error;

/// Fehlertyp fuer Media-Bridge und Session-Uplink
#[derive(Debug, Error)]
pub enum MediaError {
    /// IO-Fehler (UDP, TCP)
    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec-Fehler: {0}")]
    Codec(#[from] CodecError),

    #[error("RTP-Fehler: {0}")]
    Rtp(#[from] RtpError),

    /// Zufallsquelle fuer die SSRC nicht verfuegbar
    #[error("Zufallsquelle nicht verfuegbar")]
    Zufall,

    /// Gateway hat die Session mit einem Close-Code abgelehnt
    #[error("Session abgelehnt ({code}): {grund}")]
    Abgelehnt { code: u16, grund: String },

    /// Unerwartete Nachricht im Handshake
    #[error("Protokollfehler: {0}")]
    Protokoll(String),

    /// Reconnect-Versuche aufgebraucht
    #[error("Verbindung nach {0} Versuchen aufgegeben")]
    VersucheErschoepft(u32),

    #[error("Interner Fehler: {0}")]
    Intern(String),
}

impl MediaError {
    pub fn protokoll(msg: impl Into<String>) -> Self {
        Self::Protokoll(msg.into())
    }

    /// Ob ein erneuter Verbindungsversuch sinnvoll ist
    pub fn ist_wiederholbar(&self) -> bool {
        match self {
            Self::Io(_) | Self::Protokoll(_) => true,
            Self::Abgelehnt { code, .. } => {
                callbridge_protocol::CloseCode::aus_code(*code)
                    .map(|c| c.ist_wiederholbar())
                    .unwrap_or(false)
            }
            _ => false,
        }
    }
}

/// Result-Typ fuer die Media-Engine
pub type MediaResult<T> = Result<T, MediaError>;
