//! Wire-Format der Session-Verbindung
//!
//! Frame-basiertes Protokoll ueber einen Byte-Stream (TCP oder In-Memory):
//!
//! ```text
//! +--------+--------+--------+--------+--------+----...----+
//! | Laenge (u32 BE, inkl. Art-Byte)   |  Art   |  Inhalt   |
//! +--------+--------+--------+--------+--------+----...----+
//! ```
//!
//! | Art | Inhalt |
//! |-----|--------|
//! | 0   | JSON-Steuerungsnachricht (UTF-8) |
//! | 1   | Audio: `seq` (u16 BE) + `timestamp` (u32 BE) + Codec-Payload |
//! | 2   | Close: Code (u16 BE) + Grund (UTF-8) |
//!
//! JSON wird bewusst erst oberhalb des Codecs geparst: eine ungueltige
//! Nachricht soll eine `error`-Antwort erzeugen, keinen Lesefehler.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

// ---------------------------------------------------------------------------
// Konstanten
// ---------------------------------------------------------------------------

/// Standard-maximale Frame-Groesse (1 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Groesse des Laengen-Felds in Bytes
pub const LENGTH_FIELD_SIZE: usize = 4;

const ART_JSON: u8 = 0;
const ART_AUDIO: u8 = 1;
const ART_CLOSE: u8 = 2;

/// Audio-Kopf: seq (2) + timestamp (4)
const AUDIO_KOPF: usize = 6;

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// Ein Frame der Session-Verbindung
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Rohe JSON-Bytes einer Steuerungsnachricht
    Json(Bytes),
    /// Binaerer Audio-Frame
    Audio {
        seq: u16,
        timestamp: u32,
        payload: Bytes,
    },
    /// Verbindung wird mit Code geschlossen
    Close { code: u16, grund: String },
}

impl Frame {
    /// Serialisiert eine Nachricht als JSON-Frame
    pub fn json<T: Serialize>(nachricht: &T) -> io::Result<Self> {
        let bytes = serde_json::to_vec(nachricht).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("JSON-Serialisierung fehlgeschlagen: {}", e),
            )
        })?;
        Ok(Self::Json(Bytes::from(bytes)))
    }

    pub fn close(code: u16, grund: impl Into<String>) -> Self {
        Self::Close {
            code,
            grund: grund.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// FrameCodec
// ---------------------------------------------------------------------------

/// tokio-util Codec fuer die Session-Verbindung
///
/// Implementiert `Encoder<Frame>` und `Decoder` fuer die Verwendung mit
/// `tokio_util::codec::Framed`.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Maximale erlaubte Frame-Groesse in Bytes
    max_frame_size: usize,
}

impl FrameCodec {
    /// Erstellt einen neuen `FrameCodec` mit Standard-Limits
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Erstellt einen `FrameCodec` mit benutzerdefinierter maximaler Frame-Groesse
    pub fn with_max_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn ungueltig(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max_frame_size {
            return Err(ungueltig(format!(
                "Frame zu gross: {} Bytes (Maximum: {} Bytes)",
                length, self.max_frame_size
            )));
        }
        if length == 0 {
            return Err(ungueltig("Leerer Frame ohne Art-Byte".into()));
        }

        let total_size = LENGTH_FIELD_SIZE + length;
        if src.len() < total_size {
            src.reserve(total_size - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_SIZE);
        let art = src.get_u8();
        let mut inhalt = src.split_to(length - 1);

        let frame = match art {
            ART_JSON => Frame::Json(inhalt.freeze()),
            ART_AUDIO => {
                if inhalt.len() < AUDIO_KOPF {
                    return Err(ungueltig(format!(
                        "Audio-Frame zu kurz: {} Bytes",
                        inhalt.len()
                    )));
                }
                let seq = inhalt.get_u16();
                let timestamp = inhalt.get_u32();
                Frame::Audio {
                    seq,
                    timestamp,
                    payload: inhalt.freeze(),
                }
            }
            ART_CLOSE => {
                if inhalt.len() < 2 {
                    return Err(ungueltig("Close-Frame ohne Code".into()));
                }
                let code = inhalt.get_u16();
                let grund = String::from_utf8_lossy(&inhalt).into_owned();
                Frame::Close { code, grund }
            }
            andere => return Err(ungueltig(format!("Unbekannte Frame-Art: {}", andere))),
        };

        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + match &item {
            Frame::Json(bytes) => bytes.len(),
            Frame::Audio { payload, .. } => AUDIO_KOPF + payload.len(),
            Frame::Close { grund, .. } => 2 + grund.len(),
        };

        if length > self.max_frame_size {
            return Err(ungueltig(format!(
                "Nachricht zu gross: {} Bytes (Maximum: {} Bytes)",
                length, self.max_frame_size
            )));
        }

        dst.reserve(LENGTH_FIELD_SIZE + length);
        dst.put_u32(length as u32);
        match item {
            Frame::Json(bytes) => {
                dst.put_u8(ART_JSON);
                dst.put_slice(&bytes);
            }
            Frame::Audio {
                seq,
                timestamp,
                payload,
            } => {
                dst.put_u8(ART_AUDIO);
                dst.put_u16(seq);
                dst.put_u32(timestamp);
                dst.put_slice(&payload);
            }
            Frame::Close { code, grund } => {
                dst.put_u8(ART_CLOSE);
                dst.put_u16(code);
                dst.put_slice(grund.as_bytes());
            }
        }
        Ok(())
    }
}
