//! callbridge-protocol – Codecs und Netzwerkprotokoll-Definitionen
//!
//! - `codec`: zustandslose G.711 μ-law/A-law und linear16 Umwandlung
//! - `rtp`: RTP-Header parsen und schreiben
//! - `control`: JSON-Nachrichten der Session-Verbindung inkl. Validierung
//! - `wire`: Frame-Codec fuer die Session-Verbindung
//! - `signatur`: HMAC-SHA256 Handshake-Signatur

pub mod codec;
pub mod control;
pub mod options;
pub mod rtp;
pub mod signatur;
pub mod wire;

pub use codec::{Codec, CodecError};
pub use control::{CloseCode, ErrorCode, InboundMessage, OutboundMessage, ValidierungsFehler};
pub use options::{OrchestrationConfig, OrchestrationPatch, RealtimeOptions};
pub use rtp::{RtpError, RtpHeader, RtpPacket};
pub use wire::{Frame, FrameCodec};
