//! callbridge-media – Audio-Verarbeitung und RTP-Bridge
//!
//! ## Module
//! - [`frame`] – `AudioFrame` (Payload + dekodierte PCM16-Samples)
//! - [`jitter_buffer`] – Adaptiver Jitter Buffer mit Verdeckung
//! - [`plc`] – Packet Loss Concealment
//! - [`energy`] – Energie-basierter Sprach-Analyzer (VAD)
//! - [`rtp_endpoint`] – RTP-Sendezustand eines Legs
//! - [`uplink`] – Reconnectender Session-Uplink zum Gateway
//! - [`bridge`] – RTP/UDP-Legs zwischen Telefonie und Gateway

pub mod bridge;
pub mod energy;
pub mod error;
pub mod frame;
pub mod jitter_buffer;
pub mod plc;
pub mod rtp_endpoint;
pub mod uplink;

pub use bridge::{BridgeConfig, BridgeSnapshot, BridgeStatistik, LegHandle, MediaBridge};
pub use energy::{EnergyAnalyzer, EnergyConfig};
pub use error::{MediaError, MediaResult};
pub use frame::AudioFrame;
pub use jitter_buffer::{BufferSlot, JitterBuffer, JitterBufferConfig, JitterBufferStatistik};
pub use plc::PacketLossConcealer;
pub use rtp_endpoint::RtpEndpoint;
pub use uplink::{AudioRing, SessionUplink, UplinkConfig};
