//! callbridge-gateway – Session-Gateway
//!
//! Nimmt Session-Verbindungen an (Media-Bridge oder Client), fuehrt den
//! Handshake durch, fragt die Zulassungskontrolle und betreibt danach die
//! State Machine der Session samt Orchestrierung von Erkennung, Reasoning
//! und Synthese.
//!
//! ## Module
//! - [`auth`] – API-Key, Bearer-Token (EdDSA) und HMAC-Handshake
//! - [`limits`] – Verbindungen und Nachrichtenrate pro Anruf
//! - [`tokens`] – geteiltes Concurrency-Token pro Anruf
//! - [`timers`] – Stille-, Ping- und Heartbeat-Timer einer Session
//! - [`session`] – State Machine einer Verbindung
//! - [`orchestrator`] – ASR → Reasoning → TTS mit Barge-in
//! - [`provider`] – Schnittstellen der externen Provider
//! - [`dev_provider`] – lokale Provider ohne externe Dienste
//! - [`server`] – TCP-Listener mit IP-Schutz

pub mod auth;
pub mod config;
pub mod dev_provider;
pub mod error;
pub mod limits;
pub mod orchestrator;
pub mod provider;
pub mod server;
pub mod session;
pub mod state;
pub mod stats;
pub mod timers;
pub mod tokens;
pub mod tools;

pub use auth::{AuthConfig, AuthMethode, Authenticator};
pub use config::{GatewayConfig, SessionConfig};
pub use dev_provider::{EchoReasoner, EnergieRecognizer, TonSynthesizer};
pub use error::{GatewayError, GatewayResult};
pub use limits::CallLimits;
pub use orchestrator::{OrchestratorHandle, OrchestratorKontext};
pub use provider::{
    ProviderError, ProviderResult, ProviderSet, ReasoningEngine, SpeechRecognizer,
    SpeechSynthesizer,
};
pub use server::GatewayServer;
pub use session::{SessionConnection, SessionZustand};
pub use state::GatewayState;
pub use stats::{GatewaySnapshot, GatewayStatistik};
pub use timers::{SessionTimers, TimerEreignis};
pub use tokens::{CallTokens, TokenAnteil};
pub use tools::ToolBroker;
