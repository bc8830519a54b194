//! Schnittstellen zu externen Sprach-Providern (ASR, Reasoning, TTS)
//!
//! Alle Aufrufe sind asynchron und laufen ausserhalb des Audio-Pfads im
//! Orchestrator-Task. Ergebnisse fliessen ueber begrenzte Kanaele zurueck.

use std::sync::Arc;

use async_trait::async_trait;
use callbridge_core::CallId;
use callbridge_protocol::{OrchestrationConfig, RealtimeOptions};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::tools::ToolBroker;

// ---------------------------------------------------------------------------
// Fehler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("{provider}: Zeitlimit nach {ms} ms")]
    Zeitlimit { provider: &'static str, ms: u64 },

    #[error("{provider} nicht erreichbar: {grund}")]
    NichtErreichbar { provider: &'static str, grund: String },

    /// Anfrage abgelehnt; Wiederholen aendert nichts
    #[error("{provider} lehnt ab: {grund}")]
    Abgelehnt { provider: &'static str, grund: String },

    #[error("abgebrochen")]
    Abgebrochen,
}

impl ProviderError {
    pub fn ist_wiederholbar(&self) -> bool {
        matches!(self, Self::Zeitlimit { .. } | Self::NichtErreichbar { .. })
    }

    pub fn provider(&self) -> &'static str {
        match self {
            Self::Zeitlimit { provider, .. }
            | Self::NichtErreichbar { provider, .. }
            | Self::Abgelehnt { provider, .. } => provider,
            Self::Abgebrochen => "-",
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

// ---------------------------------------------------------------------------
// Spracherkennung
// ---------------------------------------------------------------------------

/// Eingabe an einen laufenden Erkennungsstrom
#[derive(Debug, Clone, PartialEq)]
pub enum AsrEingabe {
    Audio(Vec<i16>),
    /// Heuristisches Turn-Ende (Stille-Timer); der Provider soll finalisieren
    TurnEnde,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsrErgebnis {
    Teilweise(String),
    Final(String),
}

/// Geoeffneter Erkennungsstrom einer Session
pub struct AsrStrom {
    pub eingabe: mpsc::Sender<AsrEingabe>,
    pub ergebnisse: mpsc::Receiver<AsrErgebnis>,
}

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn oeffnen(
        &self,
        call_id: &CallId,
        options: &RealtimeOptions,
        config: &OrchestrationConfig,
    ) -> ProviderResult<AsrStrom>;
}

// ---------------------------------------------------------------------------
// Reasoning
// ---------------------------------------------------------------------------

/// Ein Beitrag im Gespraechsverlauf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beitrag {
    pub rolle: Rolle,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rolle {
    Anrufer,
    Agent,
}

#[derive(Debug, Clone)]
pub struct Anfrage {
    pub call_id: CallId,
    pub turn: u64,
    pub text: String,
    pub verlauf: Vec<Beitrag>,
    pub system_prompt: Option<String>,
    pub language: String,
}

#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Streamt die Antwort als Text-Deltas nach `aus`
    ///
    /// Werkzeuge werden ueber `werkzeuge` aufgerufen; der Aufruf wartet auf
    /// das passende `tool.result` des Clients.
    async fn antworten(
        &self,
        anfrage: Anfrage,
        werkzeuge: &ToolBroker,
        aus: mpsc::Sender<String>,
    ) -> ProviderResult<()>;
}

// ---------------------------------------------------------------------------
// Sprachsynthese
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Synthetisiert `text` und streamt PCM16-Bloecke nach `aus`
    async fn synthetisieren(
        &self,
        text: &str,
        config: &OrchestrationConfig,
        sample_rate: u32,
        aus: mpsc::Sender<Vec<i16>>,
    ) -> ProviderResult<()>;
}

/// Die drei Provider einer Session
#[derive(Clone)]
pub struct ProviderSet {
    pub asr: Arc<dyn SpeechRecognizer>,
    pub llm: Arc<dyn ReasoningEngine>,
    pub tts: Arc<dyn SpeechSynthesizer>,
}

impl ProviderSet {
    pub fn neu(
        asr: Arc<dyn SpeechRecognizer>,
        llm: Arc<dyn ReasoningEngine>,
        tts: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        Self { asr, llm, tts }
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet")
            .field("asr", &self.asr.name())
            .field("llm", &self.llm.name())
            .field("tts", &self.tts.name())
            .finish()
    }
}
