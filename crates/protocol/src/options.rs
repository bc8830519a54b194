//! Session-Optionen und Orchestrierungs-Konfiguration
//!
//! `RealtimeOptions` werden einmalig im `auth`-Handshake ausgehandelt und
//! bestimmen, wie binaere Audio-Frames dekodiert werden.
//! `OrchestrationConfig` ist die vollstaendige Liste aller live aenderbaren
//! Parameter; `config`-Nachrichten liefern einen `OrchestrationPatch`, der
//! unbekannte Felder ablehnt und vor dem Anwenden validiert wird.

use serde::{Deserialize, Serialize};

use crate::codec::Codec;

// ---------------------------------------------------------------------------
// RealtimeOptions
// ---------------------------------------------------------------------------

/// Audio-Parameter der Session (im Handshake ausgehandelt)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct RealtimeOptions {
    pub audio_format: Codec,
    pub sample_rate: u32,
    pub channels: u8,
    pub enable_recording: bool,
    pub enable_transcription: bool,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            audio_format: Codec::Linear16,
            sample_rate: 16_000,
            channels: 1,
            enable_recording: false,
            enable_transcription: true,
        }
    }
}

impl RealtimeOptions {
    /// Prueft die Optionen auf unterstuetzte Kombinationen
    pub fn validieren(&self) -> Result<(), String> {
        if self.channels != 1 {
            return Err(format!("nur Mono unterstuetzt, erhalten: {} Kanaele", self.channels));
        }
        if !matches!(self.sample_rate, 8_000 | 16_000 | 24_000 | 48_000) {
            return Err(format!("nicht unterstuetzte Abtastrate: {}", self.sample_rate));
        }
        if matches!(self.audio_format, Codec::Mulaw | Codec::Alaw) && self.sample_rate != 8_000 {
            return Err(format!(
                "{} erfordert 8000 Hz, erhalten: {}",
                self.audio_format, self.sample_rate
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// OrchestrationConfig
// ---------------------------------------------------------------------------

/// Live aenderbare Orchestrierungs-Parameter einer Session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestrationConfig {
    /// Sprache fuer ASR/TTS (BCP 47)
    pub language: String,
    /// Stimme des TTS-Providers
    pub voice: String,
    /// Optionaler System-Prompt fuer die Reasoning-Engine
    pub system_prompt: Option<String>,
    /// Endpointing: Stille bis zum Turn-Ende
    pub silence_timeout_ms: u64,
    /// Barge-in aktiv (Sprache waehrend TTS bricht die Wiedergabe ab)
    pub barge_in: bool,
    pub llm_timeout_ms: u64,
    pub tts_timeout_ms: u64,
    pub tool_timeout_ms: u64,
    /// Lokale Wiederholungen bei Provider-Fehlern
    pub provider_retries: u32,
    /// Ersatz-Aeusserung wenn ein Provider endgueltig ausfaellt
    pub fallback_text: String,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            language: "en-US".into(),
            voice: "default".into(),
            system_prompt: None,
            silence_timeout_ms: 3_000,
            barge_in: true,
            llm_timeout_ms: 8_000,
            tts_timeout_ms: 8_000,
            tool_timeout_ms: 10_000,
            provider_retries: 2,
            fallback_text: "Sorry, I had trouble with that. Could you say it again?".into(),
        }
    }
}

/// Teil-Aktualisierung aus einer `config`-Nachricht
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OrchestrationPatch {
    pub language: Option<String>,
    pub voice: Option<String>,
    pub system_prompt: Option<String>,
    pub silence_timeout_ms: Option<u64>,
    pub barge_in: Option<bool>,
    pub llm_timeout_ms: Option<u64>,
    pub tts_timeout_ms: Option<u64>,
    pub tool_timeout_ms: Option<u64>,
    pub provider_retries: Option<u32>,
    pub fallback_text: Option<String>,
}

impl OrchestrationConfig {
    /// Prueft alle Werte auf sinnvolle Bereiche
    pub fn validieren(&self) -> Result<(), String> {
        if self.language.trim().is_empty() {
            return Err("language darf nicht leer sein".into());
        }
        if !(500..=30_000).contains(&self.silence_timeout_ms) {
            return Err(format!(
                "silenceTimeoutMs ausserhalb [500, 30000]: {}",
                self.silence_timeout_ms
            ));
        }
        for (name, wert) in [
            ("llmTimeoutMs", self.llm_timeout_ms),
            ("ttsTimeoutMs", self.tts_timeout_ms),
            ("toolTimeoutMs", self.tool_timeout_ms),
        ] {
            if !(100..=120_000).contains(&wert) {
                return Err(format!("{name} ausserhalb [100, 120000]: {wert}"));
            }
        }
        if self.provider_retries > 5 {
            return Err(format!("providerRetries > 5: {}", self.provider_retries));
        }
        if self.fallback_text.trim().is_empty() {
            return Err("fallbackText darf nicht leer sein".into());
        }
        Ok(())
    }

    /// Wendet einen Patch an und gibt die validierte neue Konfiguration zurueck
    ///
    /// Die bestehende Konfiguration bleibt bei einem Fehler unveraendert.
    pub fn anwenden(&self, patch: &OrchestrationPatch) -> Result<OrchestrationConfig, String> {
        let mut neu = self.clone();
        if let Some(v) = &patch.language {
            neu.language = v.clone();
        }
        if let Some(v) = &patch.voice {
            neu.voice = v.clone();
        }
        if let Some(v) = &patch.system_prompt {
            neu.system_prompt = Some(v.clone());
        }
        if let Some(v) = patch.silence_timeout_ms {
            neu.silence_timeout_ms = v;
        }
        if let Some(v) = patch.barge_in {
            neu.barge_in = v;
        }
        if let Some(v) = patch.llm_timeout_ms {
            neu.llm_timeout_ms = v;
        }
        if let Some(v) = patch.tts_timeout_ms {
            neu.tts_timeout_ms = v;
        }
        if let Some(v) = patch.tool_timeout_ms {
            neu.tool_timeout_ms = v;
        }
        if let Some(v) = patch.provider_retries {
            neu.provider_retries = v;
        }
        if let Some(v) = &patch.fallback_text {
            neu.fallback_text = v.clone();
        }
        neu.validieren()?;
        Ok(neu)
    }
}
