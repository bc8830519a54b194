//! Gemeinsame Identifikations- und Datentypen fuer Callbridge
//!
//! IDs verwenden das Newtype-Pattern, damit Call- und Kampagnen-IDs zur
//! Compilezeit nicht verwechselt werden koennen. Beide stammen von aussen
//! (Telefonie-Gateway bzw. Control-Plane) und sind daher freie Strings.

use serde::{Deserialize, Serialize};

/// ID eines Anrufs (vom Telefonie-Gateway vergeben, z.B. `call_sid`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    pub fn neu(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call:{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// ID einer Kampagne (Mandant) fuer die kampagnenweiten Concurrency-Limits
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CampaignId(pub String);

impl CampaignId {
    /// Kampagne fuer Anrufe ohne explizite Zuordnung
    pub const STANDARD: &'static str = "default";

    pub fn neu(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn standard() -> Self {
        Self(Self::STANDARD.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CampaignId {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Display for CampaignId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "campaign:{}", self.0)
    }
}

impl From<&str> for CampaignId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Anrufstatus
// ---------------------------------------------------------------------------

/// Status eines Anrufs, wie ihn die Control-Plane per Webhook meldet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Created,
    Ringing,
    Answered,
    Active,
    Completed,
    Failed,
}

impl CallStatus {
    /// Endzustaende geben das Concurrency-Token des Anrufs frei
    pub fn ist_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn als_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Ringing => "ringing",
            Self::Answered => "answered",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// Energie-Fenster
// ---------------------------------------------------------------------------

/// Energie pro Frequenzband (dBFS)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BandEnergie {
    pub low: f32,
    pub mid: f32,
    pub high: f32,
}

/// Ergebnis eines Analyse-Intervalls des Energie-Analyzers
///
/// Wird genau einmal pro Fenster erzeugt und danach nicht mehr veraendert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnergyWindow {
    /// Fensterbeginn in ms seit Beginn des Audiostroms
    pub start_ms: u64,
    /// Fensterende in ms seit Beginn des Audiostroms
    pub end_ms: u64,
    pub energy_db: f32,
    pub speaking: bool,
    pub noise_floor_db: f32,
    pub snr_db: f32,
    pub bands: BandEnergie,
    /// Weiches Sprachsignal 0..1, nie alleiniges Gate
    pub vad_confidence: f32,
}
