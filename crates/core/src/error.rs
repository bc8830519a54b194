//! Fehlertypen fuer Callbridge-Core
//!
//! Die Fach-Crates (Protokoll, Media, Admission, Gateway) definieren eigene
//! Fehler; hier liegen nur die Fehler der gemeinsam genutzten Bausteine.

use thiserror::Error;

/// Result-Alias fuer Core-Operationen
pub type Result<T> = std::result::Result<T, CallbridgeError>;

#[derive(Debug, Error)]
pub enum CallbridgeError {
    // --- Timeline ---
    #[error("Zustell-Queue voll, Ereignis {0} verworfen")]
    ZustellungVoll(String),

    #[error("Zustell-Queue geschlossen, Ereignis {0} verworfen")]
    ZustellungGeschlossen(String),
}

impl CallbridgeError {
    /// Voll ist voruebergehend, geschlossen endgueltig
    pub fn ist_voruebergehend(&self) -> bool {
        matches!(self, Self::ZustellungVoll(_))
    }
}
