//! callbridge-core – Gemeinsame Typen, Fehlertypen und Call-Timeline
//!
//! Dieses Crate stellt die Bausteine bereit, die von allen anderen
//! Callbridge-Crates gemeinsam genutzt werden.

pub mod error;
pub mod timeline;
pub mod types;

// Re-Exporte fuer bequemen Zugriff
pub use error::{CallbridgeError, Result};
pub use timeline::{TimelineEvent, TimelineStore};
pub use types::{BandEnergie, CallId, CallStatus, CampaignId, EnergyWindow};
