//! callbridge-admission – Zulassungskontrolle fuer neue Sessions
//!
//! ## Module
//! - [`ledger`] – Concurrency-Tokens (global + pro Kampagne) mit Liveness
//! - [`breaker`] – Circuit Breaker fuer den Zulassungspfad
//! - [`ip_guard`] – Allow-/Blockliste und Anfragefenster pro Adresse
//! - [`reaper`] – Periodisches Freigeben haengender Sessions
//! - [`controller`] – Fassade fuer Gateway und Control-Plane

pub mod breaker;
pub mod config;
pub mod controller;
pub mod error;
pub mod ip_guard;
pub mod ledger;
pub mod reaper;

pub use breaker::{BreakerStatus, BreakerZustand, CircuitBreaker, Versuch};
pub use config::{AdmissionConfig, IpSchutzConfig};
pub use controller::{AdmissionController, AdmissionSnapshot, Zulassung};
pub use error::{AdmissionError, AdmissionResult};
pub use ip_guard::{IpEntscheidung, IpGuard, IpRegel};
pub use ledger::{ConcurrencyToken, Registrierung, TokenLedger};
pub use reaper::{Reaper, ReaperSnapshot, SweepErgebnis};
