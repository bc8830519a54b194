//! Fehlertypen der Zulassungskontrolle

use std::net::IpAddr;
use std::time::Duration;

use callbridge_core::{CallId, CampaignId};
use thiserror::Error;

/// Grund einer abgelehnten Zulassung
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("Globales Limit erreicht ({limit} aktive Anrufe)")]
    GlobalesLimit { limit: u32 },

    #[error("Limit fuer {campaign} erreicht ({limit} aktive Anrufe)")]
    CampaignLimit { campaign: CampaignId, limit: u32 },

    #[error("Circuit Breaker offen, naechster Versuch in {} ms", retry_after.as_millis())]
    BreakerOffen { retry_after: Duration },

    /// Adresse steht auf der Blockliste oder ist temporaer gesperrt
    #[error("IP {ip} gesperrt")]
    IpGesperrt {
        ip: IpAddr,
        retry_after: Option<Duration>,
    },

    #[error("IP {ip} hat das Anfragelimit ueberschritten")]
    IpRateLimit { ip: IpAddr, retry_after: Duration },

    /// Statusmeldung nennt eine andere Kampagne als das Token
    #[error("Token von {call_id} gehoert zu {token}, gemeldet wurde {gemeldet}")]
    KampagneAbweichend {
        call_id: CallId,
        token: CampaignId,
        gemeldet: CampaignId,
    },

    #[error("Ungueltige Konfiguration: {0}")]
    Konfiguration(String),
}

impl AdmissionError {
    /// Bereich der Ablehnung fuer die `error`-Antwort (`scope`)
    pub fn scope(&self) -> &'static str {
        match self {
            Self::GlobalesLimit { .. } => "global",
            Self::CampaignLimit { .. } | Self::KampagneAbweichend { .. } => "campaign",
            Self::BreakerOffen { .. } => "circuit",
            Self::IpGesperrt { .. } | Self::IpRateLimit { .. } => "ip",
            Self::Konfiguration(_) => "config",
        }
    }

    /// Ueberschrittenes Limit, falls vorhanden
    pub fn limit(&self) -> Option<u32> {
        match self {
            Self::GlobalesLimit { limit } | Self::CampaignLimit { limit, .. } => Some(*limit),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::BreakerOffen { retry_after } | Self::IpRateLimit { retry_after, .. } => {
                Some(*retry_after)
            }
            Self::IpGesperrt { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Ob die Ablehnung die Kapazitaet betrifft (nicht die Gesundheit des Pfads)
    pub fn ist_kapazitaet(&self) -> bool {
        matches!(self, Self::GlobalesLimit { .. } | Self::CampaignLimit { .. })
    }
}

pub type AdmissionResult<T> = Result<T, AdmissionError>;
