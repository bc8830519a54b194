//! IP-Schutz: Allowlist, Blockliste, gleitendes Anfragefenster
//!
//! Reihenfolge der Pruefung:
//! 1. Allowlist (exakt oder IPv4-CIDR) – Treffer umgeht alles Weitere
//! 2. Dauerhafte Blockliste
//! 3. Temporaere Sperre
//! 4. Gleitendes Fenster; Ueberschreitung fuehrt zur temporaeren Sperre

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::IpSchutzConfig;
use crate::error::{AdmissionError, AdmissionResult};

// ---------------------------------------------------------------------------
// IpRegel
// ---------------------------------------------------------------------------

/// Eintrag einer Allow- oder Blockliste
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpRegel {
    Exakt(IpAddr),
    /// IPv4-Netz als (Netzadresse, Maske)
    Cidr { netz: u32, maske: u32 },
}

impl IpRegel {
    /// Parst `a.b.c.d`, `a.b.c.d/n` oder eine IPv6-Adresse
    pub fn parsen(text: &str) -> Result<Self, String> {
        let text = text.trim();
        match text.split_once('/') {
            None => text
                .parse::<IpAddr>()
                .map(Self::Exakt)
                .map_err(|e| format!("Ungueltige Adresse '{text}': {e}")),
            Some((adresse, praefix)) => {
                let adresse: Ipv4Addr = adresse
                    .parse()
                    .map_err(|e| format!("Ungueltiges CIDR '{text}': {e}"))?;
                let praefix: u32 = praefix
                    .parse()
                    .ok()
                    .filter(|p| *p <= 32)
                    .ok_or_else(|| format!("Ungueltige Praefixlaenge in '{text}'"))?;
                let maske = if praefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - praefix)
                };
                Ok(Self::Cidr {
                    netz: u32::from(adresse) & maske,
                    maske,
                })
            }
        }
    }

    pub fn enthaelt(&self, ip: &IpAddr) -> bool {
        match (self, ip) {
            (Self::Exakt(regel), ip) => regel == ip,
            (Self::Cidr { netz, maske }, IpAddr::V4(v4)) => u32::from(*v4) & maske == *netz,
            (Self::Cidr { .. }, IpAddr::V6(v6)) => v6
                .to_ipv4_mapped()
                .map(|v4| self.enthaelt(&IpAddr::V4(v4)))
                .unwrap_or(false),
        }
    }
}

fn regeln_parsen(liste: &[String]) -> Result<Vec<IpRegel>, String> {
    liste
        .iter()
        .filter(|s| !s.trim().is_empty())
        .map(|s| IpRegel::parsen(s))
        .collect()
}

// ---------------------------------------------------------------------------
// IpGuard
// ---------------------------------------------------------------------------

/// Ergebnis einer erfolgreichen Pruefung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpEntscheidung {
    Erlaubt,
    /// Allowlist-Treffer, Zaehler unberuehrt
    Allowlist,
}

#[derive(Debug, Default)]
struct IpEintrag {
    anfragen: VecDeque<Instant>,
    gesperrt_bis: Option<Instant>,
}

/// Schutz gegen Verbindungsfluten einzelner Adressen
pub struct IpGuard {
    allowlist: Vec<IpRegel>,
    blocklist: Vec<IpRegel>,
    fenster: Duration,
    max_anfragen: u32,
    sperrdauer: Duration,
    eintraege: Mutex<HashMap<IpAddr, IpEintrag>>,
}

impl IpGuard {
    pub fn neu(config: &IpSchutzConfig) -> AdmissionResult<Self> {
        Ok(Self {
            allowlist: regeln_parsen(&config.allowlist).map_err(AdmissionError::Konfiguration)?,
            blocklist: regeln_parsen(&config.blocklist).map_err(AdmissionError::Konfiguration)?,
            fenster: config.fenster(),
            max_anfragen: config.max_anfragen.max(1),
            sperrdauer: config.sperrdauer(),
            eintraege: Mutex::new(HashMap::new()),
        })
    }

    pub fn pruefen(&self, ip: IpAddr) -> AdmissionResult<IpEntscheidung> {
        self.pruefen_bei(ip, Instant::now())
    }

    /// Prueft und zaehlt einen Verbindungsversuch
    pub fn pruefen_bei(&self, ip: IpAddr, jetzt: Instant) -> AdmissionResult<IpEntscheidung> {
        if self.allowlist.iter().any(|r| r.enthaelt(&ip)) {
            return Ok(IpEntscheidung::Allowlist);
        }
        if self.blocklist.iter().any(|r| r.enthaelt(&ip)) {
            return Err(AdmissionError::IpGesperrt {
                ip,
                retry_after: None,
            });
        }

        let mut eintraege = self.eintraege.lock();
        let eintrag = eintraege.entry(ip).or_default();

        if let Some(bis) = eintrag.gesperrt_bis {
            if bis > jetzt {
                return Err(AdmissionError::IpGesperrt {
                    ip,
                    retry_after: Some(bis - jetzt),
                });
            }
            eintrag.gesperrt_bis = None;
            eintrag.anfragen.clear();
        }

        while let Some(&aeltester) = eintrag.anfragen.front() {
            if jetzt.saturating_duration_since(aeltester) >= self.fenster {
                eintrag.anfragen.pop_front();
            } else {
                break;
            }
        }
        eintrag.anfragen.push_back(jetzt);

        if eintrag.anfragen.len() > self.max_anfragen as usize {
            eintrag.gesperrt_bis = Some(jetzt + self.sperrdauer);
            tracing::warn!(
                ip = %ip,
                anfragen = eintrag.anfragen.len(),
                sperre_sek = self.sperrdauer.as_secs(),
                "IP temporaer gesperrt"
            );
            return Err(AdmissionError::IpRateLimit {
                ip,
                retry_after: self.sperrdauer,
            });
        }

        Ok(IpEntscheidung::Erlaubt)
    }

    pub fn ist_gesperrt_bei(&self, ip: &IpAddr, jetzt: Instant) -> bool {
        self.eintraege
            .lock()
            .get(ip)
            .and_then(|e| e.gesperrt_bis)
            .map(|bis| bis > jetzt)
            .unwrap_or(false)
    }

    /// Entfernt Eintraege ohne aktive Sperre und ohne Anfragen im Fenster
    pub fn aufraeumen_bei(&self, jetzt: Instant) -> usize {
        let mut eintraege = self.eintraege.lock();
        let vorher = eintraege.len();
        eintraege.retain(|_, e| {
            let gesperrt = e.gesperrt_bis.map(|bis| bis > jetzt).unwrap_or(false);
            let aktiv = e
                .anfragen
                .back()
                .map(|&t| jetzt.saturating_duration_since(t) < self.fenster)
                .unwrap_or(false);
            gesperrt || aktiv
        });
        vorher - eintraege.len()
    }

    pub fn anzahl_gesperrt_bei(&self, jetzt: Instant) -> usize {
        self.eintraege
            .lock()
            .values()
            .filter(|e| e.gesperrt_bis.map(|bis| bis > jetzt).unwrap_or(false))
            .count()
    }
}
