//! Konfiguration der Zulassungskontrolle

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// Limits, TTLs und Breaker-Parameter
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximale gleichzeitige Anrufe insgesamt
    pub global_limit: u32,
    /// Standard-Limit pro Kampagne
    pub campaign_limit: u32,
    /// Abweichende Limits einzelner Kampagnen
    pub campaign_limits: HashMap<String, u32>,
    /// Lebensdauer von Token und Liveness-Schluessel ohne Heartbeat
    pub token_ttl_sek: u64,
    /// Maximales Alter des letzten Timeline-Ereignisses
    pub call_timeout_sek: u64,
    pub reaper_intervall_sek: u64,
    /// Aufeinanderfolgende Fehlschlaege bis zum Oeffnen des Breakers
    pub breaker_schwelle: u32,
    pub breaker_cooldown_sek: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global_limit: 100,
            campaign_limit: 20,
            campaign_limits: HashMap::new(),
            token_ttl_sek: 120,
            call_timeout_sek: 3_600,
            reaper_intervall_sek: 30,
            breaker_schwelle: 5,
            breaker_cooldown_sek: 30,
        }
    }
}

impl AdmissionConfig {
    pub fn validieren(&self) -> Result<(), String> {
        if self.global_limit == 0 {
            return Err("global_limit muss > 0 sein".into());
        }
        if self.campaign_limit == 0 || self.campaign_limits.values().any(|&l| l == 0) {
            return Err("Kampagnen-Limits muessen > 0 sein".into());
        }
        if self.token_ttl_sek == 0 || self.reaper_intervall_sek == 0 {
            return Err("token_ttl_sek und reaper_intervall_sek muessen > 0 sein".into());
        }
        if self.breaker_schwelle == 0 {
            return Err("breaker_schwelle muss > 0 sein".into());
        }
        Ok(())
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_sek)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_sek)
    }

    pub fn reaper_intervall(&self) -> Duration {
        Duration::from_secs(self.reaper_intervall_sek)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_sek)
    }
}

/// IP-Schutz: Allow-/Blocklisten und Anfragefenster
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IpSchutzConfig {
    /// Exakte Adressen oder IPv4-CIDR-Bloecke; Treffer umgehen alle Pruefungen
    pub allowlist: Vec<String>,
    /// Dauerhaft gesperrte Adressen oder IPv4-CIDR-Bloecke
    pub blocklist: Vec<String>,
    pub fenster_sek: u64,
    /// Maximale Verbindungsversuche pro Adresse und Fenster
    pub max_anfragen: u32,
    /// Dauer der temporaeren Sperre nach Ueberschreitung
    pub sperrdauer_sek: u64,
    pub aufraeum_intervall_sek: u64,
}

impl Default for IpSchutzConfig {
    fn default() -> Self {
        Self {
            allowlist: Vec::new(),
            blocklist: Vec::new(),
            fenster_sek: 60,
            max_anfragen: 60,
            sperrdauer_sek: 300,
            aufraeum_intervall_sek: 60,
        }
    }
}

impl IpSchutzConfig {
    pub fn fenster(&self) -> Duration {
        Duration::from_secs(self.fenster_sek)
    }

    pub fn sperrdauer(&self) -> Duration {
        Duration::from_secs(self.sperrdauer_sek)
    }
}
