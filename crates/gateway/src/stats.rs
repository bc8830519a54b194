//! Zaehler des Session-Gateways
//!
//! Lock-freie Atomics, die von allen Session-Tasks geteilt werden. Die
//! Metriken lesen sie ueber [`GatewayStatistik::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct GatewayStatistik {
    pub sessions_gesamt: AtomicU64,
    pub sessions_aktiv: AtomicU64,
    pub auth_fehlgeschlagen: AtomicU64,
    pub verbindungslimit: AtomicU64,
    pub zulassung_abgelehnt: AtomicU64,
    pub nachrichten_ungueltig: AtomicU64,
    pub rate_limitiert: AtomicU64,
    pub audio_frames: AtomicU64,
    pub audio_verworfen: AtomicU64,
    pub dekodierfehler: AtomicU64,
    pub asr_verworfen: AtomicU64,
    pub pakete_spaet: AtomicU64,
    pub pakete_verdeckt: AtomicU64,
    pub stille_ereignisse: AtomicU64,
    pub turns: AtomicU64,
    pub barge_ins: AtomicU64,
    pub provider_fallbacks: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySnapshot {
    pub sessions_gesamt: u64,
    pub sessions_aktiv: u64,
    pub auth_fehlgeschlagen: u64,
    pub verbindungslimit: u64,
    pub zulassung_abgelehnt: u64,
    pub nachrichten_ungueltig: u64,
    pub rate_limitiert: u64,
    pub audio_frames: u64,
    pub audio_verworfen: u64,
    pub dekodierfehler: u64,
    pub asr_verworfen: u64,
    pub pakete_spaet: u64,
    pub pakete_verdeckt: u64,
    pub stille_ereignisse: u64,
    pub turns: u64,
    pub barge_ins: u64,
    pub provider_fallbacks: u64,
}

impl GatewayStatistik {
    pub fn erhoehen(zaehler: &AtomicU64) {
        zaehler.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_beendet(&self) {
        // Kein Unterlauf bei doppeltem Aufruf
        let _ = self
            .sessions_aktiv
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn snapshot(&self) -> GatewaySnapshot {
        let l = |z: &AtomicU64| z.load(Ordering::Relaxed);
        GatewaySnapshot {
            sessions_gesamt: l(&self.sessions_gesamt),
            sessions_aktiv: l(&self.sessions_aktiv),
            auth_fehlgeschlagen: l(&self.auth_fehlgeschlagen),
            verbindungslimit: l(&self.verbindungslimit),
            zulassung_abgelehnt: l(&self.zulassung_abgelehnt),
            nachrichten_ungueltig: l(&self.nachrichten_ungueltig),
            rate_limitiert: l(&self.rate_limitiert),
            audio_frames: l(&self.audio_frames),
            audio_verworfen: l(&self.audio_verworfen),
            dekodierfehler: l(&self.dekodierfehler),
            asr_verworfen: l(&self.asr_verworfen),
            pakete_spaet: l(&self.pakete_spaet),
            pakete_verdeckt: l(&self.pakete_verdeckt),
            stille_ereignisse: l(&self.stille_ereignisse),
            turns: l(&self.turns),
            barge_ins: l(&self.barge_ins),
            provider_fallbacks: l(&self.provider_fallbacks),
        }
    }
}
