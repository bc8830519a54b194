//! Timer einer Session
//!
//! Buendelt Stille-Timer (Endpointing), Ping-Intervall und Liveness in einem
//! Zustand, der dem Session-Task gehoert. Der Task fragt [`naechste_frist`]
//! fuer sein `select!` ab und ruft danach [`pruefen`] auf.
//!
//! [`naechste_frist`]: SessionTimers::naechste_frist
//! [`pruefen`]: SessionTimers::pruefen

use std::time::{Duration, Instant};

/// Abgelaufener Timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEreignis {
    /// Seit `stille_timeout` kein Audio mehr (einmal pro Stillephase)
    Stille { seit: Duration },
    PingFaellig,
    /// Zu lange kein Lebenszeichen vom Client
    HeartbeatTimeout,
}

#[derive(Debug)]
pub struct SessionTimers {
    stille_timeout: Duration,
    ping_intervall: Duration,
    heartbeat_timeout: Duration,
    /// Letzter Audio-Frame; `None` solange der Stille-Timer nicht laeuft
    letztes_audio: Option<Instant>,
    stille_gemeldet: bool,
    letztes_lebenszeichen: Instant,
    naechster_ping: Instant,
    pausiert: bool,
    gestoppt: bool,
}

impl SessionTimers {
    pub fn neu(
        stille_timeout: Duration,
        ping_intervall: Duration,
        heartbeat_timeout: Duration,
        jetzt: Instant,
    ) -> Self {
        Self {
            stille_timeout,
            ping_intervall,
            heartbeat_timeout,
            letztes_audio: None,
            stille_gemeldet: false,
            letztes_lebenszeichen: jetzt,
            naechster_ping: jetzt + ping_intervall,
            pausiert: false,
            gestoppt: false,
        }
    }

    /// Jeder eingehende Audio-Frame setzt den Stille-Timer zurueck
    pub fn audio_empfangen(&mut self, jetzt: Instant) {
        self.letztes_audio = Some(jetzt);
        self.stille_gemeldet = false;
    }

    pub fn lebenszeichen(&mut self, jetzt: Instant) {
        self.letztes_lebenszeichen = jetzt;
    }

    pub fn stille_timeout_setzen(&mut self, timeout: Duration) {
        self.stille_timeout = timeout;
    }

    pub fn stille_timeout(&self) -> Duration {
        self.stille_timeout
    }

    /// Haelt den Stille-Timer an (Pause); Heartbeat laeuft weiter
    pub fn pausieren(&mut self) {
        self.pausiert = true;
    }

    pub fn fortsetzen(&mut self, jetzt: Instant) {
        self.pausiert = false;
        if self.letztes_audio.is_some() {
            self.letztes_audio = Some(jetzt);
            self.stille_gemeldet = false;
        }
    }

    /// Beim Schliessen: keine Ereignisse mehr
    pub fn stoppen(&mut self) {
        self.gestoppt = true;
    }

    fn stille_frist(&self) -> Option<Instant> {
        if self.pausiert || self.stille_gemeldet {
            return None;
        }
        self.letztes_audio.map(|t| t + self.stille_timeout)
    }

    /// Fruehester Zeitpunkt, zu dem [`pruefen`](Self::pruefen) etwas liefert
    pub fn naechste_frist(&self) -> Option<Instant> {
        if self.gestoppt {
            return None;
        }
        let heartbeat = self.letztes_lebenszeichen + self.heartbeat_timeout;
        [Some(self.naechster_ping), Some(heartbeat), self.stille_frist()]
            .into_iter()
            .flatten()
            .min()
    }

    pub fn pruefen(&mut self, jetzt: Instant) -> Vec<TimerEreignis> {
        let mut ereignisse = Vec::new();
        if self.gestoppt {
            return ereignisse;
        }

        if jetzt.saturating_duration_since(self.letztes_lebenszeichen) >= self.heartbeat_timeout {
            ereignisse.push(TimerEreignis::HeartbeatTimeout);
            return ereignisse;
        }

        if let (Some(frist), Some(letztes)) = (self.stille_frist(), self.letztes_audio) {
            if jetzt >= frist {
                self.stille_gemeldet = true;
                ereignisse.push(TimerEreignis::Stille {
                    seit: jetzt.saturating_duration_since(letztes),
                });
            }
        }

        if jetzt >= self.naechster_ping {
            self.naechster_ping = jetzt + self.ping_intervall;
            ereignisse.push(TimerEreignis::PingFaellig);
        }
        ereignisse
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: fn(u64) -> Duration = Duration::from_secs;

    fn timers(t: Instant) -> SessionTimers {
        SessionTimers::neu(S(3), S(15), S(45), t)
    }

    #[test]
    fn stille_erst_nach_audio() {
        let t = Instant::now();
        let mut timer = timers(t);
        assert!(timer.pruefen(t + S(10)).is_empty());

        timer.audio_empfangen(t + S(10));
        assert_eq!(timer.naechste_frist(), Some(t + S(13)));
        assert!(timer.pruefen(t + S(12)).is_empty());
        assert_eq!(
            timer.pruefen(t + S(13)),
            vec![TimerEreignis::Stille { seit: S(3) }]
        );
        // Nur einmal pro Stillephase
        assert!(timer.pruefen(t + S(14)).is_empty());

        timer.audio_empfangen(t + S(14));
        assert_eq!(timer.pruefen(t + S(15)), vec![TimerEreignis::PingFaellig]);
        assert_eq!(
            timer.pruefen(t + S(17)),
            vec![TimerEreignis::Stille { seit: S(3) }]
        );
    }

    #[test]
    fn audio_setzt_stille_zurueck() {
        let t = Instant::now();
        let mut timer = timers(t);
        for i in 0..10 {
            timer.audio_empfangen(t + Duration::from_millis(i * 20));
        }
        assert_eq!(
            timer.naechste_frist(),
            Some(t + Duration::from_millis(180) + S(3))
        );
    }

    #[test]
    fn pause_haelt_stille_an() {
        let t = Instant::now();
        let mut timer = timers(t);
        timer.audio_empfangen(t);
        timer.pausieren();
        assert!(timer.pruefen(t + S(5)).is_empty());

        timer.fortsetzen(t + S(5));
        assert!(timer.pruefen(t + S(7)).is_empty());
        assert_eq!(timer.pruefen(t + S(8)).len(), 1);
    }

    #[test]
    fn heartbeat_timeout() {
        let t = Instant::now();
        let mut timer = timers(t);
        timer.lebenszeichen(t + S(30));
        assert_eq!(timer.pruefen(t + S(30)), vec![TimerEreignis::PingFaellig]);
        assert!(!timer.pruefen(t + S(74)).contains(&TimerEreignis::HeartbeatTimeout));
        assert_eq!(
            timer.pruefen(t + S(75)),
            vec![TimerEreignis::HeartbeatTimeout]
        );
    }

    #[test]
    fn gestoppt_liefert_nichts() {
        let t = Instant::now();
        let mut timer = timers(t);
        timer.audio_empfangen(t);
        timer.stoppen();
        assert_eq!(timer.naechste_frist(), None);
        assert!(timer.pruefen(t + S(100)).is_empty());
    }
}
