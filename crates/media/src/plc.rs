//! Packet Loss Concealment (PLC)
//!
//! Erzeugt Ersatz-Audio fuer fehlende Frames, um hoerbare Luecken zu
//! vermeiden. Wird vom Jitter Buffer aufgerufen, sobald ein Frame endgueltig
//! als verloren gilt.
//!
//! ## Strategien
//! 1. **Wiederholung mit Fade**: die Samples des letzten gespielten Frames
//!    werden wiederholt, pro Verlust um `FADE_FAKTOR` abgeschwaecht.
//! 2. **Stille**: nach `MAX_WIEDERHOLUNGEN` aufeinanderfolgenden Verlusten.

/// Maximale Anzahl Wiederholungen vor dem Uebergang zu Stille
pub const MAX_WIEDERHOLUNGEN: u32 = 3;

/// Fade-Faktor pro Wiederholung (0.75 = 25% Abnahme pro Frame)
pub const FADE_FAKTOR: f32 = 0.75;

// ---------------------------------------------------------------------------
// PLC-Ergebnis
// ---------------------------------------------------------------------------

/// Ergebnis einer Verdeckung
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlcErgebnis {
    /// Letzter Frame wiederholt (abgeschwaecht)
    Wiederholung(Vec<i16>),
    /// Zu viele Verluste in Folge – Stille
    Stille(Vec<i16>),
}

impl PlcErgebnis {
    pub fn samples(&self) -> &[i16] {
        match self {
            Self::Wiederholung(s) | Self::Stille(s) => s,
        }
    }

    pub fn into_samples(self) -> Vec<i16> {
        match self {
            Self::Wiederholung(s) | Self::Stille(s) => s,
        }
    }
}

/// PLC-Statistiken
#[derive(Debug, Clone, Default)]
pub struct PlcStatistik {
    pub originale: u64,
    pub wiederholungen: u64,
    pub stille_eingefuegt: u64,
}

impl PlcStatistik {
    /// Anteil verdeckter Frames (0.0–1.0)
    pub fn verlust_rate(&self) -> f64 {
        let verdeckt = self.wiederholungen + self.stille_eingefuegt;
        let gesamt = self.originale + verdeckt;
        if gesamt == 0 {
            0.0
        } else {
            verdeckt as f64 / gesamt as f64
        }
    }
}

// ---------------------------------------------------------------------------
// PacketLossConcealer
// ---------------------------------------------------------------------------

/// Verdeckt Frame-Verluste im Wiedergabe-Pfad (nicht thread-safe, pro Session)
#[derive(Debug, Default)]
pub struct PacketLossConcealer {
    /// Samples des letzten Original-Frames
    letzte_samples: Option<Vec<i16>>,
    aufeinanderfolgende_verluste: u32,
    statistik: PlcStatistik,
}

impl PacketLossConcealer {
    pub fn neu() -> Self {
        Self::default()
    }

    /// Merkt sich einen regulaer gespielten Frame
    pub fn original(&mut self, samples: &[i16]) {
        self.letzte_samples = Some(samples.to_vec());
        self.aufeinanderfolgende_verluste = 0;
        self.statistik.originale += 1;
    }

    /// Erzeugt Ersatz-Samples fuer einen verlorenen Frame
    ///
    /// `laenge` gilt nur, wenn noch kein Original-Frame gespielt wurde.
    pub fn verdecken(&mut self, laenge: usize) -> PlcErgebnis {
        self.aufeinanderfolgende_verluste += 1;

        let letzte = match &self.letzte_samples {
            Some(s) if self.aufeinanderfolgende_verluste <= MAX_WIEDERHOLUNGEN => s,
            Some(s) => {
                self.statistik.stille_eingefuegt += 1;
                tracing::trace!(
                    verluste = self.aufeinanderfolgende_verluste,
                    "PLC: Stille eingefuegt"
                );
                return PlcErgebnis::Stille(vec![0; s.len()]);
            }
            None => {
                self.statistik.stille_eingefuegt += 1;
                return PlcErgebnis::Stille(vec![0; laenge]);
            }
        };

        let faktor = FADE_FAKTOR.powi(self.aufeinanderfolgende_verluste as i32);
        let samples = letzte
            .iter()
            .map(|&s| (s as f32 * faktor).round() as i16)
            .collect();
        self.statistik.wiederholungen += 1;
        PlcErgebnis::Wiederholung(samples)
    }

    pub fn statistik(&self) -> &PlcStatistik {
        &self.statistik
    }

    pub fn reset(&mut self) {
        self.letzte_samples = None;
        self.aufeinanderfolgende_verluste = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wiederholung_wird_leiser() {
        let mut plc = PacketLossConcealer::neu();
        plc.original(&[1000, -1000, 400]);

        let erste = plc.verdecken(3);
        assert_eq!(erste, PlcErgebnis::Wiederholung(vec![750, -750, 300]));
        let zweite = plc.verdecken(3);
        assert!(zweite.samples()[0].abs() < erste.samples()[0].abs());
    }

    #[test]
    fn stille_nach_max_wiederholungen() {
        let mut plc = PacketLossConcealer::neu();
        plc.original(&[1000; 160]);
        for _ in 0..MAX_WIEDERHOLUNGEN {
            assert!(matches!(plc.verdecken(160), PlcErgebnis::Wiederholung(_)));
        }
        let stille = plc.verdecken(160);
        assert_eq!(stille, PlcErgebnis::Stille(vec![0; 160]));
        assert_eq!(plc.statistik().stille_eingefuegt, 1);

        // Neues Original setzt die Folge zurueck
        plc.original(&[8; 160]);
        assert!(matches!(plc.verdecken(160), PlcErgebnis::Wiederholung(_)));
    }

    #[test]
    fn ohne_original_stille() {
        let mut plc = PacketLossConcealer::neu();
        assert_eq!(plc.verdecken(4), PlcErgebnis::Stille(vec![0; 4]));
        assert!(plc.statistik().verlust_rate() > 0.99);
    }
}
