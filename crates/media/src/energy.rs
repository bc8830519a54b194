//! Energie-basierter Sprach-Analyzer
//!
//! Sammelt PCM16-Samples zu Analyse-Fenstern (Standard 250 ms) und erzeugt
//! pro Fenster ein [`EnergyWindow`] auf einem begrenzten Kanal. Ist der
//! Kanal voll, wird das Fenster verworfen; der Audio-Pfad blockiert nie.
//!
//! Pro Fenster:
//! - RMS-Energie in dBFS, unter dem Noise-Gate der Sentinel-Wert
//! - Rauschboden als EMA ueber leise Fenster
//! - Sprech-Schwelle `Rauschboden + Offset`, begrenzt auf `[min, max]`
//! - Hysterese: Zustandswechsel erst nach `min_hold_windows` Fenstern
//! - Drei Baender (tief/mitte/hoch) ueber einfache IIR-Tiefpaesse

use callbridge_core::{BandEnergie, EnergyWindow};
use serde::Deserialize;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Konfiguration fuer den Energie-Analyzer
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnergyConfig {
    /// Fensterlaenge in ms
    pub intervall_ms: u32,
    pub sample_rate: u32,
    /// Unterhalb dieses Pegels gilt ein Fenster als Stille
    pub noise_gate_dbfs: f32,
    /// Gemeldeter Pegel fuer Fenster unter dem Noise-Gate
    pub sentinel_db: f32,
    /// Abstand der Sprech-Schwelle zum Rauschboden
    pub schwellen_offset_db: f32,
    /// Feste Schwelle (ohne Adaption) bzw. Startwert
    pub start_schwelle_db: f32,
    pub adaptiv: bool,
    pub schwelle_min_db: f32,
    pub schwelle_max_db: f32,
    /// EMA-Faktor fuer den Rauschboden
    pub noise_floor_alpha: f32,
    /// Anzahl uebereinstimmender Fenster fuer einen Zustandswechsel
    pub min_hold_windows: u32,
    /// Kapazitaet des Ausgabe-Kanals
    pub kanal_kapazitaet: usize,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            intervall_ms: 250,
            sample_rate: 16_000,
            noise_gate_dbfs: -70.0,
            sentinel_db: -120.0,
            schwellen_offset_db: 10.0,
            start_schwelle_db: -45.0,
            adaptiv: true,
            schwelle_min_db: -60.0,
            schwelle_max_db: -20.0,
            noise_floor_alpha: 0.1,
            min_hold_windows: 2,
            kanal_kapazitaet: 32,
        }
    }
}

impl EnergyConfig {
    pub fn validieren(&self) -> Result<(), String> {
        if self.intervall_ms == 0 || self.sample_rate == 0 {
            return Err("intervall_ms und sample_rate muessen > 0 sein".into());
        }
        if self.schwelle_min_db > self.schwelle_max_db {
            return Err(format!(
                "schwelle_min_db ({}) > schwelle_max_db ({})",
                self.schwelle_min_db, self.schwelle_max_db
            ));
        }
        if !(0.0..=1.0).contains(&self.noise_floor_alpha) {
            return Err("noise_floor_alpha muss in [0, 1] liegen".into());
        }
        if self.min_hold_windows == 0 || self.kanal_kapazitaet == 0 {
            return Err("min_hold_windows und kanal_kapazitaet muessen > 0 sein".into());
        }
        Ok(())
    }

    fn samples_pro_fenster(&self) -> usize {
        (self.sample_rate as u64 * self.intervall_ms as u64 / 1000).max(1) as usize
    }
}

// ---------------------------------------------------------------------------
// Band-Filter
// ---------------------------------------------------------------------------

/// Einpoliger IIR-Tiefpass
#[derive(Debug, Clone)]
struct Tiefpass {
    alpha: f32,
    zustand: f32,
}

impl Tiefpass {
    fn neu(grenzfrequenz: f32, sample_rate: u32) -> Self {
        let alpha = 1.0 - (-2.0 * std::f32::consts::PI * grenzfrequenz / sample_rate as f32).exp();
        Self {
            alpha,
            zustand: 0.0,
        }
    }

    fn filtern(&mut self, x: f32) -> f32 {
        self.zustand += self.alpha * (x - self.zustand);
        self.zustand
    }
}

/// Akkumulierte Leistung pro Band
#[derive(Debug, Default, Clone, Copy)]
struct BandLeistung {
    low: f64,
    mid: f64,
    high: f64,
}

// ---------------------------------------------------------------------------
// EnergyAnalyzer
// ---------------------------------------------------------------------------

/// Energie-Analyzer einer Session (exklusiv im Session-Task)
pub struct EnergyAnalyzer {
    config: EnergyConfig,
    ausgabe: mpsc::Sender<EnergyWindow>,

    // Aktuelles Fenster
    summe_quadrate: f64,
    anzahl: usize,
    baender: BandLeistung,
    tief: Tiefpass,
    mitte: Tiefpass,

    /// Bereits abgeschlossene Samples (Zeitbasis der Fenster)
    verarbeitet: u64,

    noise_floor_db: f32,
    speaking: bool,
    gegenstimmen: u32,
    ausgesetzt: bool,

    fenster_gesendet: u64,
    fenster_verworfen: u64,
}

impl EnergyAnalyzer {
    /// Erstellt einen Analyzer und den zugehoerigen Empfaenger der Fenster
    pub fn neu(config: EnergyConfig) -> (Self, mpsc::Receiver<EnergyWindow>) {
        let (tx, rx) = mpsc::channel(config.kanal_kapazitaet.max(1));
        let rate = config.sample_rate.max(1);
        let analyzer = Self {
            tief: Tiefpass::neu(300.0, rate),
            mitte: Tiefpass::neu(3_000.0, rate),
            noise_floor_db: config.start_schwelle_db - config.schwellen_offset_db,
            config,
            ausgabe: tx,
            summe_quadrate: 0.0,
            anzahl: 0,
            baender: BandLeistung::default(),
            verarbeitet: 0,
            speaking: false,
            gegenstimmen: 0,
            ausgesetzt: false,
            fenster_gesendet: 0,
            fenster_verworfen: 0,
        };
        (analyzer, rx)
    }

    /// Nimmt PCM16-Samples auf; gibt die Anzahl gesendeter Fenster zurueck
    ///
    /// Im ausgesetzten Zustand werden Samples ignoriert.
    pub fn push_pcm16(&mut self, samples: &[i16]) -> usize {
        if self.ausgesetzt {
            return 0;
        }

        let pro_fenster = self.config.samples_pro_fenster();
        let mut gesendet = 0;
        for &s in samples {
            let x = s as f32 / 32_768.0;
            let tief = self.tief.filtern(x);
            let bis_mitte = self.mitte.filtern(x);
            let mitte = bis_mitte - tief;
            let hoch = x - bis_mitte;

            self.summe_quadrate += (x as f64) * (x as f64);
            self.baender.low += (tief as f64) * (tief as f64);
            self.baender.mid += (mitte as f64) * (mitte as f64);
            self.baender.high += (hoch as f64) * (hoch as f64);
            self.anzahl += 1;

            if self.anzahl >= pro_fenster && self.flush_window().is_some() {
                gesendet += 1;
            }
        }
        gesendet
    }

    /// Schliesst das aktuelle (ggf. unvollstaendige) Fenster ab
    ///
    /// Gibt das Fenster zurueck, wenn es auf den Kanal gelegt wurde. Ein
    /// leeres Fenster erzeugt nichts.
    pub fn flush_window(&mut self) -> Option<EnergyWindow> {
        if self.anzahl == 0 {
            return None;
        }

        let fenster = self.fenster_auswerten();
        match self.ausgabe.try_send(fenster.clone()) {
            Ok(()) => {
                self.fenster_gesendet += 1;
                Some(fenster)
            }
            Err(_) => {
                self.fenster_verworfen += 1;
                tracing::trace!("Energie-Fenster verworfen (Kanal voll oder geschlossen)");
                None
            }
        }
    }

    fn fenster_auswerten(&mut self) -> EnergyWindow {
        let n = self.anzahl as f64;
        let rate = self.config.sample_rate.max(1) as u64;
        let start_ms = self.verarbeitet * 1000 / rate;
        self.verarbeitet += self.anzahl as u64;
        let end_ms = self.verarbeitet * 1000 / rate;

        let pegel = leistung_zu_db(self.summe_quadrate / n, self.config.sentinel_db);
        let gated = pegel < self.config.noise_gate_dbfs;
        let energy_db = if gated { self.config.sentinel_db } else { pegel };

        let schwelle = self.schwelle();
        let roh = !gated && energy_db > schwelle;

        if gated {
            self.speaking = false;
            self.gegenstimmen = 0;
        } else if roh != self.speaking {
            self.gegenstimmen += 1;
            if self.gegenstimmen >= self.config.min_hold_windows {
                self.speaking = roh;
                self.gegenstimmen = 0;
                tracing::trace!(speaking = roh, energy_db, "VAD-Zustand gewechselt");
            }
        } else {
            self.gegenstimmen = 0;
        }

        // Rauschboden nur ueber leise, nicht gegatete Fenster nachfuehren
        if !gated && !roh {
            self.noise_floor_db +=
                self.config.noise_floor_alpha * (energy_db - self.noise_floor_db);
        }

        let sentinel = self.config.sentinel_db;
        let bands = if gated {
            BandEnergie {
                low: sentinel,
                mid: sentinel,
                high: sentinel,
            }
        } else {
            BandEnergie {
                low: leistung_zu_db(self.baender.low / n, sentinel),
                mid: leistung_zu_db(self.baender.mid / n, sentinel),
                high: leistung_zu_db(self.baender.high / n, sentinel),
            }
        };

        let snr_db = if gated {
            0.0
        } else {
            energy_db - self.noise_floor_db
        };
        let vad_confidence = if gated {
            0.0
        } else {
            let ueber = ((energy_db - schwelle) / 20.0 + 0.5).clamp(0.0, 1.0);
            let snr = (snr_db / 30.0).clamp(0.0, 1.0);
            let gesamt = self.baender.low + self.baender.mid + self.baender.high;
            let anteil = if gesamt > 0.0 {
                (self.baender.mid / gesamt) as f32
            } else {
                0.0
            };
            (0.4 * ueber + 0.3 * snr + 0.3 * anteil).clamp(0.0, 1.0)
        };

        self.summe_quadrate = 0.0;
        self.anzahl = 0;
        self.baender = BandLeistung::default();

        EnergyWindow {
            start_ms,
            end_ms,
            energy_db,
            speaking: self.speaking,
            noise_floor_db: self.noise_floor_db,
            snr_db,
            bands,
            vad_confidence,
        }
    }

    /// Aktuelle Sprech-Schwelle in dBFS
    pub fn schwelle(&self) -> f32 {
        if self.config.adaptiv {
            (self.noise_floor_db + self.config.schwellen_offset_db)
                .clamp(self.config.schwelle_min_db, self.config.schwelle_max_db)
        } else {
            self.config.start_schwelle_db
        }
    }

    /// Setzt die Analyse aus (Pause); ein angefangenes Fenster wird verworfen
    pub fn aussetzen(&mut self) {
        self.ausgesetzt = true;
        self.summe_quadrate = 0.0;
        self.anzahl = 0;
        self.baender = BandLeistung::default();
    }

    pub fn fortsetzen(&mut self) {
        self.ausgesetzt = false;
    }

    pub fn ist_ausgesetzt(&self) -> bool {
        self.ausgesetzt
    }

    /// Zuletzt festgestellter (hysterese-gefilterter) Sprech-Zustand
    pub fn spricht(&self) -> bool {
        self.speaking
    }

    pub fn noise_floor_db(&self) -> f32 {
        self.noise_floor_db
    }

    /// (gesendet, verworfen)
    pub fn fenster_statistik(&self) -> (u64, u64) {
        (self.fenster_gesendet, self.fenster_verworfen)
    }
}

/// Mittlere Leistung (normalisiert) in dBFS; Null ergibt den Sentinel
fn leistung_zu_db(leistung: f64, sentinel: f32) -> f32 {
    if leistung <= 0.0 {
        return sentinel;
    }
    let db = 10.0 * leistung.log10();
    (db as f32).max(sentinel)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16_000;
    const FENSTER: usize = 4_000;

    fn sinus(amplitude: f32, frequenz: f32, n: usize) -> Vec<i16> {
        (0..n)
            .map(|i| {
                let t = i as f32 / RATE as f32;
                (amplitude * (2.0 * std::f32::consts::PI * frequenz * t).sin()) as i16
            })
            .collect()
    }

    fn analyzer(config: EnergyConfig) -> (EnergyAnalyzer, mpsc::Receiver<EnergyWindow>) {
        EnergyAnalyzer::neu(config)
    }

    #[test]
    fn stille_meldet_sentinel() {
        let (mut a, mut rx) = analyzer(EnergyConfig::default());
        assert_eq!(a.push_pcm16(&vec![0; FENSTER]), 1);
        let w = rx.try_recv().unwrap();
        assert_eq!(w.energy_db, -120.0);
        assert!(!w.speaking);
        assert_eq!(w.bands.low, -120.0);
        assert_eq!(w.vad_confidence, 0.0);
        assert_eq!((w.start_ms, w.end_ms), (0, 250));
    }

    #[test]
    fn gate_erzwingt_nicht_sprechen() {
        let (mut a, mut rx) = analyzer(EnergyConfig {
            min_hold_windows: 1,
            ..Default::default()
        });
        a.push_pcm16(&sinus(8_000.0, 440.0, FENSTER));
        assert!(rx.try_recv().unwrap().speaking);
        // Einzelnes Stille-Fenster: sofort nicht sprechend, ohne Hysterese
        a.push_pcm16(&vec![0; FENSTER]);
        assert!(!rx.try_recv().unwrap().speaking);
    }

    #[test]
    fn hysterese_verhindert_einzelne_wechsel() {
        let (mut a, mut rx) = analyzer(EnergyConfig::default());
        let laut = sinus(8_000.0, 440.0, FENSTER);
        let leise = sinus(30.0, 440.0, FENSTER);

        a.push_pcm16(&leise);
        a.push_pcm16(&laut);
        a.push_pcm16(&leise);
        let w: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(w.iter().all(|w| !w.speaking));

        a.push_pcm16(&laut);
        a.push_pcm16(&laut);
        let zwei: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(!zwei[0].speaking);
        assert!(zwei[1].speaking);
        assert!(a.spricht());
    }

    #[test]
    fn rauschboden_folgt_leisen_fenstern() {
        let (mut a, _rx) = analyzer(EnergyConfig {
            kanal_kapazitaet: 64,
            ..Default::default()
        });
        let start = a.noise_floor_db();
        let rauschen = sinus(100.0, 200.0, FENSTER);
        for _ in 0..40 {
            a.push_pcm16(&rauschen);
        }
        // ~ -53 dBFS Sinus: Boden naehert sich von -55 an
        assert!(a.noise_floor_db() > start);
        let schwelle = a.schwelle();
        assert!((-60.0..=-20.0).contains(&schwelle));
    }

    #[test]
    fn feste_schwelle_ohne_adaption() {
        let (a, _rx) = analyzer(EnergyConfig {
            adaptiv: false,
            start_schwelle_db: -33.0,
            ..Default::default()
        });
        assert_eq!(a.schwelle(), -33.0);
    }

    #[test]
    fn sprache_hat_hohe_konfidenz() {
        let (mut a, mut rx) = analyzer(EnergyConfig::default());
        a.push_pcm16(&sinus(10_000.0, 1_000.0, FENSTER));
        let w = rx.try_recv().unwrap();
        assert!(w.vad_confidence > 0.5, "konfidenz={}", w.vad_confidence);
        assert!(w.bands.mid > w.bands.high);
        assert!(w.snr_db > 0.0);
    }

    #[test]
    fn flush_teilfenster_und_pause() {
        let (mut a, mut rx) = analyzer(EnergyConfig::default());
        a.push_pcm16(&vec![100; 800]);
        let w = a.flush_window().unwrap();
        assert_eq!((w.start_ms, w.end_ms), (0, 50));
        assert!(rx.try_recv().is_ok());
        assert!(a.flush_window().is_none());

        a.aussetzen();
        assert!(a.ist_ausgesetzt());
        assert_eq!(a.push_pcm16(&vec![100; FENSTER]), 0);
        a.fortsetzen();
        assert!(!a.ist_ausgesetzt());
        assert_eq!(a.push_pcm16(&vec![100; FENSTER]), 1);
        assert_eq!(rx.try_recv().unwrap().start_ms, 50);
    }

    #[test]
    fn voller_kanal_blockiert_nicht() {
        let (mut a, _rx) = analyzer(EnergyConfig {
            kanal_kapazitaet: 1,
            ..Default::default()
        });
        assert_eq!(a.push_pcm16(&vec![0; FENSTER * 3]), 1);
        assert_eq!(a.fenster_statistik(), (1, 2));
    }
}
