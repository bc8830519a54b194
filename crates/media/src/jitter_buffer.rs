//! Adaptiver Jitter Buffer fuer Audio-Frames einer Session
//!
//! Ordnet eingehende Frames nach Sequenznummer, gibt sie im Wiedergabetakt
//! in aufsteigender Reihenfolge heraus und verdeckt endgueltig fehlende
//! Frames ueber den [`PacketLossConcealer`].
//!
//! ## Sequenzraum
//! Sequenznummern sind 16 Bit und laufen ueber. Intern wird jede Nummer
//! relativ zum Wiedergabe-Cursor in einen erweiterten 64-Bit-Raum
//! abgebildet (naechster Abstand, ±2^15). Der Cursor ist in diesem Raum
//! monoton nicht fallend, sobald die Wiedergabe begonnen hat.
//!
//! ## Zielverzoegerung
//! Der Inter-Arrival-Jitter wird wie in RFC 3550 geglaettet
//! (`J += (|D| - J) / 16`). Daraus folgt die gewuenschte Verzoegerung
//! `frame_ms + 4·J`; die Zielverzoegerung steigt schnell dorthin und faellt
//! langsam zurueck, immer begrenzt auf `[min_delay_ms, max_delay_ms]`.
//!
//! Keine Locks: der Buffer gehoert exklusiv einem Session-Task.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Deserialize;

use crate::frame::AudioFrame;
use crate::plc::PacketLossConcealer;

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Konfiguration fuer den Jitter Buffer
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JitterBufferConfig {
    /// Nominale Frame-Dauer in ms
    pub frame_ms: u32,
    /// Untere Grenze der Zielverzoegerung
    pub min_delay_ms: u32,
    /// Obere Grenze der Zielverzoegerung
    pub max_delay_ms: u32,
    /// Startwert der Zielverzoegerung
    pub start_delay_ms: u32,
    /// Wie weit hinter dem Cursor ein Frame vor Wiedergabebeginn noch
    /// einsortiert wird (in Frames); danach gilt er als verspaetet
    pub reorder_fenster: u16,
    /// Maximale Anzahl gepufferter Frames
    pub max_frames: usize,
    /// Sprung nach vorne (in Frames), ab dem der Buffer neu synchronisiert
    pub resync_schwelle: u16,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            frame_ms: 20,
            min_delay_ms: 20,
            max_delay_ms: 200,
            start_delay_ms: 60,
            reorder_fenster: 32,
            max_frames: 100,
            resync_schwelle: 1_000,
        }
    }
}

impl JitterBufferConfig {
    /// Prueft die Konfiguration auf Widersprueche
    pub fn validieren(&self) -> Result<(), String> {
        if self.frame_ms == 0 {
            return Err("frame_ms muss > 0 sein".into());
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(format!(
                "min_delay_ms ({}) > max_delay_ms ({})",
                self.min_delay_ms, self.max_delay_ms
            ));
        }
        if self.max_frames == 0 {
            return Err("max_frames muss > 0 sein".into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Statistiken
// ---------------------------------------------------------------------------

/// Statistiken des Jitter Buffers (Snapshot)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JitterBufferStatistik {
    pub packets_received: u64,
    pub packets_played: u64,
    pub packets_late: u64,
    pub packets_concealed: u64,
    pub packets_duplicate: u64,
    /// Wegen Ueberlauf verworfene Frames
    pub packets_overflow: u64,
    pub resyncs: u64,
    pub current_buffer_size: usize,
    pub jitter_ms: f64,
    pub average_latency_ms: f64,
    pub target_delay_ms: f64,
}

// ---------------------------------------------------------------------------
// BufferSlot
// ---------------------------------------------------------------------------

/// Sicht des Buffers auf einen Frame
#[derive(Debug, Clone)]
pub struct BufferSlot {
    pub frame: AudioFrame,
    /// Ankunftszeit (bei verdeckten Frames: Zeitpunkt der Synthese)
    pub ankunft: Instant,
    pub concealed: bool,
}

// ---------------------------------------------------------------------------
// JitterBuffer
// ---------------------------------------------------------------------------

/// Glaettungsfaktor fuer die Latenz-Mittelung
const LATENZ_ALPHA: f64 = 0.05;
/// Abklingrate der Zielverzoegerung pro Frame
const ZIEL_ABKLINGEN: f64 = 0.02;

/// Adaptiver Jitter Buffer (pro Session, nicht thread-safe)
pub struct JitterBuffer {
    config: JitterBufferConfig,
    /// Gepufferte Frames im erweiterten Sequenzraum
    slots: BTreeMap<u64, BufferSlot>,
    /// Naechste abzuspielende Sequenz (erweitert); None bis zum ersten Frame
    cursor: Option<u64>,
    /// Wiedergabe hat begonnen (ab hier keine Cursor-Korrektur nach hinten)
    gestartet: bool,
    /// Zuletzt gespielter Frame als Vorlage fuer verdeckte Frames
    letzter_frame: Option<AudioFrame>,
    /// Ankunft und Zeitstempel des zuletzt empfangenen Frames (Jitter)
    letzte_ankunft: Option<(Instant, u32, u32)>,
    jitter_ms: f64,
    ziel_ms: f64,
    plc: PacketLossConcealer,
    statistik: JitterBufferStatistik,
}

impl JitterBuffer {
    pub fn neu(config: JitterBufferConfig) -> Self {
        let ziel_ms = (config.start_delay_ms as f64)
            .clamp(config.min_delay_ms as f64, config.max_delay_ms as f64);
        Self {
            config,
            slots: BTreeMap::new(),
            cursor: None,
            gestartet: false,
            letzter_frame: None,
            letzte_ankunft: None,
            jitter_ms: 0.0,
            ziel_ms,
            plc: PacketLossConcealer::neu(),
            statistik: JitterBufferStatistik::default(),
        }
    }

    pub fn standard() -> Self {
        Self::neu(JitterBufferConfig::default())
    }

    /// Bildet eine 16-Bit-Sequenz relativ zum Cursor in den erweiterten Raum ab
    fn erweitern(basis: u64, seq: u16) -> u64 {
        let diff = seq.wrapping_sub(basis as u16) as i16 as i64;
        (basis as i64).wrapping_add(diff) as u64
    }

    /// Fuegt einen Frame ein
    ///
    /// Verspaetete Frames (hinter dem Cursor) und Duplikate werden verworfen
    /// und gezaehlt; es gibt keine Fehlerrueckgabe.
    pub fn push(&mut self, frame: AudioFrame, ankunft: Instant) {
        self.statistik.packets_received += 1;
        self.jitter_messen(&frame, ankunft);

        let seq = frame.seq;
        let cursor = match self.cursor {
            Some(c) => c,
            None => {
                // Erster Frame: Basis so weit oben, dass der Raum nie negativ wird
                let basis = (1u64 << 32) + seq as u64;
                self.cursor = Some(basis);
                basis
            }
        };
        let ext = Self::erweitern(cursor, seq);

        if ext < cursor {
            let rueckstand = cursor - ext;
            if !self.gestartet && rueckstand <= self.config.reorder_fenster as u64 {
                // Vor Wiedergabebeginn: Cursor auf den aeltesten Frame ziehen
                self.cursor = Some(ext);
            } else {
                self.statistik.packets_late += 1;
                tracing::trace!(seq, rueckstand, "Verspaeteter Frame verworfen");
                return;
            }
        } else if ext - cursor > self.config.resync_schwelle as u64 {
            // Sender hat neu begonnen oder weit uebersprungen
            tracing::debug!(seq, sprung = ext - cursor, "Jitter Buffer resynchronisiert");
            self.slots.clear();
            self.cursor = Some(ext);
            self.gestartet = false;
            self.statistik.resyncs += 1;
        }

        if self.slots.contains_key(&ext) {
            self.statistik.packets_duplicate += 1;
            return;
        }

        self.slots.insert(
            ext,
            BufferSlot {
                frame,
                ankunft,
                concealed: false,
            },
        );

        // Ueberlauf: aeltesten Frame verwerfen und Cursor dahinter setzen
        if self.slots.len() > self.config.max_frames {
            if let Some((aeltester, _)) = self.slots.pop_first() {
                self.statistik.packets_overflow += 1;
                if self.cursor.map(|c| c <= aeltester).unwrap_or(false) {
                    self.cursor = Some(aeltester + 1);
                }
                tracing::warn!(seq = aeltester as u16, "Buffer-Ueberlauf: Frame verworfen");
            }
        }

        self.statistik.current_buffer_size = self.slots.len();
    }

    /// Gibt den naechsten Frame fuer die Wiedergabe zurueck
    ///
    /// `None`, solange die Zielverzoegerung noch nicht erreicht ist oder
    /// kein Frame faellig ist.
    pub fn pop(&mut self, jetzt: Instant) -> Option<BufferSlot> {
        let cursor = self.cursor?;
        let (&erster, erster_slot) = self.slots.iter().next()?;

        if !self.gestartet {
            let gepuffert_ms = self.slots.len() as f64 * self.config.frame_ms as f64;
            let gewartet_ms = Self::ms_seit(erster_slot.ankunft, jetzt);
            if gepuffert_ms < self.ziel_ms && gewartet_ms < self.ziel_ms {
                return None;
            }
            self.gestartet = true;
        }

        if erster == cursor {
            let slot = self.slots.pop_first().map(|(_, slot)| slot)?;
            self.cursor = Some(cursor + 1);
            self.statistik.packets_played += 1;
            let latenz = Self::ms_seit(slot.ankunft, jetzt);
            self.statistik.average_latency_ms = if self.statistik.packets_played == 1 {
                latenz
            } else {
                self.statistik.average_latency_ms
                    + LATENZ_ALPHA * (latenz - self.statistik.average_latency_ms)
            };
            self.plc.original(&slot.frame.samples);
            self.letzter_frame = Some(slot.frame.clone());
            self.statistik.current_buffer_size = self.slots.len();
            return Some(slot);
        }

        // Luecke am Cursor: erst verdecken, wenn der naechste vorhandene Frame
        // bereits laenger als die Zielverzoegerung wartet
        if Self::ms_seit(erster_slot.ankunft, jetzt) < self.ziel_ms {
            return None;
        }

        let vorlage = self
            .letzter_frame
            .clone()
            .unwrap_or_else(|| erster_slot.frame.clone());
        let samples = self.plc.verdecken(vorlage.samples.len()).into_samples();
        let samples_pro_frame = vorlage.samples.len() as u32;
        let frame = AudioFrame::aus_pcm(
            cursor as u16,
            vorlage.timestamp.wrapping_add(samples_pro_frame),
            vorlage.codec,
            vorlage.sample_rate,
            samples,
        );

        self.cursor = Some(cursor + 1);
        self.statistik.packets_concealed += 1;
        self.letzter_frame = Some(frame.clone());
        tracing::trace!(seq = cursor as u16, "Frame verdeckt");

        Some(BufferSlot {
            frame,
            ankunft: jetzt,
            concealed: true,
        })
    }

    /// Aktualisiert Jitter-Schaetzung und Zielverzoegerung
    fn jitter_messen(&mut self, frame: &AudioFrame, ankunft: Instant) {
        if let Some((vorher, ts_vorher, rate)) = self.letzte_ankunft {
            if rate > 0 && rate == frame.sample_rate {
                let ankunft_ms = ankunft.saturating_duration_since(vorher).as_secs_f64() * 1000.0
                    - vorher.saturating_duration_since(ankunft).as_secs_f64() * 1000.0;
                let ts_diff = frame.timestamp.wrapping_sub(ts_vorher) as i32 as f64;
                let sende_ms = ts_diff * 1000.0 / rate as f64;
                let d = (ankunft_ms - sende_ms).abs();
                self.jitter_ms += (d - self.jitter_ms) / 16.0;
            }
        }
        self.letzte_ankunft = Some((ankunft, frame.timestamp, frame.sample_rate));

        let min = self.config.min_delay_ms as f64;
        let max = self.config.max_delay_ms as f64;
        let gewuenscht = (self.config.frame_ms as f64 + 4.0 * self.jitter_ms).clamp(min, max);
        if gewuenscht > self.ziel_ms {
            self.ziel_ms = gewuenscht;
        } else {
            self.ziel_ms -= (self.ziel_ms - gewuenscht) * ZIEL_ABKLINGEN;
        }
        self.ziel_ms = self.ziel_ms.clamp(min, max);
    }

    fn ms_seit(seit: Instant, jetzt: Instant) -> f64 {
        jetzt.saturating_duration_since(seit).as_secs_f64() * 1000.0
    }

    /// Snapshot der Statistiken
    pub fn statistik(&self) -> JitterBufferStatistik {
        let mut s = self.statistik.clone();
        s.current_buffer_size = self.slots.len();
        s.jitter_ms = self.jitter_ms;
        s.target_delay_ms = self.ziel_ms;
        s
    }

    /// Aktuelle Zielverzoegerung in ms
    pub fn ziel_delay_ms(&self) -> f64 {
        self.ziel_ms
    }

    pub fn fuellstand(&self) -> usize {
        self.slots.len()
    }

    /// Setzt Buffer und Statistiken zurueck (Konfiguration bleibt)
    pub fn reset(&mut self) {
        *self = Self::neu(self.config.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callbridge_protocol::Codec;
    use std::time::Duration;

    fn frame(seq: u16, amplitude: i16) -> AudioFrame {
        AudioFrame::aus_pcm(
            seq,
            seq as u32 * 160,
            Codec::Linear16,
            8_000,
            vec![amplitude; 160],
        )
    }

    fn ms(t0: Instant, ms: u64) -> Instant {
        t0 + Duration::from_millis(ms)
    }

    #[test]
    fn reihenfolge_bei_beliebiger_ankunft() {
        let mut jb = JitterBuffer::standard();
        let t0 = Instant::now();
        let reihenfolge = [5u16, 1, 3, 2, 8, 4, 7, 6, 10, 9, 12, 11];
        for (i, &seq) in reihenfolge.iter().enumerate() {
            jb.push(frame(seq, 100), ms(t0, i as u64 * 20));
        }

        let spaeter = ms(t0, 2_000);
        let gespielt: Vec<u16> = (0..reihenfolge.len())
            .filter_map(|_| jb.pop(spaeter))
            .map(|slot| {
                assert!(!slot.concealed);
                slot.frame.seq
            })
            .collect();
        assert_eq!(gespielt, (1..=12).collect::<Vec<_>>());
        assert_eq!(jb.statistik().packets_played, 12);
    }

    #[test]
    fn verdeckung_bei_luecke() {
        let mut jb = JitterBuffer::standard();
        let t0 = Instant::now();
        jb.push(frame(1, 1000), t0);
        jb.push(frame(3, 1000), ms(t0, 40));

        let jetzt = ms(t0, 500);
        let erster = jb.pop(jetzt).unwrap();
        assert_eq!(erster.frame.seq, 1);
        assert!(!erster.concealed);

        let verdeckt = jb.pop(jetzt).unwrap();
        assert!(verdeckt.concealed);
        assert_eq!(verdeckt.frame.seq, 2);
        assert_eq!(verdeckt.frame.samples.len(), erster.frame.samples.len());
        assert!(verdeckt.frame.samples[0].abs() < erster.frame.samples[0].abs());

        let dritter = jb.pop(jetzt).unwrap();
        assert_eq!(dritter.frame.seq, 3);
        assert!(!dritter.concealed);

        let s = jb.statistik();
        assert_eq!(s.packets_concealed, 1);
        assert_eq!(s.packets_played, 2);
    }

    #[test]
    fn keine_verdeckung_vor_zielverzoegerung() {
        let mut jb = JitterBuffer::standard();
        let t0 = Instant::now();
        jb.push(frame(1, 1000), t0);
        jb.push(frame(3, 1000), ms(t0, 40));

        assert_eq!(jb.pop(ms(t0, 200)).map(|s| s.frame.seq), Some(1));
        // Frame 3 wartet erst 10 ms – Frame 2 koennte noch kommen
        assert!(jb.pop(ms(t0, 50)).is_none());
        jb.push(frame(2, 1000), ms(t0, 55));
        assert_eq!(jb.pop(ms(t0, 60)).map(|s| s.frame.seq), Some(2));
    }

    #[test]
    fn wartet_auf_zielfuellstand() {
        let mut jb = JitterBuffer::standard();
        let t0 = Instant::now();
        jb.push(frame(1, 1), t0);
        assert!(jb.pop(ms(t0, 10)).is_none());
        assert!(jb.pop(ms(t0, 100)).is_some());
        assert!(jb.pop(ms(t0, 100)).is_none());
    }

    #[test]
    fn verspaeteter_frame_verworfen() {
        let mut jb = JitterBuffer::standard();
        let t0 = Instant::now();
        for seq in 995..=1001u16 {
            jb.push(frame(seq, 10), t0);
        }
        let jetzt = ms(t0, 1_000);
        while jb.pop(jetzt).is_some() {}

        jb.push(frame(1, 10), jetzt);
        jb.push(frame(1000, 10), jetzt);
        let s = jb.statistik();
        assert_eq!(s.packets_late, 2);
        assert_eq!(s.current_buffer_size, 0);
        assert!(jb.pop(ms(t0, 5_000)).is_none());
    }

    #[test]
    fn duplikate_verworfen() {
        let mut jb = JitterBuffer::standard();
        let t0 = Instant::now();
        jb.push(frame(7, 1), t0);
        jb.push(frame(7, 1), t0);
        assert_eq!(jb.statistik().packets_duplicate, 1);
        assert_eq!(jb.fuellstand(), 1);
    }

    #[test]
    fn sequenz_wrap_around() {
        let mut jb = JitterBuffer::standard();
        let t0 = Instant::now();
        for seq in [65534u16, 0, 65535, 1] {
            jb.push(frame(seq, 5), t0);
        }
        let jetzt = ms(t0, 1_000);
        let gespielt: Vec<u16> = std::iter::from_fn(|| jb.pop(jetzt))
            .map(|s| s.frame.seq)
            .collect();
        assert_eq!(gespielt, vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn ueberlauf_verwirft_aeltesten() {
        let mut jb = JitterBuffer::neu(JitterBufferConfig {
            max_frames: 3,
            ..Default::default()
        });
        let t0 = Instant::now();
        for seq in 1..=5u16 {
            jb.push(frame(seq, 1), t0);
        }
        assert_eq!(jb.fuellstand(), 3);
        assert_eq!(jb.statistik().packets_overflow, 2);
        assert_eq!(jb.pop(ms(t0, 500)).map(|s| s.frame.seq), Some(3));
    }

    #[test]
    fn resync_bei_grossem_sprung() {
        let mut jb = JitterBuffer::standard();
        let t0 = Instant::now();
        jb.push(frame(10, 1), t0);
        jb.push(frame(20_000, 1), t0);
        assert_eq!(jb.statistik().resyncs, 1);
        assert_eq!(jb.pop(ms(t0, 500)).map(|s| s.frame.seq), Some(20_000));
    }

    #[test]
    fn zielverzoegerung_folgt_jitter() {
        let mut jb = JitterBuffer::standard();
        let t0 = Instant::now();
        let start = jb.ziel_delay_ms();

        // Stark schwankende Ankunft: abwechselnd 0 und 80 ms Abstand
        let mut t = 0u64;
        for seq in 0..60u16 {
            t += if seq % 2 == 0 { 0 } else { 80 };
            jb.push(frame(seq, 1), ms(t0, t));
        }
        let hoch = jb.ziel_delay_ms();
        assert!(hoch > start, "ziel={hoch}");
        assert!(hoch <= 200.0);

        // Danach stabiler 20-ms-Takt: Ziel sinkt langsam, nie unter min
        for seq in 60..600u16 {
            t += 20;
            jb.push(frame(seq, 1), ms(t0, t));
            while jb.pop(ms(t0, t)).is_some() {}
        }
        let tief = jb.ziel_delay_ms();
        assert!(tief < hoch);
        assert!(tief >= 20.0);
    }

    #[test]
    fn reset_leert_alles() {
        let mut jb = JitterBuffer::standard();
        jb.push(frame(1, 1), Instant::now());
        jb.reset();
        assert_eq!(
            jb.statistik(),
            JitterBufferStatistik {
                target_delay_ms: 60.0,
                ..Default::default()
            }
        );
    }
}
