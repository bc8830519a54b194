//! Lokale Provider ohne externe Dienste
//!
//! Fuer Entwicklung, Lasttests und die Integrationstests. Die Erkennung
//! arbeitet rein energiebasiert und liefert Platzhalter-Transkripte, die
//! Synthese erzeugt einen Sinuston passender Laenge.

use std::f32::consts::PI;
use std::time::Duration;

use async_trait::async_trait;
use callbridge_core::CallId;
use callbridge_protocol::{OrchestrationConfig, RealtimeOptions};
use tokio::sync::mpsc;

use crate::provider::{
    Anfrage, AsrEingabe, AsrErgebnis, AsrStrom, ProviderResult, ReasoningEngine,
    SpeechRecognizer, SpeechSynthesizer,
};
use crate::tools::ToolBroker;

// ---------------------------------------------------------------------------
// Erkennung
// ---------------------------------------------------------------------------

const SPRACH_SCHWELLE_DB: f32 = -45.0;
const TEILERGEBNIS_MS: u64 = 500;
const NACHLAUF_MS: u64 = 600;

fn pegel_db(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return -120.0;
    }
    let summe: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (summe / samples.len() as f64).sqrt() / i16::MAX as f64;
    (20.0 * rms.max(1e-6).log10()) as f32
}

/// Zustand der Platzhalter-Erkennung, zeitlich ueber die Sample-Anzahl gefuehrt
#[derive(Debug)]
struct Erkenner {
    sample_rate: u32,
    /// Sprachdauer der laufenden Aeusserung
    sprache_ms: u64,
    /// Stille seit dem letzten Sprachblock
    stille_ms: u64,
    naechstes_teilergebnis_ms: u64,
    aeusserungen: u32,
}

impl Erkenner {
    fn neu(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            sprache_ms: 0,
            stille_ms: 0,
            naechstes_teilergebnis_ms: TEILERGEBNIS_MS,
            aeusserungen: 0,
        }
    }

    fn audio(&mut self, samples: &[i16]) -> Option<AsrErgebnis> {
        let dauer = samples.len() as u64 * 1000 / self.sample_rate as u64;
        if pegel_db(samples) >= SPRACH_SCHWELLE_DB {
            self.sprache_ms += dauer;
            self.stille_ms = 0;
            if self.sprache_ms >= self.naechstes_teilergebnis_ms {
                self.naechstes_teilergebnis_ms += TEILERGEBNIS_MS;
                return Some(AsrErgebnis::Teilweise(format!(
                    "[speech {:.1}s]",
                    self.sprache_ms as f64 / 1000.0
                )));
            }
            return None;
        }
        if self.sprache_ms == 0 {
            return None;
        }
        self.stille_ms += dauer;
        if self.stille_ms >= NACHLAUF_MS {
            return self.finalisieren();
        }
        None
    }

    fn finalisieren(&mut self) -> Option<AsrErgebnis> {
        if self.sprache_ms == 0 {
            return None;
        }
        self.aeusserungen += 1;
        let text = format!(
            "utterance {} ({:.1} s)",
            self.aeusserungen,
            self.sprache_ms as f64 / 1000.0
        );
        self.sprache_ms = 0;
        self.stille_ms = 0;
        self.naechstes_teilergebnis_ms = TEILERGEBNIS_MS;
        Some(AsrErgebnis::Final(text))
    }
}

/// Energiebasierte Erkennung mit Platzhalter-Transkripten
#[derive(Debug, Clone)]
pub struct EnergieRecognizer {
    kapazitaet: usize,
}

impl EnergieRecognizer {
    pub fn neu(kapazitaet: usize) -> Self {
        Self {
            kapazitaet: kapazitaet.max(1),
        }
    }
}

impl Default for EnergieRecognizer {
    fn default() -> Self {
        Self::neu(64)
    }
}

#[async_trait]
impl SpeechRecognizer for EnergieRecognizer {
    fn name(&self) -> &'static str {
        "energie"
    }

    async fn oeffnen(
        &self,
        call_id: &CallId,
        options: &RealtimeOptions,
        _config: &OrchestrationConfig,
    ) -> ProviderResult<AsrStrom> {
        let (eingabe, mut eingabe_rx) = mpsc::channel(self.kapazitaet);
        let (ergebnis_tx, ergebnisse) = mpsc::channel(16);
        let mut erkenner = Erkenner::neu(options.sample_rate);
        let call_id = call_id.clone();

        tokio::spawn(async move {
            while let Some(eingabe) = eingabe_rx.recv().await {
                let ergebnis = match eingabe {
                    AsrEingabe::Audio(samples) => erkenner.audio(&samples),
                    AsrEingabe::TurnEnde => erkenner.finalisieren(),
                };
                if let Some(ergebnis) = ergebnis {
                    if ergebnis_tx.send(ergebnis).await.is_err() {
                        break;
                    }
                }
            }
            tracing::trace!(call_id = %call_id, "Erkennungsstrom beendet");
        });

        Ok(AsrStrom {
            eingabe,
            ergebnisse,
        })
    }
}

// ---------------------------------------------------------------------------
// Reasoning
// ---------------------------------------------------------------------------

/// Wiederholt die Aeusserung Wort fuer Wort
#[derive(Debug, Clone, Default)]
pub struct EchoReasoner;

#[async_trait]
impl ReasoningEngine for EchoReasoner {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn antworten(
        &self,
        anfrage: Anfrage,
        _werkzeuge: &ToolBroker,
        aus: mpsc::Sender<String>,
    ) -> ProviderResult<()> {
        let antwort = format!("I heard {}. How can I help?", anfrage.text);
        for wort in antwort.split_inclusive(' ') {
            if aus.send(wort.to_string()).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Synthese
// ---------------------------------------------------------------------------

const TON_HZ: f32 = 440.0;
const TON_AMPLITUDE: f32 = 3_000.0;
const MS_PRO_ZEICHEN: u64 = 55;
const BLOCK_MS: u64 = 100;

/// Sinuston, dessen Laenge grob der Sprechdauer des Textes entspricht
#[derive(Debug, Clone, Default)]
pub struct TonSynthesizer;

impl TonSynthesizer {
    pub fn dauer(text: &str) -> Duration {
        let ms = (text.chars().count() as u64 * MS_PRO_ZEICHEN).clamp(200, 6_000);
        Duration::from_millis(ms)
    }
}

#[async_trait]
impl SpeechSynthesizer for TonSynthesizer {
    fn name(&self) -> &'static str {
        "ton"
    }

    async fn synthetisieren(
        &self,
        text: &str,
        _config: &OrchestrationConfig,
        sample_rate: u32,
        aus: mpsc::Sender<Vec<i16>>,
    ) -> ProviderResult<()> {
        let gesamt = (Self::dauer(text).as_millis() as u64 * sample_rate as u64 / 1000) as usize;
        let block = (BLOCK_MS * sample_rate as u64 / 1000).max(1) as usize;
        let schritt = 2.0 * PI * TON_HZ / sample_rate.max(1) as f32;

        let mut n = 0usize;
        while n < gesamt {
            let laenge = block.min(gesamt - n);
            let samples = (n..n + laenge)
                .map(|i| ((i as f32 * schritt).sin() * TON_AMPLITUDE) as i16)
                .collect();
            if aus.send(samples).await.is_err() {
                break;
            }
            n += laenge;
        }
        Ok(())
    }
}
