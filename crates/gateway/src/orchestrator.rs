//! Orchestrierung: ASR → Reasoning → TTS pro Session
//!
//! Laeuft als eigener Task neben dem Session-Task. Der Audio-Pfad reicht
//! Samples nur per `try_send` weiter und blockiert nie auf einem Provider.
//!
//! Pro finalem Transkript startet ein Turn-Task:
//! 1. Reasoning streamt Text-Deltas (`llm.delta`)
//! 2. Abgeschlossene Saetze gehen sofort an die Synthese
//! 3. Synthetisiertes Audio geht als `tts.chunk` an die Session
//!
//! Jeder Turn haengt an einem eigenen [`CancellationToken`]. Barge-in und
//! Session-Ende brechen ueber denselben Pfad ab; laufende Provider-Aufrufe
//! werden dabei verworfen.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use callbridge_core::timeline::art;
use callbridge_core::{CallId, TimelineStore};
use callbridge_protocol::{ErrorCode, OrchestrationConfig, OutboundMessage, RealtimeOptions};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::provider::{
    Anfrage, AsrEingabe, AsrErgebnis, AsrStrom, Beitrag, ProviderError, ProviderResult,
    ProviderSet, Rolle,
};
use crate::stats::GatewayStatistik;
use crate::tools::ToolBroker;

const BACKOFF_BASIS: Duration = Duration::from_millis(200);
const BACKOFF_MAX: Duration = Duration::from_secs(2);
/// Maximale Anzahl Beitraege, die an die Reasoning-Engine gehen
const MAX_VERLAUF: usize = 20;

fn backoff(versuch: u32) -> Duration {
    BACKOFF_BASIS
        .saturating_mul(1u32 << versuch.min(4))
        .min(BACKOFF_MAX)
}

/// Trennt abgeschlossene Saetze vom Anfang des Puffers ab
///
/// Ein Satz endet an `.`, `!` oder `?` gefolgt von Leerraum, oder an einem
/// Zeilenumbruch. Der unvollstaendige Rest bleibt im Puffer.
pub fn saetze_abtrennen(puffer: &mut String) -> Vec<String> {
    let bytes = puffer.as_bytes();
    let mut saetze = Vec::new();
    let mut start = 0;
    for i in 0..bytes.len() {
        let ende = match bytes[i] {
            b'\n' => true,
            b'.' | b'!' | b'?' => bytes.get(i + 1).is_some_and(|b| b.is_ascii_whitespace()),
            _ => false,
        };
        if ende {
            let satz = puffer[start..=i].trim();
            if !satz.is_empty() {
                saetze.push(satz.to_string());
            }
            start = i + 1;
        }
    }
    puffer.drain(..start);
    saetze
}

// ---------------------------------------------------------------------------
// Kontext und Handle
// ---------------------------------------------------------------------------

/// Alles, was der Orchestrator von der Session bekommt
pub struct OrchestratorKontext {
    pub call_id: CallId,
    pub options: RealtimeOptions,
    pub config: OrchestrationConfig,
    pub provider: ProviderSet,
    pub ausgang: mpsc::Sender<OutboundMessage>,
    pub timeline: TimelineStore,
    pub statistik: Arc<GatewayStatistik>,
}

enum Befehl {
    /// Sprache erkannt (Energie-Analyzer); moeglicher Barge-in
    Sprache,
    Konfiguration(OrchestrationConfig),
}

/// Steuerung des Orchestrator-Tasks aus der Session heraus
pub struct OrchestratorHandle {
    befehle: mpsc::Sender<Befehl>,
    asr: mpsc::Sender<AsrEingabe>,
    werkzeuge: Arc<ToolBroker>,
    abbruch: CancellationToken,
    task: JoinHandle<()>,
}

impl OrchestratorHandle {
    /// Startet den Orchestrator auf einem bereits geoeffneten ASR-Strom
    pub fn starten(kontext: OrchestratorKontext, strom: AsrStrom) -> Self {
        let (befehle, befehl_rx) = mpsc::channel(32);
        let abbruch = CancellationToken::new();
        let werkzeuge = Arc::new(ToolBroker::neu(
            kontext.call_id.clone(),
            kontext.ausgang.clone(),
            kontext.timeline.clone(),
            Duration::from_millis(kontext.config.tool_timeout_ms),
        ));

        let orchestrator = Orchestrator {
            kontext,
            werkzeuge: Arc::clone(&werkzeuge),
            turn: 0,
            laufend: None,
            wiedergabe_bis: Arc::new(Mutex::new(None)),
            verlauf: Arc::new(Mutex::new(Vec::new())),
            abbruch: abbruch.clone(),
        };
        let task = tokio::spawn(orchestrator.ausfuehren(befehl_rx, strom.ergebnisse));

        Self {
            befehle,
            asr: strom.eingabe,
            werkzeuge,
            abbruch,
            task,
        }
    }

    /// Reicht Audio an die Erkennung weiter; `false` wenn verworfen
    pub fn audio(&self, samples: Vec<i16>) -> bool {
        self.asr.try_send(AsrEingabe::Audio(samples)).is_ok()
    }

    /// Heuristisches Turn-Ende aus dem Stille-Timer
    pub fn turn_ende(&self) {
        if self.asr.try_send(AsrEingabe::TurnEnde).is_err() {
            tracing::debug!("ASR-Eingabe voll, Turn-Ende verworfen");
        }
    }

    pub fn sprache_erkannt(&self) {
        let _ = self.befehle.try_send(Befehl::Sprache);
    }

    pub fn konfigurieren(&self, config: OrchestrationConfig) {
        self.werkzeuge
            .timeout_setzen(Duration::from_millis(config.tool_timeout_ms));
        if self.befehle.try_send(Befehl::Konfiguration(config)).is_err() {
            tracing::warn!("Orchestrator-Befehlsqueue voll, Konfiguration verworfen");
        }
    }

    pub fn tool_ergebnis(&self, id: &str, result: Value) -> bool {
        self.werkzeuge.ergebnis(id, result)
    }

    /// Bricht laufende Turns ab und wartet kurz auf das Task-Ende
    pub async fn beenden(self) {
        self.abbruch.cancel();
        self.werkzeuge.abbrechen();
        if tokio::time::timeout(Duration::from_secs(1), self.task)
            .await
            .is_err()
        {
            tracing::warn!("Orchestrator-Task reagiert nicht auf Abbruch");
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator-Task
// ---------------------------------------------------------------------------

struct LaufenderTurn {
    turn: u64,
    abbruch: CancellationToken,
    task: JoinHandle<()>,
}

struct Orchestrator {
    kontext: OrchestratorKontext,
    werkzeuge: Arc<ToolBroker>,
    turn: u64,
    laufend: Option<LaufenderTurn>,
    /// Ende der bereits gesendeten Wiedergabe beim Client
    wiedergabe_bis: Arc<Mutex<Option<Instant>>>,
    verlauf: Arc<Mutex<Vec<Beitrag>>>,
    abbruch: CancellationToken,
}

impl Orchestrator {
    async fn ausfuehren(
        mut self,
        mut befehle: mpsc::Receiver<Befehl>,
        mut ergebnisse: mpsc::Receiver<AsrErgebnis>,
    ) {
        let abbruch = self.abbruch.clone();
        let mut asr_offen = true;

        loop {
            tokio::select! {
                _ = abbruch.cancelled() => break,

                befehl = befehle.recv() => match befehl {
                    Some(Befehl::Sprache) => self.barge_in_pruefen("energie").await,
                    Some(Befehl::Konfiguration(config)) => self.kontext.config = config,
                    None => break,
                },

                ergebnis = ergebnisse.recv(), if asr_offen => match ergebnis {
                    Some(AsrErgebnis::Teilweise(text)) => {
                        self.barge_in_pruefen("asr").await;
                        self.senden(OutboundMessage::SttPartial { turn: self.turn + 1, text }).await;
                    }
                    Some(AsrErgebnis::Final(text)) => self.final_verarbeiten(text).await,
                    None => {
                        tracing::warn!(call_id = %self.kontext.call_id, "ASR-Strom beendet");
                        asr_offen = false;
                    }
                },
            }
        }

        self.turn_abbrechen();
        tracing::debug!(call_id = %self.kontext.call_id, turns = self.turn, "Orchestrator beendet");
    }

    async fn senden(&self, nachricht: OutboundMessage) {
        if self.kontext.ausgang.send(nachricht).await.is_err() {
            tracing::debug!(call_id = %self.kontext.call_id, "Session-Ausgang geschlossen");
        }
    }

    fn spielt(&self) -> bool {
        let turn_laeuft = self
            .laufend
            .as_ref()
            .is_some_and(|l| !l.task.is_finished());
        let wiedergabe = self
            .wiedergabe_bis
            .lock()
            .is_some_and(|bis| bis > Instant::now());
        turn_laeuft || wiedergabe
    }

    fn turn_abbrechen(&mut self) {
        if let Some(laufend) = self.laufend.take() {
            laufend.abbruch.cancel();
        }
        *self.wiedergabe_bis.lock() = None;
    }

    /// Neue Sprache waehrend einer Antwort bricht Synthese und Wiedergabe ab
    async fn barge_in_pruefen(&mut self, quelle: &'static str) {
        if !self.kontext.config.barge_in || !self.spielt() {
            return;
        }
        let turn = self.laufend.as_ref().map(|l| l.turn).unwrap_or(self.turn);
        self.turn_abbrechen();
        self.werkzeuge.abbrechen();

        GatewayStatistik::erhoehen(&self.kontext.statistik.barge_ins);
        tracing::info!(call_id = %self.kontext.call_id, turn, quelle, "Barge-in");
        self.kontext.timeline.anhaengen(
            &self.kontext.call_id,
            art::BARGE_IN,
            json!({ "turn": turn, "source": quelle }),
        );
        self.senden(OutboundMessage::ControlBargein { turn }).await;
    }

    async fn final_verarbeiten(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }

        self.barge_in_pruefen("asr").await;
        // Die neue Aeusserung ersetzt eine noch laufende Antwort
        self.turn_abbrechen();

        self.turn += 1;
        let turn = self.turn;
        GatewayStatistik::erhoehen(&self.kontext.statistik.turns);
        self.kontext.timeline.anhaengen(
            &self.kontext.call_id,
            art::STT_FINAL,
            json!({ "turn": turn, "text": text }),
        );
        self.senden(OutboundMessage::SttFinal {
            turn,
            text: text.clone(),
        })
        .await;

        let verlauf = {
            let mut verlauf = self.verlauf.lock();
            verlauf.push(Beitrag {
                rolle: Rolle::Anrufer,
                text: text.clone(),
            });
            let start = verlauf.len().saturating_sub(MAX_VERLAUF);
            verlauf[start..].to_vec()
        };

        let anfrage = Anfrage {
            call_id: self.kontext.call_id.clone(),
            turn,
            text,
            verlauf,
            system_prompt: self.kontext.config.system_prompt.clone(),
            language: self.kontext.config.language.clone(),
        };
        let turn_kontext = TurnKontext {
            call_id: self.kontext.call_id.clone(),
            turn,
            config: self.kontext.config.clone(),
            options: self.kontext.options.clone(),
            provider: self.kontext.provider.clone(),
            ausgang: self.kontext.ausgang.clone(),
            timeline: self.kontext.timeline.clone(),
            statistik: Arc::clone(&self.kontext.statistik),
            werkzeuge: Arc::clone(&self.werkzeuge),
            wiedergabe_bis: Arc::clone(&self.wiedergabe_bis),
            verlauf: Arc::clone(&self.verlauf),
            chunk_seq: AtomicU32::new(0),
        };

        let abbruch = self.abbruch.child_token();
        let turn_abbruch = abbruch.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = turn_abbruch.cancelled() => {
                    tracing::debug!(call_id = %turn_kontext.call_id, turn, "Turn abgebrochen");
                }
                _ = turn_kontext.ausfuehren(anfrage) => {}
            }
        });
        self.laufend = Some(LaufenderTurn {
            turn,
            abbruch,
            task,
        });
    }
}

// ---------------------------------------------------------------------------
// Turn
// ---------------------------------------------------------------------------

struct TurnKontext {
    call_id: CallId,
    turn: u64,
    config: OrchestrationConfig,
    options: RealtimeOptions,
    provider: ProviderSet,
    ausgang: mpsc::Sender<OutboundMessage>,
    timeline: TimelineStore,
    statistik: Arc<GatewayStatistik>,
    werkzeuge: Arc<ToolBroker>,
    wiedergabe_bis: Arc<Mutex<Option<Instant>>>,
    verlauf: Arc<Mutex<Vec<Beitrag>>>,
    chunk_seq: AtomicU32,
}

impl TurnKontext {
    async fn ausfuehren(&self, anfrage: Anfrage) {
        match self.antworten(anfrage).await {
            Ok(antwort) => {
                self.timeline.anhaengen(
                    &self.call_id,
                    art::LLM_REPLY,
                    json!({ "turn": self.turn, "text": antwort }),
                );
                self.verlauf.lock().push(Beitrag {
                    rolle: Rolle::Agent,
                    text: antwort,
                });
            }
            Err(e) => {
                self.fallback_melden(&e);
                self.sprechen(&self.config.fallback_text).await;
            }
        }
    }

    /// Reasoning mit lokalen Wiederholungen, solange noch nichts ausgegeben wurde
    async fn antworten(&self, anfrage: Anfrage) -> ProviderResult<String> {
        let timeout = Duration::from_millis(self.config.llm_timeout_ms);
        let mut versuch = 0;
        loop {
            let (tx, rx) = mpsc::channel(64);
            let mut antwort = String::new();
            let mut satz_puffer = String::new();

            let aufruf = async {
                match tokio::time::timeout(
                    timeout,
                    self.provider
                        .llm
                        .antworten(anfrage.clone(), &self.werkzeuge, tx),
                )
                .await
                {
                    Ok(ergebnis) => ergebnis,
                    Err(_) => Err(ProviderError::Zeitlimit {
                        provider: "llm",
                        ms: self.config.llm_timeout_ms,
                    }),
                }
            };
            let (ergebnis, ausgegeben) = tokio::join!(
                aufruf,
                self.deltas_verarbeiten(rx, &mut antwort, &mut satz_puffer)
            );

            match ergebnis {
                Ok(()) => {
                    self.sprechen(satz_puffer.trim()).await;
                    return Ok(antwort);
                }
                Err(e) if !ausgegeben && e.ist_wiederholbar() && versuch < self.config.provider_retries => {
                    tracing::warn!(call_id = %self.call_id, turn = self.turn, versuch, fehler = %e, "Reasoning fehlgeschlagen, neuer Versuch");
                    tokio::time::sleep(backoff(versuch)).await;
                    versuch += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Leitet Deltas weiter und spricht abgeschlossene Saetze sofort
    async fn deltas_verarbeiten(
        &self,
        mut rx: mpsc::Receiver<String>,
        antwort: &mut String,
        satz_puffer: &mut String,
    ) -> bool {
        let mut ausgegeben = false;
        while let Some(delta) = rx.recv().await {
            if delta.is_empty() {
                continue;
            }
            ausgegeben = true;
            antwort.push_str(&delta);
            satz_puffer.push_str(&delta);
            self.senden(OutboundMessage::LlmDelta {
                turn: self.turn,
                text: delta,
            })
            .await;
            for satz in saetze_abtrennen(satz_puffer) {
                self.sprechen(&satz).await;
            }
        }
        ausgegeben
    }

    async fn sprechen(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        if let Err(e) = self.synthetisieren(text).await {
            self.fallback_melden(&e);
            self.senden(OutboundMessage::fehler(
                ErrorCode::ProviderFailure,
                "Speech synthesis unavailable",
            ))
            .await;
        }
    }

    async fn synthetisieren(&self, text: &str) -> ProviderResult<()> {
        let timeout = Duration::from_millis(self.config.tts_timeout_ms);
        let mut versuch = 0;
        loop {
            let (tx, rx) = mpsc::channel(32);
            let aufruf = async {
                match tokio::time::timeout(
                    timeout,
                    self.provider.tts.synthetisieren(
                        text,
                        &self.config,
                        self.options.sample_rate,
                        tx,
                    ),
                )
                .await
                {
                    Ok(ergebnis) => ergebnis,
                    Err(_) => Err(ProviderError::Zeitlimit {
                        provider: "tts",
                        ms: self.config.tts_timeout_ms,
                    }),
                }
            };
            let (ergebnis, gesendet) = tokio::join!(aufruf, self.audio_weiterleiten(rx));

            match ergebnis {
                Ok(()) => return Ok(()),
                Err(e) if !gesendet && e.ist_wiederholbar() && versuch < self.config.provider_retries => {
                    tracing::warn!(call_id = %self.call_id, turn = self.turn, versuch, fehler = %e, "Synthese fehlgeschlagen, neuer Versuch");
                    tokio::time::sleep(backoff(versuch)).await;
                    versuch += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn audio_weiterleiten(&self, mut rx: mpsc::Receiver<Vec<i16>>) -> bool {
        let mut gesendet = false;
        let sample_rate = self.options.sample_rate.max(1);
        while let Some(pcm) = rx.recv().await {
            if pcm.is_empty() {
                continue;
            }
            let dauer = Duration::from_micros(pcm.len() as u64 * 1_000_000 / sample_rate as u64);
            {
                let mut bis = self.wiedergabe_bis.lock();
                let jetzt = Instant::now();
                let basis = bis.filter(|b| *b > jetzt).unwrap_or(jetzt);
                *bis = Some(basis + dauer);
            }
            let seq = self.chunk_seq.fetch_add(1, Ordering::Relaxed);
            self.senden(OutboundMessage::tts_chunk(
                self.turn,
                seq,
                &pcm,
                self.options.audio_format,
                self.options.sample_rate,
            ))
            .await;
            gesendet = true;
        }
        gesendet
    }

    fn fallback_melden(&self, fehler: &ProviderError) {
        GatewayStatistik::erhoehen(&self.statistik.provider_fallbacks);
        tracing::warn!(call_id = %self.call_id, turn = self.turn, provider = fehler.provider(), fehler = %fehler, "Provider ausgefallen, Fallback");
        self.timeline.anhaengen(
            &self.call_id,
            art::PROVIDER_FALLBACK,
            json!({
                "turn": self.turn,
                "provider": fehler.provider(),
                "error": fehler.to_string(),
            }),
        );
    }

    async fn senden(&self, nachricht: OutboundMessage) {
        let _ = self.ausgang.send(nachricht).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ReasoningEngine, SpeechSynthesizer};
    use async_trait::async_trait;
    use callbridge_protocol::Codec;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn saetze_trennen() {
        let mut puffer = String::from("Hallo Welt. Das kostet 3.5 Euro! Und");
        let saetze = saetze_abtrennen(&mut puffer);
        assert_eq!(saetze, vec!["Hallo Welt.", "Das kostet 3.5 Euro!"]);
        assert_eq!(puffer, " Und");

        let mut puffer = String::from("Ende.");
        assert!(saetze_abtrennen(&mut puffer).is_empty());
        assert_eq!(puffer, "Ende.");
    }

    #[test]
    fn backoff_begrenzt() {
        assert_eq!(backoff(0), Duration::from_millis(200));
        assert_eq!(backoff(2), Duration::from_millis(800));
        assert_eq!(backoff(10), BACKOFF_MAX);
    }

    // --- Test-Provider ----------------------------------------------------

    struct KeinAsr;

    #[async_trait]
    impl crate::provider::SpeechRecognizer for KeinAsr {
        fn name(&self) -> &'static str {
            "kein"
        }
        async fn oeffnen(
            &self,
            _: &CallId,
            _: &RealtimeOptions,
            _: &OrchestrationConfig,
        ) -> ProviderResult<AsrStrom> {
            Err(ProviderError::Abgebrochen)
        }
    }

    /// Antwortet mit festem Text oder faellt eine Anzahl Male aus
    struct SkriptLlm {
        antwort: &'static str,
        ausfaelle: usize,
        aufrufe: AtomicUsize,
        werkzeug: bool,
    }

    #[async_trait]
    impl ReasoningEngine for SkriptLlm {
        fn name(&self) -> &'static str {
            "skript"
        }
        async fn antworten(
            &self,
            _anfrage: Anfrage,
            werkzeuge: &ToolBroker,
            aus: mpsc::Sender<String>,
        ) -> ProviderResult<()> {
            let n = self.aufrufe.fetch_add(1, Ordering::SeqCst);
            if n < self.ausfaelle {
                return Err(ProviderError::NichtErreichbar {
                    provider: "llm",
                    grund: "503".into(),
                });
            }
            if self.werkzeug {
                let wert = werkzeuge
                    .aufrufen("kundenstatus", json!({"id": 7}))
                    .await?;
                let _ = aus.send(format!("Status {}. ", wert["status"].as_str().unwrap_or("?"))).await;
                return Ok(());
            }
            for wort in self.antwort.split_inclusive(' ') {
                let _ = aus.send(wort.to_string()).await;
            }
            Ok(())
        }
    }

    /// Liefert einen Block pro Satz, optional danach endlos haengend
    struct SkriptTts {
        haengen: bool,
        ausfallen: bool,
    }

    #[async_trait]
    impl SpeechSynthesizer for SkriptTts {
        fn name(&self) -> &'static str {
            "skript"
        }
        async fn synthetisieren(
            &self,
            _text: &str,
            _config: &OrchestrationConfig,
            sample_rate: u32,
            aus: mpsc::Sender<Vec<i16>>,
        ) -> ProviderResult<()> {
            if self.ausfallen {
                return Err(ProviderError::Abgelehnt {
                    provider: "tts",
                    grund: "quota".into(),
                });
            }
            let _ = aus.send(vec![1000; sample_rate as usize / 10]).await;
            if self.haengen {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    struct Aufbau {
        handle: OrchestratorHandle,
        asr_tx: mpsc::Sender<AsrErgebnis>,
        _asr_rx: mpsc::Receiver<AsrEingabe>,
        ausgang: mpsc::Receiver<OutboundMessage>,
        timeline: TimelineStore,
        statistik: Arc<GatewayStatistik>,
    }

    fn aufbau(llm: SkriptLlm, tts: SkriptTts, config: OrchestrationConfig) -> Aufbau {
        let (ausgang_tx, ausgang) = mpsc::channel(64);
        let (timeline, _) = TimelineStore::neu(64);
        let statistik = Arc::new(GatewayStatistik::default());
        let (asr_tx, asr_ergebnisse) = mpsc::channel(8);
        let (eingabe, _asr_rx) = mpsc::channel(8);
        let handle = OrchestratorHandle::starten(
            OrchestratorKontext {
                call_id: CallId::neu("c1"),
                options: RealtimeOptions {
                    audio_format: Codec::Linear16,
                    sample_rate: 8_000,
                    ..Default::default()
                },
                config,
                provider: ProviderSet::neu(Arc::new(KeinAsr), Arc::new(llm), Arc::new(tts)),
                ausgang: ausgang_tx,
                timeline: timeline.clone(),
                statistik: Arc::clone(&statistik),
            },
            AsrStrom {
                eingabe,
                ergebnisse: asr_ergebnisse,
            },
        );
        Aufbau {
            handle,
            asr_tx,
            _asr_rx,
            ausgang,
            timeline,
            statistik,
        }
    }

    fn llm(antwort: &'static str) -> SkriptLlm {
        SkriptLlm {
            antwort,
            ausfaelle: 0,
            aufrufe: AtomicUsize::new(0),
            werkzeug: false,
        }
    }

    fn arten(timeline: &TimelineStore) -> Vec<String> {
        timeline
            .timeline(&CallId::neu("c1"))
            .into_iter()
            .map(|e| e.kind)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn final_fuehrt_zu_antwort_und_audio() {
        let mut a = aufbau(
            llm("Gerne. Ich helfe Ihnen."),
            SkriptTts {
                haengen: false,
                ausfallen: false,
            },
            OrchestrationConfig::default(),
        );
        a.asr_tx
            .send(AsrErgebnis::Teilweise("ich brau".into()))
            .await
            .unwrap();
        a.asr_tx
            .send(AsrErgebnis::Final("ich brauche Hilfe".into()))
            .await
            .unwrap();

        let mut typen = Vec::new();
        let mut chunks = 0;
        while chunks < 2 {
            let n = a.ausgang.recv().await.unwrap();
            if matches!(n, OutboundMessage::TtsChunk { turn: 1, .. }) {
                assert_eq!(n.tts_pcm().unwrap().len(), 800);
                chunks += 1;
            }
            typen.push(n.typ());
        }
        assert_eq!(&typen[..2], &["stt.partial", "stt.final"]);
        assert!(typen.contains(&"llm.delta"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let kinds = arten(&a.timeline);
        assert!(kinds.contains(&art::STT_FINAL.to_string()));
        assert!(kinds.contains(&art::LLM_REPLY.to_string()));
        a.handle.beenden().await;
    }

    #[tokio::test(start_paused = true)]
    async fn barge_in_bricht_synthese_ab() {
        let mut a = aufbau(
            llm("Eine lange Antwort. "),
            SkriptTts {
                haengen: true,
                ausfallen: false,
            },
            OrchestrationConfig::default(),
        );
        a.asr_tx
            .send(AsrErgebnis::Final("hallo".into()))
            .await
            .unwrap();
        loop {
            if let OutboundMessage::TtsChunk { .. } = a.ausgang.recv().await.unwrap() {
                break;
            }
        }

        a.handle.sprache_erkannt();
        loop {
            match a.ausgang.recv().await.unwrap() {
                OutboundMessage::ControlBargein { turn } => {
                    assert_eq!(turn, 1);
                    break;
                }
                OutboundMessage::TtsChunk { .. } => panic!("Audio nach Barge-in"),
                _ => {}
            }
        }
        assert_eq!(a.statistik.snapshot().barge_ins, 1);
        assert!(arten(&a.timeline).contains(&art::BARGE_IN.to_string()));

        // Zweites Sprachsignal ohne laufende Wiedergabe: kein weiterer Barge-in
        a.handle.sprache_erkannt();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.statistik.snapshot().barge_ins, 1);
        a.handle.beenden().await;
    }

    #[tokio::test(start_paused = true)]
    async fn llm_ausfall_wird_wiederholt_dann_fallback() {
        let config = OrchestrationConfig {
            provider_retries: 1,
            ..Default::default()
        };
        let mut a = aufbau(
            SkriptLlm {
                antwort: "nie",
                ausfaelle: usize::MAX,
                aufrufe: AtomicUsize::new(0),
                werkzeug: false,
            },
            SkriptTts {
                haengen: false,
                ausfallen: false,
            },
            config,
        );
        a.asr_tx
            .send(AsrErgebnis::Final("hallo".into()))
            .await
            .unwrap();
        loop {
            match a.ausgang.recv().await.unwrap() {
                OutboundMessage::TtsChunk { .. } => break,
                OutboundMessage::LlmDelta { .. } => panic!("kein Delta erwartet"),
                _ => {}
            }
        }
        assert_eq!(a.statistik.snapshot().provider_fallbacks, 1);
        assert!(arten(&a.timeline).contains(&art::PROVIDER_FALLBACK.to_string()));
        a.handle.beenden().await;
    }

    #[tokio::test(start_paused = true)]
    async fn tts_ausfall_meldet_fehler_und_session_laeuft_weiter() {
        let mut a = aufbau(
            llm("Hallo. "),
            SkriptTts {
                haengen: false,
                ausfallen: true,
            },
            OrchestrationConfig::default(),
        );
        a.asr_tx.send(AsrErgebnis::Final("eins".into())).await.unwrap();
        loop {
            if let OutboundMessage::Error { code, .. } = a.ausgang.recv().await.unwrap() {
                assert_eq!(code, ErrorCode::ProviderFailure);
                break;
            }
        }
        // Naechster Turn wird trotzdem verarbeitet
        a.asr_tx.send(AsrErgebnis::Final("zwei".into())).await.unwrap();
        loop {
            if let OutboundMessage::SttFinal { turn, .. } = a.ausgang.recv().await.unwrap() {
                assert_eq!(turn, 2);
                break;
            }
        }
        a.handle.beenden().await;
    }

    #[tokio::test(start_paused = true)]
    async fn werkzeug_aufruf_ruht_bis_zum_ergebnis() {
        let mut a = aufbau(
            SkriptLlm {
                antwort: "",
                ausfaelle: 0,
                aufrufe: AtomicUsize::new(0),
                werkzeug: true,
            },
            SkriptTts {
                haengen: false,
                ausfallen: false,
            },
            OrchestrationConfig::default(),
        );
        a.asr_tx
            .send(AsrErgebnis::Final("mein status".into()))
            .await
            .unwrap();

        let id = loop {
            if let OutboundMessage::ToolCall { id, name, .. } = a.ausgang.recv().await.unwrap() {
                assert_eq!(name, "kundenstatus");
                break id;
            }
        };
        assert!(a.handle.tool_ergebnis(&id, json!({"status": "gold"})));

        loop {
            if let OutboundMessage::LlmDelta { text, .. } = a.ausgang.recv().await.unwrap() {
                assert_eq!(text, "Status gold. ");
                break;
            }
        }
        a.handle.beenden().await;
    }
}
