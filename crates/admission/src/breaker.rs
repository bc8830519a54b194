//! Circuit Breaker fuer den Zulassungspfad
//!
//! ```text
//!   Geschlossen --N Fehlschlaege--> Offen --Cooldown abgelaufen--> HalbOffen
//!        ^                            ^                                |
//!        |                            +---------Fehlschlag-------------+
//!        +------------------------Erfolg-------------------------------+
//! ```
//!
//! Im halboffenen Zustand ist genau eine Pruefanfrage gleichzeitig erlaubt; weitere
//! Versuche werden abgewiesen, bis die Pruefanfrage mit Erfolg, Fehlschlag oder
//! Abbruch endet.
//!
//! Jeder erlaubte Versuch traegt die Generation, in der er zugelassen wurde.
//! Die Generation waechst mit jedem Zustandswechsel und jeder vergebenen
//! Pruefanfrage. Ergebnisse aelterer Generationen werden ignoriert; nur der Inhaber
//! der laufenden Pruefanfrage kann den Breaker schliessen oder die Pruefanfrage freigeben.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Wartezeit-Hinweis, solange eine Pruefanfrage laeuft
const PRUEF_WARTEZEIT: Duration = Duration::from_secs(1);

/// Zustand des Breakers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerZustand {
    Geschlossen,
    Offen,
    HalbOffen,
}

impl BreakerZustand {
    pub fn als_str(&self) -> &'static str {
        match self {
            Self::Geschlossen => "closed",
            Self::Offen => "open",
            Self::HalbOffen => "half_open",
        }
    }

    /// Wert fuer die Gauge (0 = geschlossen, 1 = halboffen, 2 = offen)
    pub fn als_gauge(&self) -> i64 {
        match self {
            Self::Geschlossen => 0,
            Self::HalbOffen => 1,
            Self::Offen => 2,
        }
    }
}

/// Vom Breaker erlaubter Versuch; das Ergebnis wird mit ihm gemeldet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Versuch {
    generation: u64,
    pruefung: bool,
}

impl Versuch {
    /// Laeuft der Versuch als Pruefanfrage im halboffenen Zustand?
    pub fn ist_pruefung(&self) -> bool {
        self.pruefung
    }
}

/// Momentaufnahme des Breakers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerStatus {
    pub zustand: BreakerZustand,
    pub fehler_folge: u32,
    pub letzter_fehler: Option<Instant>,
    pub naechster_versuch: Option<Instant>,
}

#[derive(Debug)]
struct BreakerInner {
    zustand: BreakerZustand,
    generation: u64,
    fehler_folge: u32,
    letzter_fehler: Option<Instant>,
    naechster_versuch: Option<Instant>,
    pruefung_laeuft: bool,
}

impl BreakerInner {
    fn wechseln(&mut self, zustand: BreakerZustand) {
        self.zustand = zustand;
        self.generation += 1;
    }

    /// Ist `versuch` die laufende Pruefanfrage?
    fn ist_laufende_pruefung(&self, versuch: Versuch) -> bool {
        self.zustand == BreakerZustand::HalbOffen
            && self.pruefung_laeuft
            && versuch.pruefung
            && versuch.generation == self.generation
    }
}

/// Prozessweiter Circuit Breaker
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    schwelle: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn neu(schwelle: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                zustand: BreakerZustand::Geschlossen,
                generation: 0,
                fehler_folge: 0,
                letzter_fehler: None,
                naechster_versuch: None,
                pruefung_laeuft: false,
            }),
            schwelle: schwelle.max(1),
            cooldown,
        }
    }

    /// Prueft, ob ein Versuch erlaubt ist; sonst Wartezeit bis zum naechsten
    pub fn erlauben(&self) -> Result<Versuch, Duration> {
        self.erlauben_bei(Instant::now())
    }

    pub fn erlauben_bei(&self, jetzt: Instant) -> Result<Versuch, Duration> {
        let mut inner = self.inner.lock();
        let zustand = inner.zustand;
        match zustand {
            BreakerZustand::Geschlossen => Ok(Versuch {
                generation: inner.generation,
                pruefung: false,
            }),
            BreakerZustand::Offen => {
                let naechster = inner.naechster_versuch.unwrap_or(jetzt);
                if jetzt >= naechster {
                    inner.wechseln(BreakerZustand::HalbOffen);
                    inner.pruefung_laeuft = true;
                    tracing::info!(generation = inner.generation, "Circuit Breaker halboffen, Pruefanfrage erlaubt");
                    Ok(Versuch {
                        generation: inner.generation,
                        pruefung: true,
                    })
                } else {
                    Err(naechster - jetzt)
                }
            }
            BreakerZustand::HalbOffen => {
                if inner.pruefung_laeuft {
                    Err(PRUEF_WARTEZEIT.min(self.cooldown))
                } else {
                    inner.generation += 1;
                    inner.pruefung_laeuft = true;
                    Ok(Versuch {
                        generation: inner.generation,
                        pruefung: true,
                    })
                }
            }
        }
    }

    /// Meldet einen erfolgreichen Versuch
    pub fn erfolg(&self, versuch: Versuch) {
        let mut inner = self.inner.lock();
        let zustand = inner.zustand;
        match zustand {
            BreakerZustand::Geschlossen if versuch.generation == inner.generation => {
                inner.fehler_folge = 0
            }
            BreakerZustand::HalbOffen if inner.ist_laufende_pruefung(versuch) => {
                inner.wechseln(BreakerZustand::Geschlossen);
                inner.fehler_folge = 0;
                inner.naechster_versuch = None;
                inner.pruefung_laeuft = false;
                tracing::info!("Circuit Breaker geschlossen");
            }
            zustand => {
                tracing::trace!(
                    zustand = zustand.als_str(),
                    generation = versuch.generation,
                    aktuell = inner.generation,
                    "Veralteter Erfolg ignoriert"
                );
            }
        }
    }

    pub fn fehlschlag(&self, versuch: Versuch) {
        self.fehlschlag_bei(versuch, Instant::now())
    }

    /// Meldet einen fehlgeschlagenen Versuch
    pub fn fehlschlag_bei(&self, versuch: Versuch, jetzt: Instant) {
        let mut inner = self.inner.lock();
        let zustand = inner.zustand;
        match zustand {
            BreakerZustand::Geschlossen if versuch.generation == inner.generation => {
                inner.letzter_fehler = Some(jetzt);
                inner.fehler_folge += 1;
                if inner.fehler_folge >= self.schwelle {
                    inner.wechseln(BreakerZustand::Offen);
                    inner.naechster_versuch = Some(jetzt + self.cooldown);
                    tracing::warn!(
                        fehler = inner.fehler_folge,
                        cooldown_sek = self.cooldown.as_secs(),
                        "Circuit Breaker geoeffnet"
                    );
                }
            }
            BreakerZustand::HalbOffen if inner.ist_laufende_pruefung(versuch) => {
                inner.letzter_fehler = Some(jetzt);
                inner.fehler_folge += 1;
                inner.wechseln(BreakerZustand::Offen);
                inner.naechster_versuch = Some(jetzt + self.cooldown);
                inner.pruefung_laeuft = false;
                tracing::warn!("Pruefanfrage fehlgeschlagen, Circuit Breaker erneut offen");
            }
            zustand => {
                tracing::trace!(
                    zustand = zustand.als_str(),
                    generation = versuch.generation,
                    aktuell = inner.generation,
                    "Veralteter Fehlschlag ignoriert"
                );
            }
        }
    }

    /// Versuch endete ohne Aussage ueber die Gesundheit (z.B. Kapazitaet)
    ///
    /// Gibt die Pruefanfrage nur frei, wenn `versuch` sie haelt.
    pub fn abbrechen(&self, versuch: Versuch) {
        let mut inner = self.inner.lock();
        if inner.ist_laufende_pruefung(versuch) {
            inner.pruefung_laeuft = false;
        }
    }

    pub fn zustand(&self) -> BreakerZustand {
        self.inner.lock().zustand
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock();
        BreakerStatus {
            zustand: inner.zustand,
            fehler_folge: inner.fehler_folge,
            letzter_fehler: inner.letzter_fehler,
            naechster_versuch: inner.naechster_versuch,
        }
    }
}
