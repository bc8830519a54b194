//! Audio-Frame – eine 20–40 ms Scheibe Audio
//!
//! Wird beim Empfang (RTP oder Session-Verbindung) erzeugt und danach nicht
//! mehr veraendert. Traegt sowohl die Roh-Payload als auch die dekodierten
//! PCM16-Samples.

use callbridge_protocol::codec::{self, Codec, CodecError};

/// Ein empfangener oder synthetisierter Audio-Frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Sequenznummer (laeuft bei 2^16 ueber)
    pub seq: u16,
    /// Aufnahme-Zeitstempel in Samples (RTP-Semantik)
    pub timestamp: u32,
    pub codec: Codec,
    pub sample_rate: u32,
    pub payload: Vec<u8>,
    pub samples: Vec<i16>,
}

impl AudioFrame {
    /// Dekodiert eine Codec-Payload zu einem Frame
    pub fn dekodieren(
        seq: u16,
        timestamp: u32,
        codec: Codec,
        sample_rate: u32,
        payload: Vec<u8>,
    ) -> Result<Self, CodecError> {
        let samples = codec::decode(&payload, codec)?;
        Ok(Self {
            seq,
            timestamp,
            codec,
            sample_rate,
            payload,
            samples,
        })
    }

    /// Erstellt einen Frame aus PCM16-Samples (kodiert die Payload)
    pub fn aus_pcm(
        seq: u16,
        timestamp: u32,
        codec: Codec,
        sample_rate: u32,
        samples: Vec<i16>,
    ) -> Self {
        Self {
            seq,
            timestamp,
            codec,
            sample_rate,
            payload: codec::encode(&samples, codec),
            samples,
        }
    }

    /// Dauer des Frames in Millisekunden
    pub fn dauer_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 * 1000.0 / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dekodieren_und_dauer() {
        let frame = AudioFrame::dekodieren(1, 0, Codec::Mulaw, 8_000, vec![0xFF; 160]).unwrap();
        assert_eq!(frame.samples.len(), 160);
        assert!(frame.samples.iter().all(|&s| s == 0));
        assert!((frame.dauer_ms() - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ungerade_linear16_payload() {
        assert!(AudioFrame::dekodieren(1, 0, Codec::Linear16, 16_000, vec![0; 3]).is_err());
    }
}
