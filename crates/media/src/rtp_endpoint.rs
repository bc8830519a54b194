//! RTP-Endpunkt eines Media-Legs (Sende-Seite)
//!
//! Haelt SSRC, Sequenz- und Zeitstempel-Zaehler fuer die ausgehende
//! Richtung. Die SSRC wird pro Leg zufaellig gewaehlt.

use std::net::SocketAddr;

use callbridge_protocol::{Codec, RtpHeader, RtpPacket};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{MediaError, MediaResult};

/// Sende-Zustand eines RTP-Streams
#[derive(Debug, Clone)]
pub struct RtpEndpoint {
    ssrc: u32,
    seq: u16,
    timestamp: u32,
    ziel: SocketAddr,
    codec: Codec,
    payload_type: u8,
    gesendet: u64,
}

impl RtpEndpoint {
    /// Erstellt einen Endpunkt mit zufaelliger SSRC und zufaelligem Startzustand
    pub fn neu(ziel: SocketAddr, codec: Codec, dynamischer_pt: u8) -> MediaResult<Self> {
        let rng = SystemRandom::new();
        let mut zufall = [0u8; 10];
        rng.fill(&mut zufall).map_err(|_| MediaError::Zufall)?;

        Ok(Self::mit_startwerten(
            ziel,
            codec,
            dynamischer_pt,
            u32::from_be_bytes([zufall[0], zufall[1], zufall[2], zufall[3]]),
            u16::from_be_bytes([zufall[4], zufall[5]]),
            u32::from_be_bytes([zufall[6], zufall[7], zufall[8], zufall[9]]),
        ))
    }

    /// Erstellt einen Endpunkt mit festen Startwerten
    pub fn mit_startwerten(
        ziel: SocketAddr,
        codec: Codec,
        dynamischer_pt: u8,
        ssrc: u32,
        seq: u16,
        timestamp: u32,
    ) -> Self {
        Self {
            ssrc,
            seq,
            timestamp,
            ziel,
            codec,
            payload_type: codec.payload_type(dynamischer_pt),
            gesendet: 0,
        }
    }

    /// Kodiert PCM16-Samples und verpackt sie in das naechste RTP-Paket
    ///
    /// Sequenz +1 pro Paket, Zeitstempel + Anzahl Samples.
    pub fn paketieren(&mut self, samples: &[i16]) -> Vec<u8> {
        let mut header = RtpHeader::neu(self.payload_type, self.seq, self.timestamp, self.ssrc);
        header.marker = self.gesendet == 0;
        let paket = RtpPacket {
            header,
            payload: callbridge_protocol::codec::encode(samples, self.codec),
        };

        self.seq = self.seq.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(samples.len() as u32);
        self.gesendet += 1;
        paket.encode()
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn ziel(&self) -> SocketAddr {
        self.ziel
    }

    /// Aktualisiert das Ziel (symmetrisches RTP)
    pub fn ziel_setzen(&mut self, ziel: SocketAddr) {
        self.ziel = ziel;
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn gesendet(&self) -> u64 {
        self.gesendet
    }
}
