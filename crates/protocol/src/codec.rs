//! Codec-Bibliothek: G.711 μ-law / A-law und linear16
//!
//! Zustandslose Umwandlung zwischen Codec-Bytes und linearem PCM16.
//! μ-law und A-law folgen der logarithmischen Kompandierung nach ITU G.711
//! (Vorzeichen / Segment / Mantisse). linear16 ist little-endian.
//!
//! Der einzige Fehlerfall ist eine ungerade Payload-Laenge bei linear16.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Codec-Typ
// ---------------------------------------------------------------------------

/// Unterstuetzte Audio-Codecs
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// G.711 μ-law (RTP Payload-Typ 0)
    #[serde(alias = "pcmu", alias = "ulaw")]
    Mulaw,
    /// G.711 A-law (RTP Payload-Typ 8)
    #[serde(alias = "pcma")]
    Alaw,
    /// Lineares PCM16, little-endian (dynamischer RTP Payload-Typ)
    #[default]
    Linear16,
}

/// Statischer RTP Payload-Typ fuer PCMU
pub const PT_PCMU: u8 = 0;
/// Statischer RTP Payload-Typ fuer PCMA
pub const PT_PCMA: u8 = 8;

impl Codec {
    /// Bytes pro Sample im kodierten Strom
    pub fn bytes_pro_sample(&self) -> usize {
        match self {
            Self::Mulaw | Self::Alaw => 1,
            Self::Linear16 => 2,
        }
    }

    /// RTP Payload-Typ (linear16 nutzt den konfigurierten dynamischen Typ)
    pub fn payload_type(&self, dynamisch: u8) -> u8 {
        match self {
            Self::Mulaw => PT_PCMU,
            Self::Alaw => PT_PCMA,
            Self::Linear16 => dynamisch,
        }
    }

    /// Codec aus einem RTP Payload-Typ
    pub fn aus_payload_type(pt: u8, dynamisch: u8) -> Option<Self> {
        match pt {
            PT_PCMU => Some(Self::Mulaw),
            PT_PCMA => Some(Self::Alaw),
            pt if pt == dynamisch => Some(Self::Linear16),
            _ => None,
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Mulaw => "mulaw",
            Self::Alaw => "alaw",
            Self::Linear16 => "linear16",
        };
        f.write_str(name)
    }
}

/// Fehler der Codec-Bibliothek
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("linear16-Payload mit ungerader Laenge: {0} Bytes")]
    UngeradeLaenge(usize),
}

/// Samples pro Frame fuer eine Abtastrate und Frame-Dauer
pub fn samples_pro_frame(sample_rate: u32, frame_ms: u32) -> usize {
    (sample_rate as u64 * frame_ms as u64 / 1000) as usize
}

// ---------------------------------------------------------------------------
// Oeffentliche API
// ---------------------------------------------------------------------------

/// Dekodiert eine Codec-Payload zu linearem PCM16
pub fn decode(payload: &[u8], codec: Codec) -> Result<Vec<i16>, CodecError> {
    match codec {
        Codec::Mulaw => Ok(payload.iter().map(|&b| ulaw_zu_linear(b)).collect()),
        Codec::Alaw => Ok(payload.iter().map(|&b| alaw_zu_linear(b)).collect()),
        Codec::Linear16 => {
            if payload.len() % codec.bytes_pro_sample() != 0 {
                return Err(CodecError::UngeradeLaenge(payload.len()));
            }
            Ok(payload
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect())
        }
    }
}

/// Kodiert lineares PCM16 in den gewuenschten Codec
pub fn encode(pcm: &[i16], codec: Codec) -> Vec<u8> {
    match codec {
        Codec::Mulaw => pcm.iter().map(|&s| linear_zu_ulaw(s)).collect(),
        Codec::Alaw => pcm.iter().map(|&s| linear_zu_alaw(s)).collect(),
        Codec::Linear16 => {
            let mut out = Vec::with_capacity(pcm.len() * 2);
            for s in pcm {
                out.extend_from_slice(&s.to_le_bytes());
            }
            out
        }
    }
}

// ---------------------------------------------------------------------------
// G.711 Kompandierung
// ---------------------------------------------------------------------------

const SIGN_BIT: i32 = 0x80;
const QUANT_MASK: i32 = 0x0F;
const SEG_SHIFT: i32 = 4;
const SEG_MASK: i32 = 0x70;

/// μ-law Bias (0x84) und Clipping-Grenze im 14-Bit-Raum
const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 8159;

/// Segment-Obergrenzen
const SEG_UEND: [i32; 8] = [0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF, 0x1FFF];
const SEG_AEND: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];

fn segment(wert: i32, grenzen: &[i32; 8]) -> i32 {
    grenzen
        .iter()
        .position(|&g| wert <= g)
        .map(|i| i as i32)
        .unwrap_or(8)
}

/// 16-Bit linear -> 8-Bit μ-law
pub fn linear_zu_ulaw(sample: i16) -> u8 {
    let mut pcm = (sample as i32) >> 2;
    let maske = if pcm < 0 {
        pcm = -pcm;
        0x7F
    } else {
        0xFF
    };
    pcm = pcm.min(ULAW_CLIP) + (ULAW_BIAS >> 2);

    let seg = segment(pcm, &SEG_UEND);
    if seg >= 8 {
        (0x7F ^ maske) as u8
    } else {
        let wert = (seg << 4) | ((pcm >> (seg + 1)) & 0x0F);
        (wert ^ maske) as u8
    }
}

/// 8-Bit μ-law -> 16-Bit linear
pub fn ulaw_zu_linear(byte: u8) -> i16 {
    let u = !(byte as i32) & 0xFF;
    let mut t = ((u & QUANT_MASK) << 3) + ULAW_BIAS;
    t <<= (u & SEG_MASK) >> SEG_SHIFT;
    let wert = if u & SIGN_BIT != 0 {
        ULAW_BIAS - t
    } else {
        t - ULAW_BIAS
    };
    wert as i16
}

/// 16-Bit linear -> 8-Bit A-law
pub fn linear_zu_alaw(sample: i16) -> u8 {
    let mut pcm = (sample as i32) >> 3;
    let maske = if pcm >= 0 {
        0xD5
    } else {
        pcm = -pcm - 1;
        0x55
    };

    let seg = segment(pcm, &SEG_AEND);
    if seg >= 8 {
        (0x7F ^ maske) as u8
    } else {
        let mut wert = seg << SEG_SHIFT;
        if seg < 2 {
            wert |= (pcm >> 1) & QUANT_MASK;
        } else {
            wert |= (pcm >> seg) & QUANT_MASK;
        }
        (wert ^ maske) as u8
    }
}

/// 8-Bit A-law -> 16-Bit linear
pub fn alaw_zu_linear(byte: u8) -> i16 {
    let a = (byte as i32) ^ 0x55;
    let mut t = (a & QUANT_MASK) << 4;
    let seg = (a & SEG_MASK) >> SEG_SHIFT;
    match seg {
        0 => t += 8,
        1 => t += 0x108,
        _ => {
            t += 0x108;
            t <<= seg - 1;
        }
    }
    let wert = if a & SIGN_BIT != 0 { t } else { -t };
    wert as i16
}
