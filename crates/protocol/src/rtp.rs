//! RTP-Paketformat (RFC 3550)
//!
//! ## Header-Layout (12 Bytes, big-endian)
//!
//! ```text
//!  0                   1                   2                   3
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! CSRC-Liste und Header-Extension werden beim Dekodieren uebersprungen,
//! Padding wird entfernt. Beim Kodieren werden beide nie geschrieben.

use thiserror::Error;

/// Laenge des festen RTP-Headers in Bytes
pub const RTP_HEADER_SIZE: usize = 12;

/// Einzige unterstuetzte RTP-Version
pub const RTP_VERSION: u8 = 2;

/// Fehler beim Parsen eines RTP-Pakets
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RtpError {
    #[error("Paket zu kurz: {0} Bytes")]
    ZuKurz(usize),

    #[error("Unbekannte RTP-Version: {0}")]
    FalscheVersion(u8),

    #[error("CSRC-Liste oder Extension ueberschreitet Paketlaenge")]
    UngueltigeErweiterung,

    #[error("Ungueltiges Padding: {0} Bytes")]
    UngueltigesPadding(u8),
}

/// Fester RTP-Header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Header fuer ein ausgehendes Paket ohne Padding/CSRC/Extension
    pub fn neu(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: payload_type & 0x7F,
            sequence,
            timestamp,
            ssrc,
        }
    }
}

/// RTP-Paket mit Header und Codec-Payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    /// Parst ein RTP-Paket aus einem UDP-Datagramm
    pub fn decode(buf: &[u8]) -> Result<Self, RtpError> {
        if buf.len() < RTP_HEADER_SIZE {
            return Err(RtpError::ZuKurz(buf.len()));
        }

        let version = buf[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::FalscheVersion(version));
        }

        let header = RtpHeader {
            version,
            padding: buf[0] & 0x20 != 0,
            extension: buf[0] & 0x10 != 0,
            csrc_count: buf[0] & 0x0F,
            marker: buf[1] & 0x80 != 0,
            payload_type: buf[1] & 0x7F,
            sequence: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        };

        let mut start = RTP_HEADER_SIZE + 4 * header.csrc_count as usize;
        if start > buf.len() {
            return Err(RtpError::UngueltigeErweiterung);
        }

        if header.extension {
            // Extension-Header: 16 Bit Profil + 16 Bit Laenge in 32-Bit-Worten
            if start + 4 > buf.len() {
                return Err(RtpError::UngueltigeErweiterung);
            }
            let worte = u16::from_be_bytes([buf[start + 2], buf[start + 3]]) as usize;
            start += 4 + 4 * worte;
            if start > buf.len() {
                return Err(RtpError::UngueltigeErweiterung);
            }
        }

        let mut ende = buf.len();
        if header.padding {
            let padding = buf[buf.len() - 1];
            if padding == 0 || ende - start < padding as usize {
                return Err(RtpError::UngueltigesPadding(padding));
            }
            ende -= padding as usize;
        }

        Ok(Self {
            header,
            payload: buf[start..ende].to_vec(),
        })
    }

    /// Serialisiert das Paket (ohne CSRC, Extension und Padding)
    pub fn encode(&self) -> Vec<u8> {
        let h = &self.header;
        let mut buf = Vec::with_capacity(RTP_HEADER_SIZE + self.payload.len());
        buf.push(RTP_VERSION << 6);
        buf.push(((h.marker as u8) << 7) | (h.payload_type & 0x7F));
        buf.extend_from_slice(&h.sequence.to_be_bytes());
        buf.extend_from_slice(&h.timestamp.to_be_bytes());
        buf.extend_from_slice(&h.ssrc.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}
