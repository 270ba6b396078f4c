//! UDP-Datagramm-Format
//!
//! Jedes Datagramm besteht aus einem 13 Byte grossen Klartext-Header, der
//! als AAD mit authentifiziert wird, und dem AES-256-GCM-Chiffrat.
//!
//! ```text
//! Offset  Len  Beschreibung
//! ------  ---  -----------
//!  0       1   Version (= 1)
//!  1       4   Client-ID / SessionId (big-endian)
//!  5       8   Zaehler (big-endian, streng monoton pro Schluessel)
//! 13       N   Chiffrat + 16 Byte Tag
//! ```
//!
//! Der entschluesselte Klartext ist eine [`UdpNachricht`]: ein Typ-Byte
//! gefolgt vom typspezifischen Rumpf. Audio wird nicht interpretiert.

use reflector_core::types::SessionId;
use std::io;

/// Aktuelle Datagramm-Version
pub const DATAGRAMM_VERSION: u8 = 1;

/// Laenge des GCM-Tags
pub const TAG_LAENGE: usize = 16;

/// Maximale Audio-Nutzlast pro Datagramm
pub const MAX_AUDIO_LAENGE: usize = 1400;

fn ungueltig(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

// ---------------------------------------------------------------------------
// DatagrammKopf
// ---------------------------------------------------------------------------

/// Klartext-Kopf eines Datagramms (zugleich AAD)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagrammKopf {
    pub version: u8,
    pub client_id: SessionId,
    pub zaehler: u64,
}

impl DatagrammKopf {
    /// Header-Groesse in Bytes
    pub const GROESSE: usize = 13;

    pub fn neu(client_id: SessionId, zaehler: u64) -> Self {
        Self {
            version: DATAGRAMM_VERSION,
            client_id,
            zaehler,
        }
    }

    /// Serialisiert den Kopf (big-endian)
    pub fn encode(&self) -> [u8; Self::GROESSE] {
        let mut buf = [0u8; Self::GROESSE];
        buf[0] = self.version;
        buf[1..5].copy_from_slice(&self.client_id.inner().to_be_bytes());
        buf[5..13].copy_from_slice(&self.zaehler.to_be_bytes());
        buf
    }

    /// Liest den Kopf vom Anfang eines Datagramms
    ///
    /// # Fehler
    /// `InvalidData` wenn das Datagramm zu kurz fuer Kopf + Tag ist oder die
    /// Version nicht passt.
    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < Self::GROESSE + TAG_LAENGE {
            return Err(ungueltig(format!(
                "Datagramm zu kurz: {} Bytes",
                buf.len()
            )));
        }
        if buf[0] != DATAGRAMM_VERSION {
            return Err(ungueltig(format!(
                "Unbekannte Datagramm-Version: {}",
                buf[0]
            )));
        }
        let client_id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let mut z = [0u8; 8];
        z.copy_from_slice(&buf[5..13]);
        Ok(Self {
            version: buf[0],
            client_id: SessionId(client_id),
            zaehler: u64::from_be_bytes(z),
        })
    }
}

// ---------------------------------------------------------------------------
// UdpNachricht
// ---------------------------------------------------------------------------

/// Entschluesselter Inhalt eines Datagramms
#[derive(Debug, Clone, PartialEq)]
pub enum UdpNachricht {
    /// Lebenszeichen
    Heartbeat,
    /// Opake Audiodaten
    Audio(Vec<u8>),
    /// Sender beendet den Durchgang, Empfaenger sollen ausspielen
    FlushSamples,
    /// Empfaenger hat alles ausgespielt
    AllSamplesFlushed,
    /// Signalstaerke eines Empfaengers
    SignalStrength { rx_id: u8, siglev: f32, active: bool },
}

impl UdpNachricht {
    const TYP_HEARTBEAT: u8 = 0;
    const TYP_AUDIO: u8 = 1;
    const TYP_FLUSH: u8 = 2;
    const TYP_FLUSHED: u8 = 3;
    const TYP_SIGNAL: u8 = 4;

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Heartbeat => vec![Self::TYP_HEARTBEAT],
            Self::Audio(daten) => {
                let mut buf = Vec::with_capacity(1 + daten.len());
                buf.push(Self::TYP_AUDIO);
                buf.extend_from_slice(daten);
                buf
            }
            Self::FlushSamples => vec![Self::TYP_FLUSH],
            Self::AllSamplesFlushed => vec![Self::TYP_FLUSHED],
            Self::SignalStrength {
                rx_id,
                siglev,
                active,
            } => {
                let mut buf = Vec::with_capacity(7);
                buf.push(Self::TYP_SIGNAL);
                buf.push(*rx_id);
                buf.extend_from_slice(&siglev.to_be_bytes());
                buf.push(u8::from(*active));
                buf
            }
        }
    }

    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        let (&typ, rumpf) = buf
            .split_first()
            .ok_or_else(|| ungueltig("Leere UDP-Nachricht"))?;
        match typ {
            Self::TYP_HEARTBEAT => Ok(Self::Heartbeat),
            Self::TYP_AUDIO => {
                if rumpf.len() > MAX_AUDIO_LAENGE {
                    return Err(ungueltig(format!(
                        "Audio zu lang: {} Bytes",
                        rumpf.len()
                    )));
                }
                Ok(Self::Audio(rumpf.to_vec()))
            }
            Self::TYP_FLUSH => Ok(Self::FlushSamples),
            Self::TYP_FLUSHED => Ok(Self::AllSamplesFlushed),
            Self::TYP_SIGNAL => {
                if rumpf.len() != 6 {
                    return Err(ungueltig("SignalStrength hat falsche Laenge"));
                }
                Ok(Self::SignalStrength {
                    rx_id: rumpf[0],
                    siglev: f32::from_be_bytes([rumpf[1], rumpf[2], rumpf[3], rumpf[4]]),
                    active: rumpf[5] != 0,
                })
            }
            t => Err(ungueltig(format!("Unbekannter UDP-Nachrichtentyp: {t}"))),
        }
    }
}
