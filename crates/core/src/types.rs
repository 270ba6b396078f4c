//! Gemeinsame Identifikationstypen fuer den Reflector
//!
//! Alle IDs verwenden das Newtype-Pattern um Verwechslungen zwischen
//! verschiedenen ID-Arten zur Compilezeit auszuschliessen.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Opake, generationsgepruefte Session-ID
///
/// Die unteren 16 Bit adressieren einen Slot in der Client-Registry, die
/// oberen 16 Bit sind die Generation dieses Slots. Wird ein Slot nach dem
/// Trennen einer Session neu belegt, aendert sich die Generation, eine
/// veraltete ID kann den neuen Eintrag daher nie treffen.
///
/// Die ID wird im Klartext im UDP-Header uebertragen (Client-ID-Feld).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u32);

impl SessionId {
    /// Setzt eine ID aus Slot-Index und Generation zusammen
    pub fn aus_teilen(slot: u16, generation: u16) -> Self {
        Self(((generation as u32) << 16) | slot as u32)
    }

    /// Slot-Index in der Registry
    pub fn slot(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Generation des Slots
    pub fn generation(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Gibt den rohen Wert zurueck
    pub fn inner(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session:{:08x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// TalkGroup
// ---------------------------------------------------------------------------

/// 32-Bit Talk-Group-Nummer
///
/// Gruppe 0 bedeutet "keine Gruppe gewaehlt" bzw. bei QSY "beliebige Gruppe".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TalkGroup(pub u32);

impl TalkGroup {
    /// Keine Gruppe
    pub const KEINE: TalkGroup = TalkGroup(0);

    /// Gibt true zurueck wenn keine Gruppe gesetzt ist
    pub fn ist_keine(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for TalkGroup {
    fn from(nr: u32) -> Self {
        Self(nr)
    }
}

impl std::fmt::Display for TalkGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tg:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Callsign
// ---------------------------------------------------------------------------

/// Rufzeichen eines Knotens
///
/// Wird beim Erzeugen normalisiert (Grossbuchstaben, ohne Leerraum am Rand).
/// Erlaubt sind ASCII-Buchstaben, Ziffern sowie `-`, `/` und `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Callsign(String);

/// Maximale Laenge eines Rufzeichens
pub const CALLSIGN_MAX_LAENGE: usize = 32;

impl Callsign {
    /// Validiert und normalisiert ein Rufzeichen
    pub fn neu(roh: &str) -> crate::Result<Self> {
        let s = roh.trim().to_ascii_uppercase();
        if s.is_empty() || s.len() > CALLSIGN_MAX_LAENGE {
            return Err(crate::ReflectorError::UngueltigeNachricht(format!(
                "Rufzeichen hat ungueltige Laenge: '{roh}'"
            )));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '/' | '_'))
        {
            return Err(crate::ReflectorError::UngueltigeNachricht(format!(
                "Rufzeichen enthaelt ungueltige Zeichen: '{roh}'"
            )));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Callsign {
    type Error = crate::ReflectorError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Callsign::neu(&s)
    }
}

impl From<Callsign> for String {
    fn from(c: Callsign) -> Self {
        c.0
    }
}

impl std::fmt::Display for Callsign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
