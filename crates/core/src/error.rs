//! Fehlertypen fuer den Reflector
//!
//! Zentraler Fehler-Enum der die uebergreifenden Fehlerzustaende abdeckt.
//! Untermodule definieren eigene Fehler und konvertieren bei Bedarf.

use thiserror::Error;

/// Globaler Result-Alias fuer den Reflector
pub type Result<T> = std::result::Result<T, ReflectorError>;

/// Fehlerkategorien des Reflectors
#[derive(Debug, Error)]
pub enum ReflectorError {
    // --- Verbindung & Netzwerk ---
    #[error("Verbindung getrennt: {0}")]
    Getrennt(String),

    #[error("Zeitlimit ueberschritten: {0}")]
    Zeitlimit(String),

    // --- Authentifizierung & Autorisierung ---
    #[error("Authentifizierung fehlgeschlagen: {0}")]
    Authentifizierung(String),

    #[error("Zugriff verweigert: {0}")]
    ZugriffVerweigert(String),

    // --- Protokoll ---
    #[error("Ungueltige Nachricht: {0}")]
    UngueltigeNachricht(String),

    #[error("Protokollversion nicht unterstuetzt: minimum={minimum}, erhalten={erhalten}")]
    ProtokollVersion { minimum: String, erhalten: String },

    // --- Kryptografie ---
    #[error("Kryptografiefehler: {0}")]
    Krypto(String),

    // --- Ressourcen ---
    #[error("Session nicht gefunden: {0}")]
    SessionNichtGefunden(String),

    #[error("Server ausgelastet: {0}")]
    Ausgelastet(String),

    // --- Konfiguration ---
    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    // --- Intern ---
    #[error("Interner Fehler: {0}")]
    Intern(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl ReflectorError {
    /// Erstellt einen internen Fehler aus einer beliebigen Nachricht
    pub fn intern(msg: impl Into<String>) -> Self {
        Self::Intern(msg.into())
    }

    /// Gibt true zurueck wenn der Fehler die Verbindung beenden muss
    pub fn ist_fatal_fuer_session(&self) -> bool {
        !matches!(self, Self::Krypto(_) | Self::Ausgelastet(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fehler_anzeige() {
        let e = ReflectorError::Authentifizierung("Signatur ungueltig".into());
        assert_eq!(
            e.to_string(),
            "Authentifizierung fehlgeschlagen: Signatur ungueltig"
        );
    }

    #[test]
    fn krypto_fehler_sind_nicht_fatal() {
        assert!(!ReflectorError::Krypto("tag".into()).ist_fatal_fuer_session());
        assert!(ReflectorError::ZugriffVerweigert("x".into()).ist_fatal_fuer_session());
    }

    #[test]
    fn protokoll_version_fehler() {
        let e = ReflectorError::ProtokollVersion {
            minimum: "1.6".into(),
            erhalten: "1.5".into(),
        };
        assert!(e.to_string().contains("minimum=1.6"));
        assert!(e.to_string().contains("erhalten=1.5"));
    }
}
