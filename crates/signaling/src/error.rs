//! Fehlertypen fuer den Signaling-Service

use reflector_crypto::CryptoError;
use reflector_voice::RoutingFehler;
use thiserror::Error;

/// Fehlertyp fuer den Signaling-Service
#[derive(Debug, Error)]
pub enum SignalingError {
    /// IO-Fehler (TCP, TLS)
    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),

    /// Nachricht passt nicht zum Verbindungszustand oder ist fehlerhaft
    #[error("Protokollfehler: {0}")]
    Protokoll(String),

    /// Fehler aus CA oder Kryptografie
    #[error("Kryptofehler: {0}")]
    Krypto(#[from] CryptoError),

    /// Fehler aus Registry oder Router
    #[error("Routing-Fehler: {0}")]
    Routing(#[from] RoutingFehler),

    /// Ungueltiges Rufzeichen oder sonstige Eingabe
    #[error("Ungueltige Eingabe: {0}")]
    Eingabe(String),

    /// Timeout (Heartbeat, TLS-Handshake, Trennung)
    #[error("Timeout")]
    Timeout,
}

impl SignalingError {
    /// Erstellt einen Protokollfehler
    pub fn protokoll(msg: impl Into<String>) -> Self {
        Self::Protokoll(msg.into())
    }
}

impl From<reflector_core::ReflectorError> for SignalingError {
    fn from(e: reflector_core::ReflectorError) -> Self {
        Self::Eingabe(e.to_string())
    }
}

/// Result-Typ fuer den Signaling-Service
pub type SignalingResult<T> = Result<T, SignalingError>;
