//! Fehlertypen fuer Registry und Talk-Group-Router

use reflector_core::types::{Callsign, SessionId, TalkGroup};
use thiserror::Error;

/// Fehler bei Registrierung, Routing und QSY
#[derive(Debug, Error)]
pub enum RoutingFehler {
    #[error("Session nicht gefunden: {0}")]
    SessionNichtGefunden(SessionId),

    #[error("Rufzeichen bereits verbunden: {0}")]
    RufzeichenBelegt(Callsign),

    #[error("Registry voll ({0} Sessions)")]
    RegistryVoll(usize),

    #[error("Keine Talk-Group gewaehlt")]
    KeineGruppe,

    #[error("Talk-Group {0} ist gesperrt")]
    GruppeVerboten(TalkGroup),

    #[error("QSY-Pool erschoepft")]
    QsyPoolErschoepft,

    #[error(transparent)]
    Krypto(#[from] reflector_crypto::CryptoError),
}

pub type RoutingResult<T> = Result<T, RoutingFehler>;
