//! Fehlertypen fuer das Kryptografie-Subsystem

use thiserror::Error;

/// Fehler im Kryptografie-Subsystem
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Schluessel-Generierung fehlgeschlagen: {0}")]
    SchluesselGenerierung(String),

    #[error("Verschluesselung fehlgeschlagen: {0}")]
    Verschluesselung(String),

    #[error("Entschluesselung fehlgeschlagen: {0}")]
    Entschluesselung(String),

    #[error("Wiederholtes Datagramm: Zaehler {zaehler} <= {hoechster}")]
    Wiederholung { zaehler: u64, hoechster: u64 },

    #[error("Sende-Zaehler erschoepft")]
    ZaehlerErschoepft,

    #[error("Signierung fehlgeschlagen: {0}")]
    Signierung(String),

    #[error("Signatur-Verifikation fehlgeschlagen: {0}")]
    SignaturVerifikation(String),

    #[error("Ungueltige Schluessel-Laenge: erwartet {erwartet}, erhalten {erhalten}")]
    UngueltigeSchluesselLaenge { erwartet: usize, erhalten: usize },

    #[error("Ungueltige Daten: {0}")]
    UngueltigeDaten(String),

    #[error("Ungueltiger CSR: {0}")]
    UngueltigerCsr(String),

    #[error("Richtlinie verletzt: {0}")]
    Richtlinie(String),

    #[error("Zertifikat ungueltig: {0}")]
    ZertifikatUngueltig(String),

    #[error("Zertifikat widerrufen: {0}")]
    Widerrufen(String),

    #[error("Rufzeichen bereits an anderen Schluessel gebunden: {0}")]
    SchluesselKonflikt(String),

    #[error("Zu viele ausstehende CSRs ({0})")]
    ZuVieleAusstehend(usize),

    #[error("Kein Eintrag fuer {0}")]
    NichtGefunden(String),

    #[error("Zertifikat-Generierung fehlgeschlagen: {0}")]
    ZertifikatGenerierung(String),

    #[error("TLS-Fehler: {0}")]
    Tls(String),

    #[error("Base64-Dekodierung fehlgeschlagen: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Persistenz: {0}")]
    Persistenz(String),

    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),
}

impl CryptoError {
    /// Fehler die einem Knoten nur generisch gemeldet werden duerfen
    pub fn ist_auth_fehler(&self) -> bool {
        matches!(
            self,
            Self::Richtlinie(_)
                | Self::ZertifikatUngueltig(_)
                | Self::Widerrufen(_)
                | Self::SchluesselKonflikt(_)
                | Self::SignaturVerifikation(_)
                | Self::UngueltigerCsr(_)
        )
    }
}

pub type CryptoResult<T> = Result<T, CryptoError>;
