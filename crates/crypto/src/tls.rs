//! TLS-Acceptor fuer den Control-Kanal
//!
//! Der Reflector wechselt nach `start_encryption` auf derselben
//! TCP-Verbindung auf TLS (tokio-rustls). Das Serverzertifikat stammt aus
//! der eigenen Issuing-CA, die Kette wird als PEM (Server + Issuing)
//! uebergeben.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use tokio_rustls::TlsAcceptor;

use crate::error::{CryptoError, CryptoResult};

/// Baut einen `TlsAcceptor` aus PEM-Kette und privatem Schluessel
pub fn tls_acceptor_erstellen(kette_pem: &str, key_pem: &str) -> CryptoResult<TlsAcceptor> {
    let kette = zertifikate_parsen(kette_pem)?;
    if kette.is_empty() {
        return Err(CryptoError::Tls("Leere Zertifikatskette".into()));
    }
    let schluessel = schluessel_parsen(key_pem)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(kette, schluessel)
        .map_err(|e| CryptoError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn zertifikate_parsen(pem: &str) -> CryptoResult<Vec<CertificateDer<'static>>> {
    let mut cursor = std::io::Cursor::new(pem.as_bytes());
    certs(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CryptoError::Tls(format!("Zertifikat-Parsing fehlgeschlagen: {e}")))
}

fn schluessel_parsen(pem: &str) -> CryptoResult<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem.as_bytes());
    private_key(&mut cursor)
        .map_err(|e| CryptoError::Tls(format!("Schluessel-Parsing fehlgeschlagen: {e}")))?
        .ok_or_else(|| CryptoError::Tls("Kein privater Schluessel gefunden".to_string()))
}
