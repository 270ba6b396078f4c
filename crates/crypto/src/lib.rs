//! # reflector-crypto
//!
//! Kryptografie-Subsystem des Reflectors.
//!
//! ## Module
//! - `pki` - austauschbares Zertifikats-Backend (rcgen, x509-parser, ring)
//! - `ca` - zweistufige Zertifizierungsstelle mit Audit-Protokoll
//! - `richtlinie` - Rufzeichen- und E-Mail-Muster
//! - `udp_cipher` - AES-256-GCM fuer den UDP-Kanal mit Zaehler-Disziplin
//! - `tls` - TLS-Acceptor fuer den Control-Kanal
//! - `error` - Fehlertypen

pub mod ca;
pub mod error;
pub mod pki;
pub mod richtlinie;
pub mod tls;
pub mod udp_cipher;

// Bequeme Re-Exports
pub use ca::{CaBundle, CaConfig, CaManager, CsrErgebnis, Erneuerungen, ZertEintrag, ZertStatus};
pub use error::{CryptoError, CryptoResult};
pub use pki::{PkiBackend, RcgenPki, ZertInfo};
pub use richtlinie::Richtlinie;
pub use tls::tls_acceptor_erstellen;
pub use udp_cipher::{Rolle, UdpCipher};
