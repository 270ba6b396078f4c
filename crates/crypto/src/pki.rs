//! PKI-Backend
//!
//! Minimale Abstraktion ueber die Zertifikats-Primitiven, die der
//! [`CaManager`](crate::ca::CaManager) braucht. Schluessel, CSRs und
//! Zertifikate werden ausschliesslich als PEM-Strings weitergereicht, das
//! Backend ist dadurch austauschbar und in Tests durch eine Attrappe
//! ersetzbar.
//!
//! Die Standard-Implementierung [`RcgenPki`] nutzt rcgen zum Erzeugen und
//! Signieren, x509-parser zum Pruefen und ring fuer ECDSA P-256/SHA-256.

use chrono::{DateTime, TimeZone, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, UnparsedPublicKey, ECDSA_P256_SHA256_ASN1, ECDSA_P256_SHA256_ASN1_SIGNING,
};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::{FromDer, X509Certificate, X509Name};

use crate::error::{CryptoError, CryptoResult};

/// OID fuer `emailAddress` im Distinguished Name (PKCS#9)
const OID_EMAIL: &[u64] = &[1, 2, 840, 113549, 1, 9, 1];

// ---------------------------------------------------------------------------
// Datentypen
// ---------------------------------------------------------------------------

/// Verwendungszweck eines auszustellenden Zertifikats
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZertArt {
    /// Selbstsignierte Wurzel
    Root,
    /// Zwischen-CA, signiert Client- und Serverzertifikate
    Issuing,
    /// Client-Zertifikat eines Knotens
    Client,
    /// TLS-Serverzertifikat fuer den angegebenen Hostnamen
    Server { hostname: String },
}

/// Vorlage fuer ein auszustellendes Zertifikat
#[derive(Debug, Clone)]
pub struct ZertVorlage {
    pub common_name: String,
    pub email: Option<String>,
    pub gueltig_ab: DateTime<Utc>,
    pub gueltig_bis: DateTime<Utc>,
    pub serial: Vec<u8>,
    pub art: ZertArt,
}

/// Schluessel und Zertifikat eines Ausstellers (PEM)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aussteller {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Eigenschaften eines geprueften CSR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrInfo {
    pub common_name: String,
    pub email: Option<String>,
    /// Rohe Public-Key-Bytes (unkomprimierter EC-Punkt)
    pub oeffentlicher_schluessel: Vec<u8>,
}

/// Eigenschaften eines Zertifikats
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZertInfo {
    pub common_name: String,
    pub email: Option<String>,
    /// Seriennummer als Hex-String
    pub serial: String,
    pub gueltig_ab: DateTime<Utc>,
    pub gueltig_bis: DateTime<Utc>,
    pub oeffentlicher_schluessel: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Austauschbares Krypto-Backend fuer die CA
pub trait PkiBackend: Send + Sync + 'static {
    /// Erzeugt einen neuen privaten Schluessel (PKCS#8 PEM)
    fn schluessel_erzeugen(&self) -> CryptoResult<String>;

    /// Rohe Public-Key-Bytes eines privaten Schluessels
    fn oeffentlicher_schluessel(&self, key_pem: &str) -> CryptoResult<Vec<u8>>;

    /// Erstellt einen CSR fuer Rufzeichen und optionale E-Mail
    fn csr_erstellen(&self, key_pem: &str, callsign: &str, email: Option<&str>)
        -> CryptoResult<String>;

    /// Parst einen CSR und prueft dessen Eigensignatur
    fn csr_pruefen(&self, csr_pem: &str) -> CryptoResult<CsrInfo>;

    /// Stellt ein Zertifikat fuer den Schluessel `key_pem` aus
    ///
    /// Ohne Aussteller wird selbst signiert.
    fn zertifikat_ausstellen(
        &self,
        key_pem: &str,
        vorlage: &ZertVorlage,
        aussteller: Option<&Aussteller>,
    ) -> CryptoResult<String>;

    /// Signiert einen CSR mit dem Aussteller
    ///
    /// Subjekt und Laufzeit kommen aus der Vorlage, der Schluessel aus dem CSR.
    fn csr_signieren(
        &self,
        csr_pem: &str,
        vorlage: &ZertVorlage,
        aussteller: &Aussteller,
    ) -> CryptoResult<String>;

    /// Liest ein Zertifikat ohne Pruefung
    fn zertifikat_lesen(&self, cert_pem: &str) -> CryptoResult<ZertInfo>;

    /// Prueft die Signatur eines Zertifikats gegen das Ausstellerzertifikat
    fn zertifikat_pruefen(&self, cert_pem: &str, aussteller_pem: &str) -> CryptoResult<ZertInfo>;

    /// Signiert Daten mit einem privaten Schluessel
    fn signieren(&self, key_pem: &str, daten: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Prueft eine Signatur mit rohen Public-Key-Bytes
    fn signatur_pruefen(
        &self,
        oeffentlicher_schluessel: &[u8],
        daten: &[u8],
        signatur: &[u8],
    ) -> CryptoResult<()>;
}

// ---------------------------------------------------------------------------
// RcgenPki
// ---------------------------------------------------------------------------

/// Standard-Backend: rcgen + x509-parser + ring (ECDSA P-256)
#[derive(Debug, Default, Clone, Copy)]
pub struct RcgenPki;

fn gen_fehler(e: impl std::fmt::Display) -> CryptoError {
    CryptoError::ZertifikatGenerierung(e.to_string())
}

fn zu_offset(zeit: DateTime<Utc>) -> CryptoResult<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(zeit.timestamp()).map_err(gen_fehler)
}

fn zu_chrono(sekunden: i64) -> CryptoResult<DateTime<Utc>> {
    Utc.timestamp_opt(sekunden, 0)
        .single()
        .ok_or_else(|| CryptoError::UngueltigeDaten(format!("Zeitstempel {sekunden}")))
}

fn pem_zu_der(pem: &str) -> CryptoResult<Vec<u8>> {
    let (_, block) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| CryptoError::UngueltigeDaten(format!("PEM ungueltig: {e}")))?;
    Ok(block.contents)
}

fn name_felder(name: &X509Name<'_>) -> (Option<String>, Option<String>) {
    let cn = name
        .iter_common_name()
        .next()
        .and_then(|a| a.as_str().ok())
        .map(str::to_string);
    let email = name
        .iter_email()
        .next()
        .and_then(|a| a.as_str().ok())
        .map(str::to_string);
    (cn, email)
}

fn zert_info(cert: &X509Certificate<'_>) -> CryptoResult<ZertInfo> {
    let (cn, email) = name_felder(cert.subject());
    let punkt: &[u8] = &cert.public_key().subject_public_key.data;
    Ok(ZertInfo {
        common_name: cn
            .ok_or_else(|| CryptoError::ZertifikatUngueltig("kein Common Name".into()))?,
        email,
        serial: hex::encode(cert.raw_serial()),
        gueltig_ab: zu_chrono(cert.validity().not_before.timestamp())?,
        gueltig_bis: zu_chrono(cert.validity().not_after.timestamp())?,
        oeffentlicher_schluessel: punkt.to_vec(),
    })
}

impl RcgenPki {
    fn params(vorlage: &ZertVorlage) -> CryptoResult<CertificateParams> {
        let sans = match &vorlage.art {
            ZertArt::Server { hostname } => vec![hostname.clone()],
            _ => Vec::new(),
        };
        let mut params = CertificateParams::new(sans).map_err(gen_fehler)?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, vorlage.common_name.as_str());
        if let Some(email) = &vorlage.email {
            dn.push(DnType::CustomDnType(OID_EMAIL.to_vec()), email.as_str());
        }
        params.distinguished_name = dn;
        params.not_before = zu_offset(vorlage.gueltig_ab)?;
        params.not_after = zu_offset(vorlage.gueltig_bis)?;
        params.serial_number = Some(SerialNumber::from(vorlage.serial.clone()));

        match &vorlage.art {
            ZertArt::Root => {
                params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
                params.key_usages = vec![
                    KeyUsagePurpose::KeyCertSign,
                    KeyUsagePurpose::CrlSign,
                    KeyUsagePurpose::DigitalSignature,
                ];
            }
            ZertArt::Issuing => {
                params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
                params.key_usages = vec![
                    KeyUsagePurpose::KeyCertSign,
                    KeyUsagePurpose::CrlSign,
                    KeyUsagePurpose::DigitalSignature,
                ];
            }
            ZertArt::Client => {
                params.is_ca = IsCa::ExplicitNoCa;
                params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
                params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
            }
            ZertArt::Server { .. } => {
                params.is_ca = IsCa::ExplicitNoCa;
                params.key_usages = vec![
                    KeyUsagePurpose::DigitalSignature,
                    KeyUsagePurpose::KeyEncipherment,
                ];
                params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
            }
        }
        Ok(params)
    }

    /// Baut das rcgen-Ausstellerobjekt aus PEM nach
    fn aussteller_laden(aussteller: &Aussteller) -> CryptoResult<(rcgen::Certificate, KeyPair)> {
        let key = KeyPair::from_pem(&aussteller.key_pem).map_err(gen_fehler)?;
        let params = CertificateParams::from_ca_cert_pem(&aussteller.cert_pem).map_err(gen_fehler)?;
        let cert = params.self_signed(&key).map_err(gen_fehler)?;
        Ok((cert, key))
    }
}

impl PkiBackend for RcgenPki {
    fn schluessel_erzeugen(&self) -> CryptoResult<String> {
        KeyPair::generate()
            .map(|k| k.serialize_pem())
            .map_err(|e| CryptoError::SchluesselGenerierung(e.to_string()))
    }

    fn oeffentlicher_schluessel(&self, key_pem: &str) -> CryptoResult<Vec<u8>> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| CryptoError::UngueltigeDaten(format!("Schluessel: {e}")))?;
        Ok(key.public_key_raw().to_vec())
    }

    fn csr_erstellen(
        &self,
        key_pem: &str,
        callsign: &str,
        email: Option<&str>,
    ) -> CryptoResult<String> {
        let key = KeyPair::from_pem(key_pem).map_err(gen_fehler)?;
        let mut params = CertificateParams::new(Vec::new()).map_err(gen_fehler)?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, callsign);
        if let Some(email) = email {
            dn.push(DnType::CustomDnType(OID_EMAIL.to_vec()), email);
        }
        params.distinguished_name = dn;
        params
            .serialize_request(&key)
            .and_then(|csr| csr.pem())
            .map_err(gen_fehler)
    }

    fn csr_pruefen(&self, csr_pem: &str) -> CryptoResult<CsrInfo> {
        let der = pem_zu_der(csr_pem).map_err(|e| CryptoError::UngueltigerCsr(e.to_string()))?;
        let (_, csr) = X509CertificationRequest::from_der(&der)
            .map_err(|e| CryptoError::UngueltigerCsr(e.to_string()))?;
        csr.verify_signature()
            .map_err(|e| CryptoError::UngueltigerCsr(format!("Signatur: {e}")))?;

        let info = &csr.certification_request_info;
        let (cn, email) = name_felder(&info.subject);
        let punkt: &[u8] = &info.subject_pki.subject_public_key.data;
        Ok(CsrInfo {
            common_name: cn.ok_or_else(|| CryptoError::UngueltigerCsr("kein Common Name".into()))?,
            email,
            oeffentlicher_schluessel: punkt.to_vec(),
        })
    }

    fn zertifikat_ausstellen(
        &self,
        key_pem: &str,
        vorlage: &ZertVorlage,
        aussteller: Option<&Aussteller>,
    ) -> CryptoResult<String> {
        let key = KeyPair::from_pem(key_pem).map_err(gen_fehler)?;
        let params = Self::params(vorlage)?;
        let cert = match aussteller {
            None => params.self_signed(&key).map_err(gen_fehler)?,
            Some(a) => {
                let (issuer, issuer_key) = Self::aussteller_laden(a)?;
                params
                    .signed_by(&key, &issuer, &issuer_key)
                    .map_err(gen_fehler)?
            }
        };
        Ok(cert.pem())
    }

    fn csr_signieren(
        &self,
        csr_pem: &str,
        vorlage: &ZertVorlage,
        aussteller: &Aussteller,
    ) -> CryptoResult<String> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| CryptoError::UngueltigerCsr(e.to_string()))?;
        csr.params = Self::params(vorlage)?;
        let (issuer, issuer_key) = Self::aussteller_laden(aussteller)?;
        csr.signed_by(&issuer, &issuer_key)
            .map(|c| c.pem())
            .map_err(gen_fehler)
    }

    fn zertifikat_lesen(&self, cert_pem: &str) -> CryptoResult<ZertInfo> {
        let der = pem_zu_der(cert_pem)?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| CryptoError::ZertifikatUngueltig(e.to_string()))?;
        zert_info(&cert)
    }

    fn zertifikat_pruefen(&self, cert_pem: &str, aussteller_pem: &str) -> CryptoResult<ZertInfo> {
        let der = pem_zu_der(cert_pem)?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| CryptoError::ZertifikatUngueltig(e.to_string()))?;
        let aussteller_der = pem_zu_der(aussteller_pem)?;
        let (_, aussteller) = X509Certificate::from_der(&aussteller_der)
            .map_err(|e| CryptoError::ZertifikatUngueltig(e.to_string()))?;

        if cert.issuer().as_raw() != aussteller.subject().as_raw() {
            return Err(CryptoError::ZertifikatUngueltig(
                "falscher Aussteller".into(),
            ));
        }
        cert.verify_signature(Some(aussteller.public_key()))
            .map_err(|e| CryptoError::ZertifikatUngueltig(format!("Signatur: {e}")))?;
        zert_info(&cert)
    }

    fn signieren(&self, key_pem: &str, daten: &[u8]) -> CryptoResult<Vec<u8>> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| CryptoError::Signierung(e.to_string()))?;
        let rng = SystemRandom::new();
        let ring_key =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &key.serialize_der(), &rng)
                .map_err(|e| CryptoError::Signierung(e.to_string()))?;
        ring_key
            .sign(&rng, daten)
            .map(|s| s.as_ref().to_vec())
            .map_err(|e| CryptoError::Signierung(e.to_string()))
    }

    fn signatur_pruefen(
        &self,
        oeffentlicher_schluessel: &[u8],
        daten: &[u8],
        signatur: &[u8],
    ) -> CryptoResult<()> {
        UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, oeffentlicher_schluessel)
            .verify(daten, signatur)
            .map_err(|_| CryptoError::SignaturVerifikation("ECDSA-Signatur ungueltig".into()))
    }
}

/// Berechnet den SHA-256 Fingerprint eines Public Keys (Hex)
pub fn schluessel_fingerprint(oeffentlicher_schluessel: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(oeffentlicher_schluessel))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
