//! Zertifizierungsstelle des Reflectors
//!
//! Zweistufige PKI:
//!
//! ```text
//! Root (Jahrzehnte) ──signiert──▶ Issuing (≈1 Jahr) ──signiert──▶ Client (Monate)
//!                                                   └─signiert──▶ TLS-Server
//! ```
//!
//! Der `CaManager` besitzt alle Schluessel exklusiv. Sessions erhalten nur
//! Kopien (PEM). Jede Ausstellung, Erneuerung und jeder Widerruf wird als
//! [`ZertEintrag`] protokolliert; Eintraege werden nie geloescht.
//!
//! Pro Rufzeichen gibt es hoechstens einen aktiven Eintrag, der entweder
//! `Ausstehend` (CSR wartet auf Freigabe) oder `Ausgestellt` ist.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use reflector_core::types::Callsign;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CryptoError, CryptoResult};
use crate::pki::{
    schluessel_fingerprint, Aussteller, PkiBackend, RcgenPki, ZertArt, ZertInfo, ZertVorlage,
};
use crate::richtlinie::Richtlinie;

const DATEI_ROOT_KEY: &str = "root.key";
const DATEI_ROOT_CERT: &str = "root.crt";
const DATEI_ISSUING_KEY: &str = "issuing.key";
const DATEI_ISSUING_CERT: &str = "issuing.crt";
const DATEI_EINTRAEGE: &str = "zertifikate.json";

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Parameter der Zertifizierungsstelle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    /// Ablage fuer Schluessel, Zertifikate und Eintraege (None = nur im Speicher)
    pub verzeichnis: Option<PathBuf>,
    pub root_cn: String,
    pub issuing_cn: String,
    /// Hostname im TLS-Serverzertifikat
    pub server_hostname: String,
    pub root_gueltigkeit_tage: i64,
    pub issuing_gueltigkeit_tage: i64,
    pub client_gueltigkeit_tage: i64,
    /// Erneuerung beginnt so viele Tage vor Ablauf
    pub erneuerung_vorlauf_tage: i64,
    /// `not_before` liegt so weit in der Vergangenheit
    pub uhr_toleranz_sek: i64,
    /// CSRs sofort signieren statt auf Freigabe zu warten
    pub auto_ausstellen: bool,
    pub max_ausstehende_csrs: usize,
    /// Wird vom Server aus der `[richtlinie]`-Sektion gesetzt
    #[serde(skip)]
    pub richtlinie: Richtlinie,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            verzeichnis: None,
            root_cn: "Reflector Root CA".to_string(),
            issuing_cn: "Reflector Issuing CA".to_string(),
            server_hostname: "localhost".to_string(),
            root_gueltigkeit_tage: 25 * 365,
            issuing_gueltigkeit_tage: 365,
            client_gueltigkeit_tage: 90,
            erneuerung_vorlauf_tage: 30,
            uhr_toleranz_sek: 300,
            auto_ausstellen: true,
            max_ausstehende_csrs: 64,
            richtlinie: Richtlinie::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Eintraege
// ---------------------------------------------------------------------------

/// Status eines Zertifikatseintrags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZertStatus {
    /// CSR wartet auf Freigabe
    Ausstehend,
    /// Aktives Zertifikat
    Ausgestellt,
    /// Durch Erneuerung oder neuen CSR abgeloest
    Ersetzt,
    /// Ausstehender CSR wurde durch einen neueren verdraengt
    Verworfen,
    Widerrufen,
}

/// Audit-Eintrag fuer ein Rufzeichen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZertEintrag {
    pub callsign: Callsign,
    pub status: ZertStatus,
    /// SHA-256 des Public Keys
    pub schluessel_fingerprint: String,
    pub email: Option<String>,
    pub csr_pem: String,
    pub serial: Option<String>,
    pub cert_pem: Option<String>,
    pub gueltig_ab: Option<DateTime<Utc>>,
    pub gueltig_bis: Option<DateTime<Utc>>,
    pub erstellt: DateTime<Utc>,
    pub geaendert: DateTime<Utc>,
}

/// Ergebnis einer CSR-Einreichung
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsrErgebnis {
    /// Zertifikat (PEM)
    Ausgestellt(String),
    /// Wartet auf Freigabe durch den Betreiber
    Ausstehend,
}

/// Zertifikatskette fuer Knoten
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaBundle {
    pub ca_pem: String,
    pub issuing_pem: String,
    /// SHA-256 ueber `ca_pem || issuing_pem` (Hex)
    pub digest: String,
    /// ECDSA-Signatur des Digests mit dem Root-Schluessel (Base64)
    pub signatur: String,
}

/// Ergebnis eines Erneuerungslaufs
#[derive(Debug, Default)]
pub struct Erneuerungen {
    /// Issuing-Zertifikat wurde erneuert, Bundle und TLS-Zertifikat sind neu
    pub issuing_erneuert: bool,
    /// Erneuerte Client-Zertifikate
    pub clients: Vec<(Callsign, String)>,
}

// ---------------------------------------------------------------------------
// CaManager
// ---------------------------------------------------------------------------

/// Miniatur-CA mit Root-, Issuing- und Client-Zertifikaten
pub struct CaManager {
    backend: Arc<dyn PkiBackend>,
    config: CaConfig,
    root: Aussteller,
    issuing: Aussteller,
    issuing_info: ZertInfo,
    server_cert_pem: String,
    server_key_pem: String,
    bundle: CaBundle,
    eintraege: Vec<ZertEintrag>,
    /// Index des aktiven (ausstehenden oder ausgestellten) Eintrags
    aktiv: HashMap<Callsign, usize>,
}

impl std::fmt::Debug for CaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaManager")
            .field("issuing_serial", &self.issuing_info.serial)
            .field("eintraege", &self.eintraege.len())
            .field("aktiv", &self.aktiv.len())
            .finish()
    }
}

fn zufalls_serial() -> Vec<u8> {
    let mut serial = vec![0u8; 16];
    OsRng.fill_bytes(&mut serial);
    // Positiv und ohne fuehrende Null
    serial[0] = (serial[0] & 0x7F).max(1);
    serial
}

impl CaManager {
    /// Laedt die CA aus dem Verzeichnis oder erzeugt eine neue (rcgen-Backend)
    pub fn neu(config: CaConfig, jetzt: DateTime<Utc>) -> CryptoResult<Self> {
        Self::mit_backend(config, Arc::new(RcgenPki), jetzt)
    }

    /// Wie [`CaManager::neu`], aber mit eigenem Backend
    pub fn mit_backend(
        config: CaConfig,
        backend: Arc<dyn PkiBackend>,
        jetzt: DateTime<Utc>,
    ) -> CryptoResult<Self> {
        let gespeichert = match &config.verzeichnis {
            Some(dir) if dir.join(DATEI_ROOT_CERT).exists() => Some(Self::dateien_laden(dir)?),
            _ => None,
        };

        let (root, issuing, eintraege) = match gespeichert {
            Some(g) => {
                tracing::info!(
                    verzeichnis = ?config.verzeichnis,
                    eintraege = g.2.len(),
                    "CA aus Verzeichnis geladen"
                );
                g
            }
            None => {
                let (root, issuing) = Self::hierarchie_erzeugen(backend.as_ref(), &config, jetzt)?;
                tracing::info!(root = %config.root_cn, issuing = %config.issuing_cn, "Neue CA erzeugt");
                (root, issuing, Vec::new())
            }
        };

        let issuing_info = backend.zertifikat_pruefen(&issuing.cert_pem, &root.cert_pem)?;
        let bundle = Self::bundle_berechnen(backend.as_ref(), &root, &issuing)?;
        let (server_cert_pem, server_key_pem) =
            Self::server_zertifikat(backend.as_ref(), &config, &issuing, jetzt, issuing_info.gueltig_bis)?;

        let mut aktiv = HashMap::new();
        for (idx, e) in eintraege.iter().enumerate() {
            if matches!(e.status, ZertStatus::Ausstehend | ZertStatus::Ausgestellt) {
                aktiv.insert(e.callsign.clone(), idx);
            }
        }

        let ca = Self {
            backend,
            config,
            root,
            issuing,
            issuing_info,
            server_cert_pem,
            server_key_pem,
            bundle,
            eintraege,
            aktiv,
        };
        ca.speichern()?;
        Ok(ca)
    }

    fn hierarchie_erzeugen(
        backend: &dyn PkiBackend,
        config: &CaConfig,
        jetzt: DateTime<Utc>,
    ) -> CryptoResult<(Aussteller, Aussteller)> {
        let root_key = backend.schluessel_erzeugen()?;
        let root_vorlage = ZertVorlage {
            common_name: config.root_cn.clone(),
            email: None,
            gueltig_ab: jetzt - Duration::seconds(config.uhr_toleranz_sek),
            gueltig_bis: jetzt + Duration::days(config.root_gueltigkeit_tage),
            serial: zufalls_serial(),
            art: ZertArt::Root,
        };
        let root = Aussteller {
            cert_pem: backend.zertifikat_ausstellen(&root_key, &root_vorlage, None)?,
            key_pem: root_key,
        };

        let issuing_key = backend.schluessel_erzeugen()?;
        let issuing_cert = Self::issuing_signieren(backend, config, &root, &issuing_key, jetzt)?;
        Ok((
            root,
            Aussteller {
                cert_pem: issuing_cert,
                key_pem: issuing_key,
            },
        ))
    }

    fn issuing_signieren(
        backend: &dyn PkiBackend,
        config: &CaConfig,
        root: &Aussteller,
        issuing_key: &str,
        jetzt: DateTime<Utc>,
    ) -> CryptoResult<String> {
        let vorlage = ZertVorlage {
            common_name: config.issuing_cn.clone(),
            email: None,
            gueltig_ab: jetzt - Duration::seconds(config.uhr_toleranz_sek),
            gueltig_bis: jetzt + Duration::days(config.issuing_gueltigkeit_tage),
            serial: zufalls_serial(),
            art: ZertArt::Issuing,
        };
        backend.zertifikat_ausstellen(issuing_key, &vorlage, Some(root))
    }

    fn server_zertifikat(
        backend: &dyn PkiBackend,
        config: &CaConfig,
        issuing: &Aussteller,
        jetzt: DateTime<Utc>,
        gueltig_bis: DateTime<Utc>,
    ) -> CryptoResult<(String, String)> {
        let key = backend.schluessel_erzeugen()?;
        let vorlage = ZertVorlage {
            common_name: config.server_hostname.clone(),
            email: None,
            gueltig_ab: jetzt - Duration::seconds(config.uhr_toleranz_sek),
            gueltig_bis,
            serial: zufalls_serial(),
            art: ZertArt::Server {
                hostname: config.server_hostname.clone(),
            },
        };
        let cert = backend.zertifikat_ausstellen(&key, &vorlage, Some(issuing))?;
        Ok((cert, key))
    }

    fn bundle_berechnen(
        backend: &dyn PkiBackend,
        root: &Aussteller,
        issuing: &Aussteller,
    ) -> CryptoResult<CaBundle> {
        let mut hasher = Sha256::new();
        hasher.update(root.cert_pem.as_bytes());
        hasher.update(issuing.cert_pem.as_bytes());
        let digest = hasher.finalize();
        let signatur = backend.signieren(&root.key_pem, &digest)?;
        Ok(CaBundle {
            ca_pem: root.cert_pem.clone(),
            issuing_pem: issuing.cert_pem.clone(),
            digest: hex::encode(digest),
            signatur: B64.encode(signatur),
        })
    }

    // -----------------------------------------------------------------------
    // Abfragen
    // -----------------------------------------------------------------------

    /// Aktuelle Zertifikatskette
    pub fn ca_bundle(&self) -> &CaBundle {
        &self.bundle
    }

    /// TLS-Kette (Server + Issuing) und Server-Schluessel als PEM
    ///
    /// Das Serverzertifikat laeuft zusammen mit dem Issuing-Zertifikat ab und
    /// wird mit ihm erneuert.
    pub fn server_tls(&self) -> (String, String) {
        (
            format!("{}{}", self.server_cert_pem, self.issuing.cert_pem),
            self.server_key_pem.clone(),
        )
    }

    /// Daten des aktiven Issuing-Zertifikats
    pub fn issuing_info(&self) -> &ZertInfo {
        &self.issuing_info
    }

    pub fn config(&self) -> &CaConfig {
        &self.config
    }

    pub fn richtlinie(&self) -> &Richtlinie {
        &self.config.richtlinie
    }

    /// Aktiver Eintrag eines Rufzeichens
    pub fn aktiver_eintrag(&self, callsign: &Callsign) -> Option<&ZertEintrag> {
        self.aktiv.get(callsign).map(|&i| &self.eintraege[i])
    }

    /// Letzter Eintrag eines Rufzeichens (auch widerrufen oder ersetzt)
    pub fn letzter_eintrag(&self, callsign: &Callsign) -> Option<&ZertEintrag> {
        self.eintraege.iter().rev().find(|e| &e.callsign == callsign)
    }

    /// Vollstaendiges Audit-Protokoll
    pub fn eintraege(&self) -> &[ZertEintrag] {
        &self.eintraege
    }

    pub fn ausstehende_anzahl(&self) -> usize {
        self.aktiv
            .values()
            .filter(|&&i| self.eintraege[i].status == ZertStatus::Ausstehend)
            .count()
    }

    /// Prueft eine Signatur mit rohen Public-Key-Bytes
    pub fn signatur_pruefen(
        &self,
        oeffentlicher_schluessel: &[u8],
        daten: &[u8],
        signatur: &[u8],
    ) -> CryptoResult<()> {
        self.backend
            .signatur_pruefen(oeffentlicher_schluessel, daten, signatur)
    }

    /// Prueft Rufzeichen und optionale E-Mail gegen die Richtlinie
    pub fn richtlinie_pruefen(&self, callsign: &Callsign, email: Option<&str>) -> CryptoResult<()> {
        let r = &self.config.richtlinie;
        if !r.callsign_erlaubt(callsign.as_str()) {
            return Err(CryptoError::Richtlinie(format!(
                "Rufzeichen {callsign} nicht erlaubt"
            )));
        }
        if let Some(email) = email {
            if !r.email_erlaubt(email) {
                return Err(CryptoError::Richtlinie(format!(
                    "E-Mail-Domain von {email} nicht erlaubt"
                )));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Ausstellung
    // -----------------------------------------------------------------------

    /// Verarbeitet einen CSR fuer `callsign`
    ///
    /// Ist bereits ein gueltiges Zertifikat fuer denselben Schluessel aktiv,
    /// wird es zurueckgegeben (bzw. bei faelliger Erneuerung neu signiert).
    /// Ein anderer Schluessel fuer ein aktives Rufzeichen wird abgelehnt.
    pub fn csr_einreichen(
        &mut self,
        callsign: &Callsign,
        csr_pem: &str,
        jetzt: DateTime<Utc>,
    ) -> CryptoResult<CsrErgebnis> {
        let info = self.backend.csr_pruefen(csr_pem)?;
        let cn = Callsign::neu(&info.common_name)
            .map_err(|e| CryptoError::UngueltigerCsr(e.to_string()))?;
        if &cn != callsign {
            return Err(CryptoError::Richtlinie(format!(
                "CSR-Subjekt {cn} passt nicht zu {callsign}"
            )));
        }
        self.richtlinie_pruefen(callsign, info.email.as_deref())?;
        let fp = schluessel_fingerprint(&info.oeffentlicher_schluessel);

        if let Some(&idx) = self.aktiv.get(callsign) {
            let eintrag = &self.eintraege[idx];
            match eintrag.status {
                ZertStatus::Ausgestellt => {
                    let abgelaufen = eintrag.gueltig_bis.map_or(true, |bis| bis <= jetzt);
                    if eintrag.schluessel_fingerprint != fp && !abgelaufen {
                        tracing::warn!(callsign = %callsign, "CSR mit fremdem Schluessel abgelehnt");
                        return Err(CryptoError::SchluesselKonflikt(callsign.to_string()));
                    }
                    if eintrag.schluessel_fingerprint == fp && !self.erneuerung_faellig(eintrag.gueltig_bis, jetzt) {
                        if let Some(pem) = &eintrag.cert_pem {
                            return Ok(CsrErgebnis::Ausgestellt(pem.clone()));
                        }
                    }
                    // Gleicher Schluessel mit faelliger Erneuerung oder abgelaufenes Zertifikat
                    self.status_setzen(idx, ZertStatus::Ersetzt, jetzt);
                }
                ZertStatus::Ausstehend => {
                    self.status_setzen(idx, ZertStatus::Verworfen, jetzt);
                    let eintrag = self.eintrag_neu(callsign, &fp, info.email, csr_pem, jetzt);
                    self.eintrag_aufnehmen(eintrag);
                    self.speichern_protokolliert();
                    tracing::info!(callsign = %callsign, "Ausstehender CSR ersetzt");
                    return Ok(CsrErgebnis::Ausstehend);
                }
                _ => {}
            }
        }

        let gesperrt = self
            .letzter_eintrag(callsign)
            .is_some_and(|e| e.status == ZertStatus::Widerrufen);
        if !self.config.auto_ausstellen || gesperrt {
            let ausstehend = self.ausstehende_anzahl();
            if ausstehend >= self.config.max_ausstehende_csrs {
                return Err(CryptoError::ZuVieleAusstehend(ausstehend));
            }
            let eintrag = self.eintrag_neu(callsign, &fp, info.email, csr_pem, jetzt);
            self.eintrag_aufnehmen(eintrag);
            self.speichern_protokolliert();
            tracing::info!(callsign = %callsign, widerrufen = gesperrt, "CSR wartet auf Freigabe");
            return Ok(CsrErgebnis::Ausstehend);
        }

        let mut eintrag = self.eintrag_neu(callsign, &fp, info.email, csr_pem, jetzt);
        self.signieren_in(&mut eintrag, jetzt)?;
        let pem = eintrag.cert_pem.clone().unwrap_or_default();
        self.eintrag_aufnehmen(eintrag);
        self.speichern_protokolliert();
        Ok(CsrErgebnis::Ausgestellt(pem))
    }

    /// Erzeugt Schluessel und CSR fuer einen Knoten und reicht den CSR ein
    ///
    /// Gibt den privaten Schluessel (PEM) und das Ergebnis zurueck.
    pub fn schluessel_generieren(
        &mut self,
        callsign: &Callsign,
        email: Option<&str>,
        jetzt: DateTime<Utc>,
    ) -> CryptoResult<(String, CsrErgebnis)> {
        self.richtlinie_pruefen(callsign, email)?;
        let key_pem = self.backend.schluessel_erzeugen()?;
        let csr = self
            .backend
            .csr_erstellen(&key_pem, callsign.as_str(), email)?;
        let ergebnis = self.csr_einreichen(callsign, &csr, jetzt)?;
        Ok((key_pem, ergebnis))
    }

    /// Gibt einen ausstehenden CSR frei und stellt das Zertifikat aus
    pub fn csr_genehmigen(&mut self, callsign: &Callsign, jetzt: DateTime<Utc>) -> CryptoResult<String> {
        let idx = *self
            .aktiv
            .get(callsign)
            .filter(|&&i| self.eintraege[i].status == ZertStatus::Ausstehend)
            .ok_or_else(|| CryptoError::NichtGefunden(format!("ausstehender CSR fuer {callsign}")))?;

        let mut eintrag = self.eintraege[idx].clone();
        self.signieren_in(&mut eintrag, jetzt)?;
        let pem = eintrag.cert_pem.clone().unwrap_or_default();
        self.eintraege[idx] = eintrag;
        self.speichern_protokolliert();
        tracing::info!(callsign = %callsign, "CSR freigegeben");
        Ok(pem)
    }

    fn eintrag_neu(
        &self,
        callsign: &Callsign,
        fingerprint: &str,
        email: Option<String>,
        csr_pem: &str,
        jetzt: DateTime<Utc>,
    ) -> ZertEintrag {
        ZertEintrag {
            callsign: callsign.clone(),
            status: ZertStatus::Ausstehend,
            schluessel_fingerprint: fingerprint.to_string(),
            email,
            csr_pem: csr_pem.to_string(),
            serial: None,
            cert_pem: None,
            gueltig_ab: None,
            gueltig_bis: None,
            erstellt: jetzt,
            geaendert: jetzt,
        }
    }

    fn eintrag_aufnehmen(&mut self, eintrag: ZertEintrag) {
        let callsign = eintrag.callsign.clone();
        self.eintraege.push(eintrag);
        self.aktiv.insert(callsign, self.eintraege.len() - 1);
    }

    fn status_setzen(&mut self, idx: usize, status: ZertStatus, jetzt: DateTime<Utc>) {
        let e = &mut self.eintraege[idx];
        e.status = status;
        e.geaendert = jetzt;
        if !matches!(status, ZertStatus::Ausstehend | ZertStatus::Ausgestellt) {
            self.aktiv.remove(&e.callsign);
        }
    }

    /// Signiert den CSR eines Eintrags und setzt ihn auf `Ausgestellt`
    fn signieren_in(&self, eintrag: &mut ZertEintrag, jetzt: DateTime<Utc>) -> CryptoResult<()> {
        let vorlage = ZertVorlage {
            common_name: eintrag.callsign.to_string(),
            email: eintrag.email.clone(),
            gueltig_ab: jetzt - Duration::seconds(self.config.uhr_toleranz_sek),
            gueltig_bis: jetzt + Duration::days(self.config.client_gueltigkeit_tage),
            serial: zufalls_serial(),
            art: ZertArt::Client,
        };
        let pem = self
            .backend
            .csr_signieren(&eintrag.csr_pem, &vorlage, &self.issuing)?;
        let info = self.backend.zertifikat_lesen(&pem)?;

        eintrag.status = ZertStatus::Ausgestellt;
        eintrag.serial = Some(info.serial.clone());
        eintrag.cert_pem = Some(pem);
        eintrag.gueltig_ab = Some(info.gueltig_ab);
        eintrag.gueltig_bis = Some(info.gueltig_bis);
        eintrag.geaendert = jetzt;
        tracing::info!(
            callsign = %eintrag.callsign,
            serial = %info.serial,
            gueltig_bis = %info.gueltig_bis,
            "Client-Zertifikat ausgestellt"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pruefung
    // -----------------------------------------------------------------------

    /// Prueft ein vorgelegtes Client-Zertifikat
    ///
    /// Es muss von der aktiven Issuing-CA stammen, auf `callsign` lauten,
    /// zeitlich gueltig und das aktive Zertifikat dieses Rufzeichens sein.
    pub fn zertifikat_pruefen(
        &self,
        callsign: &Callsign,
        cert_pem: &str,
        jetzt: DateTime<Utc>,
    ) -> CryptoResult<ZertInfo> {
        let info = self
            .backend
            .zertifikat_pruefen(cert_pem, &self.issuing.cert_pem)?;

        if info.common_name.to_ascii_uppercase() != callsign.as_str() {
            return Err(CryptoError::ZertifikatUngueltig(format!(
                "Subjekt {} passt nicht zu {callsign}",
                info.common_name
            )));
        }
        if jetzt < info.gueltig_ab || jetzt > info.gueltig_bis {
            return Err(CryptoError::ZertifikatUngueltig(
                "ausserhalb des Gueltigkeitszeitraums".into(),
            ));
        }

        let eintrag = self
            .eintraege
            .iter()
            .rev()
            .find(|e| e.serial.as_deref() == Some(info.serial.as_str()))
            .ok_or_else(|| CryptoError::ZertifikatUngueltig("unbekannte Seriennummer".into()))?;
        match eintrag.status {
            ZertStatus::Ausgestellt => Ok(info),
            ZertStatus::Widerrufen => Err(CryptoError::Widerrufen(callsign.to_string())),
            _ => Err(CryptoError::ZertifikatUngueltig("Zertifikat abgeloest".into())),
        }
    }

    fn erneuerung_faellig(&self, gueltig_bis: Option<DateTime<Utc>>, jetzt: DateTime<Utc>) -> bool {
        gueltig_bis.map_or(true, |bis| {
            bis - jetzt < Duration::days(self.config.erneuerung_vorlauf_tage)
        })
    }

    /// Gibt true zurueck wenn das Zertifikat innerhalb des Vorlaufs ablaeuft
    pub fn erneuerung_noetig(&self, info: &ZertInfo, jetzt: DateTime<Utc>) -> bool {
        self.erneuerung_faellig(Some(info.gueltig_bis), jetzt)
    }

    // -----------------------------------------------------------------------
    // Erneuerung & Widerruf
    // -----------------------------------------------------------------------

    /// Signiert den gespeicherten CSR eines aktiven Zertifikats neu
    pub fn client_erneuern(&mut self, callsign: &Callsign, jetzt: DateTime<Utc>) -> CryptoResult<String> {
        let idx = *self
            .aktiv
            .get(callsign)
            .filter(|&&i| self.eintraege[i].status == ZertStatus::Ausgestellt)
            .ok_or_else(|| CryptoError::NichtGefunden(format!("aktives Zertifikat fuer {callsign}")))?;

        let mut neu = self.eintraege[idx].clone();
        neu.erstellt = jetzt;
        self.signieren_in(&mut neu, jetzt)?;
        let pem = neu.cert_pem.clone().unwrap_or_default();

        self.status_setzen(idx, ZertStatus::Ersetzt, jetzt);
        self.eintrag_aufnehmen(neu);
        self.speichern_protokolliert();
        Ok(pem)
    }

    /// Erneuert das Issuing-Zertifikat mit demselben Schluessel
    ///
    /// Bereits ausgestellte Client-Zertifikate bleiben gueltig, da Subjekt
    /// und Schluessel des Ausstellers unveraendert sind.
    pub fn issuing_erneuern(&mut self, jetzt: DateTime<Utc>) -> CryptoResult<()> {
        let cert = Self::issuing_signieren(
            self.backend.as_ref(),
            &self.config,
            &self.root,
            &self.issuing.key_pem,
            jetzt,
        )?;
        let info = self.backend.zertifikat_pruefen(&cert, &self.root.cert_pem)?;
        let issuing = Aussteller {
            cert_pem: cert,
            key_pem: self.issuing.key_pem.clone(),
        };
        let bundle = Self::bundle_berechnen(self.backend.as_ref(), &self.root, &issuing)?;
        let (server_cert, server_key) =
            Self::server_zertifikat(self.backend.as_ref(), &self.config, &issuing, jetzt, info.gueltig_bis)?;

        self.issuing = issuing;
        self.issuing_info = info;
        self.bundle = bundle;
        self.server_cert_pem = server_cert;
        self.server_key_pem = server_key;
        tracing::info!(
            serial = %self.issuing_info.serial,
            gueltig_bis = %self.issuing_info.gueltig_bis,
            "Issuing-Zertifikat erneuert"
        );
        self.speichern()
    }

    /// Erneuert alle Zertifikate, deren Ablauf in den Vorlauf faellt
    pub fn erneuerungen_pruefen(&mut self, jetzt: DateTime<Utc>) -> CryptoResult<Erneuerungen> {
        let mut ergebnis = Erneuerungen::default();

        if self.erneuerung_faellig(Some(self.issuing_info.gueltig_bis), jetzt) {
            self.issuing_erneuern(jetzt)?;
            ergebnis.issuing_erneuert = true;
        }

        let faellig: Vec<Callsign> = self
            .aktiv
            .iter()
            .filter(|(_, i)| {
                let e = &self.eintraege[**i];
                e.status == ZertStatus::Ausgestellt && self.erneuerung_faellig(e.gueltig_bis, jetzt)
            })
            .map(|(c, _)| c.clone())
            .collect();

        for callsign in faellig {
            match self.client_erneuern(&callsign, jetzt) {
                Ok(pem) => ergebnis.clients.push((callsign, pem)),
                Err(e) => {
                    tracing::warn!(callsign = %callsign, fehler = %e, "Erneuerung fehlgeschlagen")
                }
            }
        }
        Ok(ergebnis)
    }

    /// Widerruft das aktive Zertifikat (oder den ausstehenden CSR)
    pub fn widerrufen(&mut self, callsign: &Callsign, jetzt: DateTime<Utc>) -> CryptoResult<()> {
        let idx = *self
            .aktiv
            .get(callsign)
            .ok_or_else(|| CryptoError::NichtGefunden(callsign.to_string()))?;
        self.status_setzen(idx, ZertStatus::Widerrufen, jetzt);
        self.speichern_protokolliert();
        tracing::warn!(callsign = %callsign, "Zertifikat widerrufen");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Persistenz
    // -----------------------------------------------------------------------

    fn dateien_laden(dir: &Path) -> CryptoResult<(Aussteller, Aussteller, Vec<ZertEintrag>)> {
        let lesen = |name: &str| std::fs::read_to_string(dir.join(name));
        let root = Aussteller {
            cert_pem: lesen(DATEI_ROOT_CERT)?,
            key_pem: lesen(DATEI_ROOT_KEY)?,
        };
        let issuing = Aussteller {
            cert_pem: lesen(DATEI_ISSUING_CERT)?,
            key_pem: lesen(DATEI_ISSUING_KEY)?,
        };
        let eintraege = match lesen(DATEI_EINTRAEGE) {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| CryptoError::Persistenz(format!("{DATEI_EINTRAEGE}: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok((root, issuing, eintraege))
    }

    /// Schreibt Schluessel, Zertifikate und Eintraege ins Verzeichnis
    pub fn speichern(&self) -> CryptoResult<()> {
        let Some(dir) = &self.config.verzeichnis else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;
        schluessel_schreiben(&dir.join(DATEI_ROOT_KEY), &self.root.key_pem)?;
        std::fs::write(dir.join(DATEI_ROOT_CERT), &self.root.cert_pem)?;
        schluessel_schreiben(&dir.join(DATEI_ISSUING_KEY), &self.issuing.key_pem)?;
        std::fs::write(dir.join(DATEI_ISSUING_CERT), &self.issuing.cert_pem)?;
        let json = serde_json::to_string_pretty(&self.eintraege)
            .map_err(|e| CryptoError::Persistenz(e.to_string()))?;
        std::fs::write(dir.join(DATEI_EINTRAEGE), json)?;
        Ok(())
    }

    fn speichern_protokolliert(&self) {
        if let Err(e) = self.speichern() {
            tracing::error!(fehler = %e, "CA-Zustand konnte nicht gespeichert werden");
        }
    }
}

/// Schreibt einen privaten Schluessel nur fuer den Eigentuemer lesbar (0600)
fn schluessel_schreiben(pfad: &Path, pem: &str) -> std::io::Result<()> {
    use std::io::Write;

    let mut optionen = std::fs::OpenOptions::new();
    optionen.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
        optionen.mode(0o600);
        // mode() greift nur beim Anlegen; vorhandene Dateien nachziehen
        if pfad.exists() {
            std::fs::set_permissions(pfad, std::fs::Permissions::from_mode(0o600))?;
        }
    }
    let mut datei = optionen.open(pfad)?;
    datei.write_all(pem.as_bytes())?;
    datei.sync_all()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
