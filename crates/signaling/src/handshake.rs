//! Verbindungs-State-Machine
//!
//! Eine [`ClientSession`] pro TCP-Verbindung. Die Session ist frei von I/O:
//! sie bekommt dekodierte Nachrichten und liefert einen [`Schritt`] mit den
//! Antworten und der Folge fuer die Verbindung (weiter, TLS starten,
//! trennen).
//!
//! ## Zustaende
//! ```text
//! Getrennt -> ErwarteProtoVersion -> ErwarteStartVerschluesselung
//!          -> ErwarteSicherenKanal -> ErwarteCsr -> ErwarteAuthAntwort
//!          -> Verbunden
//!
//! jeder Zustand -> ErwarteTrennung -> Getrennt
//! ```
//!
//! Authentifizierungsfehler werden dem Knoten nur als generisches
//! "Zugriff verweigert" gemeldet; die Details stehen im Log.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use reflector_core::event::ReflectorEvent;
use reflector_core::types::{Callsign, SessionId};
use reflector_crypto::{CryptoError, CsrErgebnis};
use reflector_protocol::control::{
    ControlMessage, ControlPayload, ErrorCode, ProtoVersion, AKTUELLE_VERSION,
};
use reflector_voice::{NeueSession, RoutingFehler};
use tokio::sync::mpsc;

use crate::dispatcher::{ca_bundle_nachricht, MessageDispatcher};
use crate::error::{SignalingError, SignalingResult};
use crate::server_state::SignalingState;

/// Laenge der Auth-Challenge in Bytes
pub const CHALLENGE_LAENGE: usize = 32;

/// Einzige Begruendung die ein abgewiesener Knoten erfaehrt
pub const ZUGRIFF_VERWEIGERT: &str = "Zugriff verweigert";

// ---------------------------------------------------------------------------
// Typen
// ---------------------------------------------------------------------------

/// Zustand der Verbindungs-State-Machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionZustand {
    Getrennt,
    ErwarteProtoVersion,
    ErwarteStartVerschluesselung,
    /// TLS-Handshake laeuft
    ErwarteSicherenKanal,
    /// Zertifikat, CSR oder Schluesselanforderung erwartet
    ErwarteCsr,
    ErwarteAuthAntwort,
    Verbunden,
    /// Fehler gemeldet, Gegenseite soll schliessen
    ErwarteTrennung,
}

/// Was die Verbindung nach einem Schritt tun soll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Folge {
    Weiter,
    /// Antworten senden, dann TLS auf demselben Socket aushandeln
    TlsStarten,
    /// Antworten senden, dann Trennungs-Timer starten
    Trennen,
    /// Verbindung sofort schliessen
    Schliessen,
}

/// Ergebnis der Verarbeitung einer Nachricht
#[derive(Debug)]
pub struct Schritt {
    pub antworten: Vec<ControlMessage>,
    pub folge: Folge,
}

impl Schritt {
    fn weiter(antworten: Vec<ControlMessage>) -> Self {
        Self {
            antworten,
            folge: Folge::Weiter,
        }
    }

    fn leer() -> Self {
        Self::weiter(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// ClientSession
// ---------------------------------------------------------------------------

/// Protokollzustand einer Verbindung
pub struct ClientSession {
    state: Arc<SignalingState>,
    dispatcher: MessageDispatcher,
    peer: SocketAddr,
    zustand: SessionZustand,
    version: Option<ProtoVersion>,
    callsign: Option<Callsign>,
    oeffentlicher_schluessel: Option<Vec<u8>>,
    challenge: Option<Vec<u8>>,
    /// Erneuertes Zertifikat, wird nach `auth_ok` gesendet
    erneuertes_zertifikat: Option<String>,
    session_id: Option<SessionId>,
    /// Wandert bei der Registrierung in die Registry
    tx: Option<mpsc::Sender<ControlMessage>>,
}

impl ClientSession {
    /// Neue Session nach TCP-Accept
    pub fn neu(state: Arc<SignalingState>, peer: SocketAddr, tx: mpsc::Sender<ControlMessage>) -> Self {
        Self {
            dispatcher: MessageDispatcher::neu(Arc::clone(&state)),
            state,
            peer,
            zustand: SessionZustand::ErwarteProtoVersion,
            version: None,
            callsign: None,
            oeffentlicher_schluessel: None,
            challenge: None,
            erneuertes_zertifikat: None,
            session_id: None,
            tx: Some(tx),
        }
    }

    pub fn zustand(&self) -> SessionZustand {
        self.zustand
    }

    pub fn ist_verbunden(&self) -> bool {
        self.zustand == SessionZustand::Verbunden
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn callsign(&self) -> Option<&Callsign> {
        self.callsign.as_ref()
    }

    /// Verarbeitet eine eingehende Nachricht
    pub fn verarbeiten(&mut self, msg: ControlMessage, jetzt: Instant) -> Schritt {
        let request_id = msg.request_id;

        // Heartbeats sind in jedem Zustand erlaubt; die Verbindung zaehlt sie
        if matches!(msg.payload, ControlPayload::Heartbeat) {
            return Schritt::leer();
        }
        if matches!(
            self.zustand,
            SessionZustand::ErwarteTrennung | SessionZustand::Getrennt
        ) {
            tracing::trace!(peer = %self.peer, typ = msg.payload.name(), "Nachricht nach Trennung ignoriert");
            return Schritt::leer();
        }
        if matches!(msg.payload, ControlPayload::Disconnect) {
            tracing::info!(peer = %self.peer, callsign = ?self.callsign, "Knoten meldet sich ab");
            self.zustand = SessionZustand::ErwarteTrennung;
            return Schritt {
                antworten: Vec::new(),
                folge: Folge::Schliessen,
            };
        }

        let ergebnis = match self.zustand {
            SessionZustand::ErwarteProtoVersion => self.proto_version(request_id, msg.payload),
            SessionZustand::ErwarteStartVerschluesselung => {
                self.start_verschluesselung(request_id, msg.payload)
            }
            SessionZustand::ErwarteSicherenKanal => Err(SignalingError::protokoll(
                "Nachricht waehrend des TLS-Aufbaus",
            )),
            SessionZustand::ErwarteCsr => self.zertifikat(request_id, msg.payload),
            SessionZustand::ErwarteAuthAntwort => self.auth_antwort(request_id, msg.payload, jetzt),
            SessionZustand::Verbunden => match self.session_id {
                Some(id) => self
                    .dispatcher
                    .dispatch(msg, id, jetzt)
                    .map(|a| Schritt::weiter(a.into_iter().collect())),
                None => Err(SignalingError::protokoll("Verbunden ohne Session-ID")),
            },
            SessionZustand::ErwarteTrennung | SessionZustand::Getrennt => Ok(Schritt::leer()),
        };

        ergebnis.unwrap_or_else(|e| self.fehler_behandeln(request_id, e))
    }

    /// Der TLS-Handshake ist abgeschlossen
    pub fn tls_aktiv(&mut self) -> SignalingResult<Vec<ControlMessage>> {
        if self.zustand != SessionZustand::ErwarteSicherenKanal {
            return Err(SignalingError::protokoll("TLS ohne start_encryption"));
        }
        self.zustand = SessionZustand::ErwarteCsr;
        tracing::debug!(peer = %self.peer, "Sicherer Kanal aufgebaut");
        Ok(vec![ControlMessage::push(ControlPayload::CertRequired)])
    }

    /// Beendet die Session und entfernt sie atomar aus Registry und Router
    pub fn beenden(&mut self, grund: &str) {
        if let Some(id) = self.session_id.take() {
            self.state.kern.entfernen(id, grund);
        }
        self.zustand = SessionZustand::Getrennt;
    }

    /// Versetzt die Session in `ErwarteTrennung` und meldet den Fehler
    pub fn fehler_behandeln(&mut self, request_id: u32, fehler: SignalingError) -> Schritt {
        let (code, text) = match &fehler {
            SignalingError::Protokoll(_) | SignalingError::Eingabe(_) => {
                tracing::warn!(peer = %self.peer, zustand = ?self.zustand, fehler = %fehler, "Protokollverletzung");
                (ErrorCode::ProtocolViolation, fehler.to_string())
            }
            SignalingError::Krypto(CryptoError::ZuVieleAusstehend(n)) => {
                tracing::warn!(peer = %self.peer, ausstehend = n, "CSR abgelehnt, zu viele ausstehend");
                (ErrorCode::ServerBusy, "Zu viele ausstehende Anfragen".to_string())
            }
            SignalingError::Krypto(e) if e.ist_auth_fehler() => {
                tracing::warn!(peer = %self.peer, callsign = ?self.callsign, fehler = %e, "Authentifizierung fehlgeschlagen");
                (ErrorCode::AccessDenied, ZUGRIFF_VERWEIGERT.to_string())
            }
            SignalingError::Routing(RoutingFehler::RufzeichenBelegt(cs)) => {
                tracing::warn!(peer = %self.peer, callsign = %cs, "Rufzeichen bereits verbunden");
                (ErrorCode::AccessDenied, ZUGRIFF_VERWEIGERT.to_string())
            }
            SignalingError::Routing(RoutingFehler::RegistryVoll(max)) => {
                tracing::warn!(peer = %self.peer, max, "Registry voll");
                (ErrorCode::ServerBusy, "Server ist voll".to_string())
            }
            _ => {
                tracing::error!(peer = %self.peer, fehler = %fehler, "Interner Fehler in der Session");
                (ErrorCode::InternalError, "Interner Fehler".to_string())
            }
        };
        self.zustand = SessionZustand::ErwarteTrennung;
        // Bis zum Schliessen weder Rederecht noch Audio noch Broadcasts
        if let Some(id) = self.session_id.take() {
            self.state.kern.entfernen(id, "Protokollfehler");
        }
        Schritt {
            antworten: vec![ControlMessage::error(request_id, code, text)],
            folge: Folge::Trennen,
        }
    }

    // -----------------------------------------------------------------------
    // Zustaende
    // -----------------------------------------------------------------------

    fn proto_version(&mut self, request_id: u32, payload: ControlPayload) -> SignalingResult<Schritt> {
        let version = match payload {
            ControlPayload::ProtoVer { major, minor } => ProtoVersion::neu(major, minor),
            andere => {
                return Err(SignalingError::protokoll(format!(
                    "proto_ver erwartet, '{}' erhalten",
                    andere.name()
                )))
            }
        };

        let minimum = self.state.config.min_version;
        if version < minimum {
            tracing::warn!(peer = %self.peer, %version, %minimum, "Protokollversion zu alt");
            self.zustand = SessionZustand::ErwarteTrennung;
            return Ok(Schritt {
                antworten: vec![ControlMessage::error(
                    request_id,
                    ErrorCode::UnsupportedVersion,
                    format!("Protokollversion {version} nicht unterstuetzt, mindestens {minimum}"),
                )],
                folge: Folge::Trennen,
            });
        }

        tracing::debug!(peer = %self.peer, %version, "Protokollversion akzeptiert");
        self.version = Some(version);
        self.zustand = SessionZustand::ErwarteStartVerschluesselung;
        Ok(Schritt::weiter(vec![ControlMessage::new(
            request_id,
            ControlPayload::ProtoVerAck {
                major: AKTUELLE_VERSION.major,
                minor: AKTUELLE_VERSION.minor,
            },
        )]))
    }

    fn start_verschluesselung(&mut self, request_id: u32, payload: ControlPayload) -> SignalingResult<Schritt> {
        match payload {
            ControlPayload::CaBundleRequest => Ok(Schritt::weiter(vec![ca_bundle_nachricht(
                &self.state.ca.lock(),
                request_id,
            )])),
            ControlPayload::StartEncryptionRequest => {
                self.zustand = SessionZustand::ErwarteSicherenKanal;
                Ok(Schritt {
                    antworten: vec![ControlMessage::new(request_id, ControlPayload::StartEncryption)],
                    folge: Folge::TlsStarten,
                })
            }
            andere => Err(SignalingError::protokoll(format!(
                "start_encryption_request erwartet, '{}' erhalten",
                andere.name()
            ))),
        }
    }

    fn zertifikat(&mut self, request_id: u32, payload: ControlPayload) -> SignalingResult<Schritt> {
        match payload {
            ControlPayload::CaBundleRequest => Ok(Schritt::weiter(vec![ca_bundle_nachricht(
                &self.state.ca.lock(),
                request_id,
            )])),

            ControlPayload::ClientCert { callsign, cert_pem } => {
                let callsign = Callsign::neu(&callsign)?;
                let jetzt = Utc::now();
                let mut ca = self.state.ca.lock();
                let info = ca.zertifikat_pruefen(&callsign, &cert_pem, jetzt)?;

                if ca.erneuerung_noetig(&info, jetzt) {
                    match ca.client_erneuern(&callsign, jetzt) {
                        Ok(pem) => {
                            let serial = ca
                                .aktiver_eintrag(&callsign)
                                .and_then(|e| e.serial.clone())
                                .unwrap_or_default();
                            self.state.events().senden(ReflectorEvent::ZertifikatErneuert {
                                subjekt: callsign.to_string(),
                                serial,
                            });
                            self.erneuertes_zertifikat = Some(pem);
                        }
                        Err(e) => {
                            tracing::warn!(callsign = %callsign, fehler = %e, "Erneuerung beim Handshake fehlgeschlagen");
                        }
                    }
                }
                drop(ca);
                Ok(self.challenge_senden(request_id, callsign, info.oeffentlicher_schluessel))
            }

            ControlPayload::ClientCsr { callsign, csr_pem } => {
                let callsign = Callsign::neu(&callsign)?;
                let ergebnis = self
                    .state
                    .ca
                    .lock()
                    .csr_einreichen(&callsign, &csr_pem, Utc::now())?;
                self.ausgestellt(request_id, callsign, ergebnis, None)
            }

            ControlPayload::KeyGenRequest { callsign, email } => {
                let callsign = Callsign::neu(&callsign)?;
                let mut ca = self.state.ca.lock();
                if !ca.config().auto_ausstellen {
                    return Err(CryptoError::Richtlinie(
                        "Schluesselerzeugung nur mit automatischer Ausstellung".into(),
                    )
                    .into());
                }
                let (key_pem, ergebnis) =
                    ca.schluessel_generieren(&callsign, email.as_deref(), Utc::now())?;
                drop(ca);
                self.ausgestellt(request_id, callsign, ergebnis, Some(key_pem))
            }

            andere => Err(SignalingError::protokoll(format!(
                "Zertifikat oder CSR erwartet, '{}' erhalten",
                andere.name()
            ))),
        }
    }

    fn ausgestellt(
        &mut self,
        request_id: u32,
        callsign: Callsign,
        ergebnis: CsrErgebnis,
        key_pem: Option<String>,
    ) -> SignalingResult<Schritt> {
        let cert_pem = match ergebnis {
            CsrErgebnis::Ausgestellt(pem) => pem,
            CsrErgebnis::Ausstehend => {
                tracing::info!(peer = %self.peer, callsign = %callsign, "Zertifikat ausstehend, Knoten wird getrennt");
                self.zustand = SessionZustand::ErwarteTrennung;
                return Ok(Schritt {
                    antworten: vec![ControlMessage::error(
                        request_id,
                        ErrorCode::CertificatePending,
                        "Zertifikat ausstehend",
                    )],
                    folge: Folge::Trennen,
                });
            }
        };

        let info = self
            .state
            .ca
            .lock()
            .zertifikat_pruefen(&callsign, &cert_pem, Utc::now())?;
        self.state.events().senden(ReflectorEvent::ZertifikatAusgestellt {
            callsign: callsign.clone(),
            serial: info.serial,
        });

        let mut schritt = self.challenge_senden(request_id, callsign, info.oeffentlicher_schluessel);
        schritt.antworten.insert(
            0,
            ControlMessage::new(request_id, ControlPayload::ClientCertificate { cert_pem, key_pem }),
        );
        Ok(schritt)
    }

    fn challenge_senden(&mut self, request_id: u32, callsign: Callsign, schluessel: Vec<u8>) -> Schritt {
        let mut challenge = vec![0u8; CHALLENGE_LAENGE];
        OsRng.fill_bytes(&mut challenge);
        let kodiert = BASE64.encode(&challenge);

        tracing::debug!(peer = %self.peer, callsign = %callsign, "Challenge gesendet");
        self.challenge = Some(challenge);
        self.callsign = Some(callsign);
        self.oeffentlicher_schluessel = Some(schluessel);
        self.zustand = SessionZustand::ErwarteAuthAntwort;
        Schritt::weiter(vec![ControlMessage::new(
            request_id,
            ControlPayload::AuthChallenge { challenge: kodiert },
        )])
    }

    fn auth_antwort(&mut self, request_id: u32, payload: ControlPayload, jetzt: Instant) -> SignalingResult<Schritt> {
        let signatur = match payload {
            ControlPayload::AuthResponse { signature } => signature,
            andere => {
                return Err(SignalingError::protokoll(format!(
                    "auth_response erwartet, '{}' erhalten",
                    andere.name()
                )))
            }
        };
        let (Some(challenge), Some(callsign), Some(schluessel)) = (
            self.challenge.take(),
            self.callsign.clone(),
            self.oeffentlicher_schluessel.take(),
        ) else {
            return Err(SignalingError::protokoll("Keine Challenge ausstehend"));
        };

        let signatur = BASE64
            .decode(signatur.as_bytes())
            .map_err(|_| CryptoError::SignaturVerifikation("Signatur nicht dekodierbar".into()))?;
        let mut daten = challenge;
        daten.extend_from_slice(callsign.as_str().as_bytes());
        self.state
            .ca
            .lock()
            .signatur_pruefen(&schluessel, &daten, &signatur)?;

        let tx = self
            .tx
            .take()
            .ok_or_else(|| SignalingError::protokoll("Session bereits registriert"))?;
        let version = self.version.unwrap_or(self.state.config.min_version);
        let (id, udp) = self.state.kern.registrieren(
            NeueSession {
                callsign: callsign.clone(),
                tcp_adresse: self.peer,
                version,
                tx,
            },
            jetzt,
        )?;

        self.session_id = Some(id);
        self.zustand = SessionZustand::Verbunden;
        tracing::info!(peer = %self.peer, callsign = %callsign, session = %id, %version, "Knoten authentifiziert");

        let mut antworten = vec![ControlMessage::new(
            request_id,
            ControlPayload::AuthOk { session_id: id, udp },
        )];
        if let Some(cert_pem) = self.erneuertes_zertifikat.take() {
            antworten.push(ControlMessage::push(ControlPayload::ClientCertificate {
                cert_pem,
                key_pem: None,
            }));
        }
        Ok(Schritt::weiter(antworten))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::server_state::SignalingConfig;
    use parking_lot::Mutex;
    use reflector_core::event::BroadcastEventBus;
    use reflector_core::types::TalkGroup;
    use reflector_crypto::{tls_acceptor_erstellen, CaConfig, CaManager, PkiBackend, RcgenPki, Rolle, UdpCipher};
    use reflector_protocol::control::UdpSchluesselParameter;
    use reflector_protocol::datagram::UdpNachricht;
    use reflector_voice::{Kern, KernConfig};
    use std::net::{IpAddr, Ipv4Addr};

    pub(crate) fn test_state(ca_config: CaConfig) -> Arc<SignalingState> {
        test_state_mit_kern(ca_config, KernConfig::default())
    }

    pub(crate) fn test_state_mit_kern(ca_config: CaConfig, kern_config: KernConfig) -> Arc<SignalingState> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let ca = CaManager::neu(ca_config, Utc::now()).unwrap();
        let (kette, key) = ca.server_tls();
        let tls = tls_acceptor_erstellen(&kette, &key).unwrap();
        let kern = Kern::neu(kern_config, Arc::new(BroadcastEventBus::default()));
        SignalingState::neu(
            SignalingConfig {
                min_version: ProtoVersion::neu(1, 6),
                ..SignalingConfig::default()
            },
            kern,
            Arc::new(Mutex::new(ca)),
            tls,
        )
    }

    fn peer() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000)
    }

    pub(crate) fn nachricht(payload: ControlPayload) -> ControlMessage {
        ControlMessage::new(7, payload)
    }

    /// Knotenseite: Schluessel und Signatur ueber Challenge und Rufzeichen
    pub(crate) struct TestKnoten {
        pub key_pem: String,
        pub callsign: String,
    }

    impl TestKnoten {
        pub(crate) fn neu(callsign: &str) -> Self {
            Self {
                key_pem: RcgenPki.schluessel_erzeugen().unwrap(),
                callsign: callsign.to_string(),
            }
        }

        pub(crate) fn csr(&self) -> String {
            RcgenPki.csr_erstellen(&self.key_pem, &self.callsign, None).unwrap()
        }

        pub(crate) fn antwort(&self, challenge_b64: &str) -> ControlPayload {
            let mut daten = BASE64.decode(challenge_b64).unwrap();
            daten.extend_from_slice(self.callsign.to_ascii_uppercase().as_bytes());
            let sig = RcgenPki.signieren(&self.key_pem, &daten).unwrap();
            ControlPayload::AuthResponse {
                signature: BASE64.encode(sig),
            }
        }
    }

    fn bis_zum_zertifikat(session: &mut ClientSession) {
        let s = session.verarbeiten(nachricht(ControlPayload::ProtoVer { major: 2, minor: 1 }), Instant::now());
        assert!(matches!(s.antworten[0].payload, ControlPayload::ProtoVerAck { major: 2, minor: 1 }));

        let s = session.verarbeiten(nachricht(ControlPayload::CaBundleRequest), Instant::now());
        assert!(matches!(s.antworten[0].payload, ControlPayload::CaBundle { .. }));

        let s = session.verarbeiten(nachricht(ControlPayload::StartEncryptionRequest), Instant::now());
        assert_eq!(s.folge, Folge::TlsStarten);
        assert_eq!(s.antworten[0].payload, ControlPayload::StartEncryption);
        assert_eq!(session.zustand(), SessionZustand::ErwarteSicherenKanal);

        let m = session.tls_aktiv().unwrap();
        assert_eq!(m[0].payload, ControlPayload::CertRequired);
        assert_eq!(session.zustand(), SessionZustand::ErwarteCsr);
    }

    fn challenge(s: &Schritt) -> String {
        s.antworten
            .iter()
            .find_map(|m| match &m.payload {
                ControlPayload::AuthChallenge { challenge } => Some(challenge.clone()),
                _ => None,
            })
            .expect("Challenge erwartet")
    }

    fn fehlercode(s: &Schritt) -> Option<ErrorCode> {
        s.antworten.iter().find_map(|m| match &m.payload {
            ControlPayload::Error { code, .. } => Some(*code),
            _ => None,
        })
    }

    /// Kompletter Handshake per CSR; gibt Session und ausgestelltes Zertifikat zurueck
    pub(crate) fn verbinden(
        state: &Arc<SignalingState>,
        knoten: &TestKnoten,
    ) -> (ClientSession, mpsc::Receiver<ControlMessage>, String) {
        let (session, rx, cert, _) = anmelden(state, knoten);
        (session, rx, cert)
    }

    /// Wie [`verbinden`], liefert zusaetzlich die UDP-Schluessel aus `auth_ok`
    pub(crate) fn anmelden(
        state: &Arc<SignalingState>,
        knoten: &TestKnoten,
    ) -> (ClientSession, mpsc::Receiver<ControlMessage>, String, UdpSchluesselParameter) {
        let (tx, rx) = mpsc::channel(32);
        let mut session = ClientSession::neu(Arc::clone(state), peer(), tx);
        bis_zum_zertifikat(&mut session);

        let s = session.verarbeiten(
            nachricht(ControlPayload::ClientCsr {
                callsign: knoten.callsign.clone(),
                csr_pem: knoten.csr(),
            }),
            Instant::now(),
        );
        let cert = match &s.antworten[0].payload {
            ControlPayload::ClientCertificate { cert_pem, key_pem: None } => cert_pem.clone(),
            p => panic!("client_certificate erwartet, {p:?}"),
        };
        let s = session.verarbeiten(nachricht(knoten.antwort(&challenge(&s))), Instant::now());
        let udp = match &s.antworten[0].payload {
            ControlPayload::AuthOk { udp, .. } => udp.clone(),
            p => panic!("auth_ok erwartet, {p:?}"),
        };
        assert!(session.ist_verbunden());
        (session, rx, cert, udp)
    }

    #[test]
    fn zu_alte_version_wird_vor_zertifikaten_abgelehnt() {
        let state = test_state(CaConfig::default());
        let (tx, _rx) = mpsc::channel(4);
        let mut session = ClientSession::neu(Arc::clone(&state), peer(), tx);

        let s = session.verarbeiten(nachricht(ControlPayload::ProtoVer { major: 1, minor: 5 }), Instant::now());
        assert_eq!(fehlercode(&s), Some(ErrorCode::UnsupportedVersion));
        assert_eq!(s.folge, Folge::Trennen);
        assert_eq!(session.zustand(), SessionZustand::ErwarteTrennung);

        // Nachfolgender Zertifikatsaustausch findet nicht statt
        let knoten = TestKnoten::neu("DL1ABC");
        let s = session.verarbeiten(
            nachricht(ControlPayload::ClientCsr {
                callsign: knoten.callsign.clone(),
                csr_pem: knoten.csr(),
            }),
            Instant::now(),
        );
        assert!(s.antworten.is_empty());
        assert!(state.ca.lock().eintraege().is_empty());
    }

    #[test]
    fn mindestversion_wird_akzeptiert() {
        let state = test_state(CaConfig::default());
        let (tx, _rx) = mpsc::channel(4);
        let mut session = ClientSession::neu(state, peer(), tx);
        let s = session.verarbeiten(nachricht(ControlPayload::ProtoVer { major: 1, minor: 6 }), Instant::now());
        assert_eq!(s.folge, Folge::Weiter);
        assert_eq!(session.zustand(), SessionZustand::ErwarteStartVerschluesselung);
    }

    #[test]
    fn erste_nachricht_muss_version_sein() {
        let state = test_state(CaConfig::default());
        let (tx, _rx) = mpsc::channel(4);
        let mut session = ClientSession::neu(state, peer(), tx);
        let s = session.verarbeiten(nachricht(ControlPayload::TalkRequest), Instant::now());
        assert_eq!(fehlercode(&s), Some(ErrorCode::ProtocolViolation));
        assert_eq!(s.folge, Folge::Trennen);
    }

    #[test]
    fn voller_handshake_per_csr() {
        let state = test_state(CaConfig::default());
        let knoten = TestKnoten::neu("dl1abc");
        let (mut session, _rx, _cert) = verbinden(&state, &knoten);

        assert_eq!(session.callsign().unwrap().as_str(), "DL1ABC");
        assert_eq!(state.kern.anzahl(), 1);

        // Verbunden: Steuerbefehle landen im Kern
        let s = session.verarbeiten(nachricht(ControlPayload::SelectTg { tg: TalkGroup(42) }), Instant::now());
        assert!(s.antworten.is_empty());
        session.verarbeiten(nachricht(ControlPayload::TalkRequest), Instant::now());
        assert_eq!(state.kern.sprecher(TalkGroup(42)).unwrap().as_str(), "DL1ABC");

        session.beenden("test");
        assert_eq!(session.zustand(), SessionZustand::Getrennt);
        assert_eq!(state.kern.anzahl(), 0);
        assert!(state.kern.sprecher(TalkGroup(42)).is_none());
    }

    #[test]
    fn vorhandenes_zertifikat_und_widerruf() {
        let state = test_state(CaConfig::default());
        let knoten = TestKnoten::neu("DL1ABC");
        let (mut erste, _rx, cert) = verbinden(&state, &knoten);
        erste.beenden("test");

        // Zweiter Login mit vorhandenem Zertifikat
        let (tx, _rx2) = mpsc::channel(4);
        let mut session = ClientSession::neu(Arc::clone(&state), peer(), tx);
        bis_zum_zertifikat(&mut session);
        let s = session.verarbeiten(
            nachricht(ControlPayload::ClientCert {
                callsign: "DL1ABC".into(),
                cert_pem: cert.clone(),
            }),
            Instant::now(),
        );
        let s = session.verarbeiten(nachricht(knoten.antwort(&challenge(&s))), Instant::now());
        assert!(matches!(s.antworten[0].payload, ControlPayload::AuthOk { .. }));
        session.beenden("test");

        // Nach Widerruf wird das Zertifikat abgelehnt
        let cs = Callsign::neu("DL1ABC").unwrap();
        state.ca.lock().widerrufen(&cs, Utc::now()).unwrap();
        let (tx, _rx3) = mpsc::channel(4);
        let mut session = ClientSession::neu(Arc::clone(&state), peer(), tx);
        bis_zum_zertifikat(&mut session);
        let s = session.verarbeiten(
            nachricht(ControlPayload::ClientCert {
                callsign: "DL1ABC".into(),
                cert_pem: cert,
            }),
            Instant::now(),
        );
        assert_eq!(fehlercode(&s), Some(ErrorCode::AccessDenied));
        match &s.antworten[0].payload {
            ControlPayload::Error { message, .. } => assert_eq!(message, ZUGRIFF_VERWEIGERT),
            p => panic!("error erwartet, {p:?}"),
        }
    }

    #[test]
    fn falsche_signatur_wird_abgewiesen() {
        let state = test_state(CaConfig::default());
        let knoten = TestKnoten::neu("DL1ABC");
        let fremder = TestKnoten::neu("DL1ABC");
        let (tx, _rx) = mpsc::channel(4);
        let mut session = ClientSession::neu(Arc::clone(&state), peer(), tx);
        bis_zum_zertifikat(&mut session);

        let s = session.verarbeiten(
            nachricht(ControlPayload::ClientCsr {
                callsign: knoten.callsign.clone(),
                csr_pem: knoten.csr(),
            }),
            Instant::now(),
        );
        let s = session.verarbeiten(nachricht(fremder.antwort(&challenge(&s))), Instant::now());
        assert_eq!(fehlercode(&s), Some(ErrorCode::AccessDenied));
        assert!(!session.ist_verbunden());
        assert_eq!(state.kern.anzahl(), 0);
    }

    #[test]
    fn csr_fuer_fremdes_rufzeichen() {
        let state = test_state(CaConfig::default());
        let knoten = TestKnoten::neu("DL1ABC");
        let (tx, _rx) = mpsc::channel(4);
        let mut session = ClientSession::neu(Arc::clone(&state), peer(), tx);
        bis_zum_zertifikat(&mut session);
        let s = session.verarbeiten(
            nachricht(ControlPayload::ClientCsr {
                callsign: "SM0ABC".into(),
                csr_pem: knoten.csr(),
            }),
            Instant::now(),
        );
        assert_eq!(fehlercode(&s), Some(ErrorCode::AccessDenied));
    }

    #[test]
    fn ausstehender_csr_trennt() {
        let state = test_state(CaConfig {
            auto_ausstellen: false,
            ..CaConfig::default()
        });
        let knoten = TestKnoten::neu("DL1ABC");
        let (tx, _rx) = mpsc::channel(4);
        let mut session = ClientSession::neu(Arc::clone(&state), peer(), tx);
        bis_zum_zertifikat(&mut session);
        let s = session.verarbeiten(
            nachricht(ControlPayload::ClientCsr {
                callsign: knoten.callsign.clone(),
                csr_pem: knoten.csr(),
            }),
            Instant::now(),
        );
        assert_eq!(fehlercode(&s), Some(ErrorCode::CertificatePending));
        assert_eq!(state.ca.lock().ausstehende_anzahl(), 1);

        // Schluesselerzeugung ist ohne automatische Ausstellung gesperrt
        let (tx, _rx) = mpsc::channel(4);
        let mut session = ClientSession::neu(Arc::clone(&state), peer(), tx);
        bis_zum_zertifikat(&mut session);
        let s = session.verarbeiten(
            nachricht(ControlPayload::KeyGenRequest {
                callsign: "SM0ABC".into(),
                email: None,
            }),
            Instant::now(),
        );
        assert_eq!(fehlercode(&s), Some(ErrorCode::AccessDenied));
    }

    #[test]
    fn schluesselerzeugung_liefert_schluessel_und_zertifikat() {
        let state = test_state(CaConfig::default());
        let (tx, _rx) = mpsc::channel(4);
        let mut session = ClientSession::neu(Arc::clone(&state), peer(), tx);
        bis_zum_zertifikat(&mut session);
        let s = session.verarbeiten(
            nachricht(ControlPayload::KeyGenRequest {
                callsign: "OH1ABC".into(),
                email: None,
            }),
            Instant::now(),
        );
        let key_pem = match &s.antworten[0].payload {
            ControlPayload::ClientCertificate { key_pem: Some(k), .. } => k.clone(),
            p => panic!("client_certificate mit Schluessel erwartet, {p:?}"),
        };
        let knoten = TestKnoten {
            key_pem,
            callsign: "OH1ABC".into(),
        };
        let s = session.verarbeiten(nachricht(knoten.antwort(&challenge(&s))), Instant::now());
        assert!(matches!(s.antworten[0].payload, ControlPayload::AuthOk { .. }));
    }

    #[test]
    fn doppeltes_rufzeichen_wird_abgewiesen() {
        let state = test_state(CaConfig::default());
        let knoten = TestKnoten::neu("DL1ABC");
        let (_erste, _rx, cert) = verbinden(&state, &knoten);

        let (tx, _rx2) = mpsc::channel(4);
        let mut session = ClientSession::neu(Arc::clone(&state), peer(), tx);
        bis_zum_zertifikat(&mut session);
        let s = session.verarbeiten(
            nachricht(ControlPayload::ClientCert {
                callsign: "DL1ABC".into(),
                cert_pem: cert,
            }),
            Instant::now(),
        );
        let s = session.verarbeiten(nachricht(knoten.antwort(&challenge(&s))), Instant::now());
        assert_eq!(fehlercode(&s), Some(ErrorCode::AccessDenied));
        assert_eq!(state.kern.anzahl(), 1);
    }

    #[test]
    fn handshake_nachricht_im_verbundenen_zustand() {
        let state = test_state(CaConfig::default());
        let knoten = TestKnoten::neu("DL1ABC");
        let (mut session, _rx, _) = verbinden(&state, &knoten);
        let s = session.verarbeiten(nachricht(ControlPayload::ProtoVer { major: 2, minor: 1 }), Instant::now());
        assert_eq!(fehlercode(&s), Some(ErrorCode::ProtocolViolation));
        assert_eq!(session.zustand(), SessionZustand::ErwarteTrennung);
    }

    #[test]
    fn trennung_nimmt_session_sofort_aus_dem_kern() {
        let state = test_state(CaConfig::default());
        let (mut a, mut a_rx, _, a_udp) = anmelden(&state, &TestKnoten::neu("DL1ABC"));
        let (mut b, mut b_rx, _, b_udp) = anmelden(&state, &TestKnoten::neu("SM0ABC"));
        let a_id = a.session_id().unwrap();
        let b_id = b.session_id().unwrap();
        let mut a_cipher = UdpCipher::aus_parametern(a_id, &a_udp, Rolle::Client).unwrap();
        let mut b_cipher = UdpCipher::aus_parametern(b_id, &b_udp, Rolle::Client).unwrap();
        let a_adresse = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 41000);
        let b_adresse = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 41001);

        for s in [&mut a, &mut b] {
            s.verarbeiten(nachricht(ControlPayload::SelectTg { tg: TalkGroup(42) }), Instant::now());
        }
        let hb = b_cipher.verschluesseln(&UdpNachricht::Heartbeat.encode()).unwrap();
        state.kern.datagramm_verarbeiten(&hb, b_adresse, Instant::now());
        let hb = a_cipher.verschluesseln(&UdpNachricht::Heartbeat.encode()).unwrap();
        state.kern.datagramm_verarbeiten(&hb, a_adresse, Instant::now());

        let s = a.verarbeiten(nachricht(ControlPayload::TalkRequest), Instant::now());
        assert_eq!(s.folge, Folge::Weiter);
        assert_eq!(state.kern.sprecher(TalkGroup(42)).unwrap().as_str(), "DL1ABC");
        while a_rx.try_recv().is_ok() {}
        while b_rx.try_recv().is_ok() {}

        // Protokollfehler: A wartet auf das Schliessen der Gegenseite
        let s = a.verarbeiten(nachricht(ControlPayload::ProtoVer { major: 2, minor: 1 }), Instant::now());
        assert_eq!(s.folge, Folge::Trennen);
        assert!(a.session_id().is_none());
        assert_eq!(state.kern.anzahl(), 1);
        assert!(state.kern.sprecher(TalkGroup(42)).is_none());

        // Audio in der Wartezeit wird nicht weitergeleitet
        let audio = a_cipher.verschluesseln(&UdpNachricht::Audio(vec![1, 2, 3]).encode()).unwrap();
        assert!(state.kern.datagramm_verarbeiten(&audio, a_adresse, Instant::now()).is_empty());
        assert!(state.kern.sprecher(TalkGroup(42)).is_none());

        // Keine Broadcasts mehr an A, die Sende-Queue ist geschlossen
        let s = b.verarbeiten(nachricht(ControlPayload::TalkRequest), Instant::now());
        assert_eq!(s.folge, Folge::Weiter);
        let mut a_hat_empfangen = false;
        loop {
            match a_rx.try_recv() {
                Ok(m) => a_hat_empfangen |= matches!(m.payload, ControlPayload::TalkerStart { .. }),
                Err(mpsc::error::TryRecvError::Disconnected) => break,
                Err(mpsc::error::TryRecvError::Empty) => panic!("Sende-Queue von A noch offen"),
            }
        }
        assert!(!a_hat_empfangen);
        assert_eq!(state.kern.sprecher(TalkGroup(42)).unwrap().as_str(), "SM0ABC");
    }
}
