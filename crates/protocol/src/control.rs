//! Control-Protokoll (TCP/TLS)
//!
//! Definiert alle Steuerungsnachrichten die ueber die TCP-Verbindung
//! zwischen Knoten und Reflector ausgetauscht werden.
//!
//! ## Design
//! - Jede Nachricht traegt eine `request_id: u32`, Antworten spiegeln sie
//! - JSON-Serialisierung via serde (TCP, nicht zeitkritisch)
//! - Tagged Enums fuer typsichere Nachrichtentypen
//! - Neuere Nachrichten sind versionsgebunden (siehe [`ProtoVersion`])

use reflector_core::types::{Callsign, SessionId, TalkGroup};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Protokollversion
// ---------------------------------------------------------------------------

/// Protokollversion (major, minor), lexikografisch geordnet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtoVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtoVersion {
    pub const fn neu(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl std::fmt::Display for ProtoVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Version die der Reflector selbst spricht
pub const AKTUELLE_VERSION: ProtoVersion = ProtoVersion::neu(2, 1);

/// Ab dieser Version erhalten Knoten Beitritts-/Austrittsmeldungen und
/// CA-Bundle-Pushes nach einer Erneuerung
pub const VERSION_KNOTEN_MELDUNGEN: ProtoVersion = ProtoVersion::neu(2, 1);

// ---------------------------------------------------------------------------
// Fehler-Codes
// ---------------------------------------------------------------------------

/// Standardisierte Fehler-Codes fuer Error-Nachrichten
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Nachricht im aktuellen Zustand nicht erlaubt oder fehlerhaft
    ProtocolViolation,
    /// Protokollversion unter dem Minimum
    UnsupportedVersion,
    /// Generische Ablehnung bei Auth-/Richtlinienfehlern
    AccessDenied,
    /// CSR wartet auf Freigabe
    CertificatePending,
    /// Zu viele offene Verbindungen oder CSRs
    ServerBusy,
    /// Serverseitiger Fehler
    InternalError,
}

// ---------------------------------------------------------------------------
// Hilfstypen
// ---------------------------------------------------------------------------

/// Schluesselmaterial fuer den verschluesselten UDP-Kanal
///
/// Alle Felder Base64-kodiert. "client" bezeichnet die Richtung
/// Knoten → Reflector, "server" die Gegenrichtung.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpSchluesselParameter {
    pub client_schluessel: String,
    pub client_salt: String,
    pub server_schluessel: String,
    pub server_salt: String,
}

// ---------------------------------------------------------------------------
// ControlPayload
// ---------------------------------------------------------------------------

/// Alle moeglichen Nachrichten-Payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlPayload {
    // --- Knoten → Reflector: Handshake ---
    /// Versionsankuendigung, muss die erste Nachricht sein
    ProtoVer { major: u16, minor: u16 },
    /// Anfrage nach Root- und Ausstellerzertifikat
    CaBundleRequest,
    /// Wechsel auf TLS anfordern
    StartEncryptionRequest,
    /// Vorhandenes Client-Zertifikat vorlegen
    ClientCert { callsign: String, cert_pem: String },
    /// CSR zur Signatur einreichen
    ClientCsr { callsign: String, csr_pem: String },
    /// Schluessel und Zertifikat serverseitig erzeugen lassen
    KeyGenRequest {
        callsign: String,
        #[serde(default)]
        email: Option<String>,
    },
    /// Antwort auf die Challenge (Base64 ECDSA-Signatur ueber challenge||callsign)
    AuthResponse { signature: String },

    // --- Knoten → Reflector: Betrieb ---
    /// Freie Knoten-Informationen (JSON)
    NodeInfo { info: serde_json::Value },
    /// Talk-Group waehlen
    SelectTg { tg: TalkGroup },
    /// Menge der mitgehoerten Gruppen setzen
    TgMonitor { tgs: Vec<TalkGroup> },
    /// QSY anfordern (0 = beliebige freie Gruppe)
    RequestQsy { tg: TalkGroup },
    /// Sendeerlaubnis anfordern
    TalkRequest,
    /// Sendeerlaubnis zurueckgeben
    TalkRelease,
    /// Signalstaerke-Bericht eines Empfaengers
    SignalStrength { rx_id: String, siglev: f32, active: bool },
    /// Sauber trennen
    Disconnect,

    // --- Beide Richtungen ---
    Heartbeat,

    // --- Reflector → Knoten ---
    /// Fehler-Antwort
    Error { code: ErrorCode, message: String },
    /// Version akzeptiert
    ProtoVerAck { major: u16, minor: u16 },
    /// Zertifikatskette mit Digest und Signatur (Root-Schluessel)
    CaBundle {
        ca_pem: String,
        issuing_pem: String,
        digest: String,
        signature: String,
    },
    /// Der Knoten darf jetzt den TLS-Handshake beginnen
    StartEncryption,
    /// Knoten muss Zertifikat oder CSR liefern
    CertRequired,
    /// Ausgestelltes (oder erneuertes) Client-Zertifikat
    ClientCertificate {
        cert_pem: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key_pem: Option<String>,
    },
    /// Zufaellige Challenge (Base64)
    AuthChallenge { challenge: String },
    /// Authentifizierung erfolgreich
    AuthOk {
        session_id: SessionId,
        udp: UdpSchluesselParameter,
    },
    NodeJoined { callsign: Callsign },
    NodeLeft { callsign: Callsign },
    TalkerStart { tg: TalkGroup, callsign: Callsign },
    TalkerStop { tg: TalkGroup, callsign: Callsign },
    TalkDenied { tg: TalkGroup, reason: String },
    /// Session ist fuer die angegebene Zeit gesperrt
    TalkBlocked { secs: u64 },
    /// Knoten wurde auf diese Gruppe verschoben
    Qsy { tg: TalkGroup },
}

impl ControlPayload {
    /// Kurzname fuer Logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProtoVer { .. } => "proto_ver",
            Self::CaBundleRequest => "ca_bundle_request",
            Self::StartEncryptionRequest => "start_encryption_request",
            Self::ClientCert { .. } => "client_cert",
            Self::ClientCsr { .. } => "client_csr",
            Self::KeyGenRequest { .. } => "key_gen_request",
            Self::AuthResponse { .. } => "auth_response",
            Self::NodeInfo { .. } => "node_info",
            Self::SelectTg { .. } => "select_tg",
            Self::TgMonitor { .. } => "tg_monitor",
            Self::RequestQsy { .. } => "request_qsy",
            Self::TalkRequest => "talk_request",
            Self::TalkRelease => "talk_release",
            Self::SignalStrength { .. } => "signal_strength",
            Self::Disconnect => "disconnect",
            Self::Heartbeat => "heartbeat",
            Self::Error { .. } => "error",
            Self::ProtoVerAck { .. } => "proto_ver_ack",
            Self::CaBundle { .. } => "ca_bundle",
            Self::StartEncryption => "start_encryption",
            Self::CertRequired => "cert_required",
            Self::ClientCertificate { .. } => "client_certificate",
            Self::AuthChallenge { .. } => "auth_challenge",
            Self::AuthOk { .. } => "auth_ok",
            Self::NodeJoined { .. } => "node_joined",
            Self::NodeLeft { .. } => "node_left",
            Self::TalkerStart { .. } => "talker_start",
            Self::TalkerStop { .. } => "talker_stop",
            Self::TalkDenied { .. } => "talk_denied",
            Self::TalkBlocked { .. } => "talk_blocked",
            Self::Qsy { .. } => "qsy",
        }
    }
}

// ---------------------------------------------------------------------------
// ControlMessage
// ---------------------------------------------------------------------------

/// Vollstaendige Control-Nachricht mit Request-ID
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Korrelations-ID (vom Server initiierte Nachrichten verwenden 0)
    pub request_id: u32,
    pub payload: ControlPayload,
}

impl ControlMessage {
    pub fn new(request_id: u32, payload: ControlPayload) -> Self {
        Self {
            request_id,
            payload,
        }
    }

    /// Server-initiierte Nachricht ohne Korrelation
    pub fn push(payload: ControlPayload) -> Self {
        Self::new(0, payload)
    }

    /// Erstellt eine Fehler-Antwort
    pub fn error(request_id: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            request_id,
            ControlPayload::Error {
                code,
                message: message.into(),
            },
        )
    }

    pub fn heartbeat() -> Self {
        Self::push(ControlPayload::Heartbeat)
    }
}
