//! Server-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! sinnvolle Standardwerte, sodass der Server ohne Konfigurationsdatei
//! lauffaehig ist.

use std::collections::BTreeSet;
use std::time::Duration;

use reflector_core::types::TalkGroup;
use reflector_crypto::{CaConfig, Richtlinie};
use reflector_protocol::control::ProtoVersion;
use reflector_signaling::SignalingConfig;
use reflector_voice::{KernConfig, RouterConfig};
use serde::{Deserialize, Serialize};

/// Vollstaendige Server-Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Allgemeine Server-Einstellungen
    pub server: ServerEinstellungen,
    /// Netzwerk-Einstellungen
    pub netzwerk: NetzwerkEinstellungen,
    /// Mindestversion des Control-Protokolls
    pub protokoll: ProtokollEinstellungen,
    /// Zertifizierungsstelle
    pub pki: PkiEinstellungen,
    /// Rufzeichen- und E-Mail-Richtlinie fuer Zertifikate
    pub richtlinie: Richtlinie,
    /// Heartbeats und Trennungsfristen
    pub zeitlimits: ZeitlimitEinstellungen,
    /// Floor-Control und QSY
    pub talkgroups: TalkgroupEinstellungen,
    /// Logging-Einstellungen
    pub logging: LoggingEinstellungen,
}

/// Allgemeine Server-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerEinstellungen {
    /// Anzeigename des Servers
    pub name: String,
    /// Maximale Anzahl gleichzeitiger Knoten
    pub max_clients: usize,
    /// Maximale Anzahl noch nicht authentifizierter Verbindungen
    pub max_unauthentifiziert: usize,
}

impl Default for ServerEinstellungen {
    fn default() -> Self {
        Self {
            name: "Reflector".into(),
            max_clients: 1000,
            max_unauthentifiziert: 64,
        }
    }
}

/// Netzwerk-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetzwerkEinstellungen {
    /// Bind-Adresse fuer TCP und UDP
    pub bind_adresse: String,
    /// Port fuer die Control-Verbindung
    pub tcp_port: u16,
    /// Port fuer Audio-Datagramme
    pub udp_port: u16,
}

impl Default for NetzwerkEinstellungen {
    fn default() -> Self {
        Self {
            bind_adresse: "0.0.0.0".into(),
            tcp_port: 5300,
            udp_port: 5300,
        }
    }
}

/// Mindestversion des Control-Protokolls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtokollEinstellungen {
    pub min_major: u16,
    pub min_minor: u16,
}

impl Default for ProtokollEinstellungen {
    fn default() -> Self {
        Self {
            min_major: 2,
            min_minor: 0,
        }
    }
}

/// Zertifizierungsstelle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PkiEinstellungen {
    #[serde(flatten)]
    pub ca: CaConfig,
    /// Abstand der Pruefungen auf faellige Erneuerungen
    pub erneuerung_pruefintervall_sek: u64,
}

impl Default for PkiEinstellungen {
    fn default() -> Self {
        Self {
            ca: CaConfig::default(),
            erneuerung_pruefintervall_sek: 3600,
        }
    }
}

/// Heartbeats und Trennungsfristen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZeitlimitEinstellungen {
    pub tcp_heartbeat_intervall_sek: u64,
    pub tcp_heartbeat_timeout_sek: u64,
    pub udp_heartbeat_intervall_sek: u64,
    /// Nur Qualitaetsmeldung, keine Trennung
    pub udp_heartbeat_timeout_sek: u64,
    /// Frist in `ErwarteTrennung` bis die Verbindung zwangsweise schliesst
    pub trennung_timeout_sek: u64,
    /// Frist fuer den TLS-Handshake
    pub tls_timeout_sek: u64,
}

impl Default for ZeitlimitEinstellungen {
    fn default() -> Self {
        Self {
            tcp_heartbeat_intervall_sek: 10,
            tcp_heartbeat_timeout_sek: 15,
            udp_heartbeat_intervall_sek: 15,
            udp_heartbeat_timeout_sek: 60,
            trennung_timeout_sek: 5,
            tls_timeout_sek: 10,
        }
    }
}

/// Floor-Control und QSY
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TalkgroupEinstellungen {
    /// Laengste ununterbrochene Sendezeit
    pub max_sendezeit_sek: u64,
    /// Sperre nach Ueberschreitung der Sendezeit
    pub sperrzeit_sek: u64,
    /// Floor wird ohne Audio nach dieser Zeit frei
    pub sprecher_timeout_sek: u64,
    pub qsy_pool_start: u32,
    pub qsy_pool_groesse: u32,
    pub verbotene_gruppen: Vec<u32>,
}

impl Default for TalkgroupEinstellungen {
    fn default() -> Self {
        let r = RouterConfig::default();
        Self {
            max_sendezeit_sek: r.max_sendezeit.as_secs(),
            sperrzeit_sek: r.sperrzeit.as_secs(),
            sprecher_timeout_sek: r.sprecher_timeout.as_secs(),
            qsy_pool_start: r.qsy_pool_start,
            qsy_pool_groesse: r.qsy_pool_groesse,
            verbotene_gruppen: vec![],
        }
    }
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Format: "json" oder "text"
    pub format: String,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl ServerConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        let config: Self = match std::fs::read_to_string(pfad) {
            Ok(inhalt) => toml::from_str(&inhalt)
                .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Self::default()
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
                ))
            }
        };
        config.validieren()?;
        Ok(config)
    }

    /// Prueft Wertebereiche die serde nicht abdeckt
    pub fn validieren(&self) -> anyhow::Result<()> {
        let t = &self.talkgroups;
        let z = &self.zeitlimits;
        let p = &self.pki.ca;

        if t.qsy_pool_groesse == 0 {
            anyhow::bail!("talkgroups.qsy_pool_groesse muss groesser 0 sein");
        }
        if t.qsy_pool_start == 0 || t.qsy_pool_start.checked_add(t.qsy_pool_groesse - 1).is_none() {
            anyhow::bail!("QSY-Pool liegt ausserhalb der gueltigen Gruppennummern");
        }
        if [
            z.tcp_heartbeat_intervall_sek,
            z.tcp_heartbeat_timeout_sek,
            z.udp_heartbeat_intervall_sek,
            z.udp_heartbeat_timeout_sek,
            z.trennung_timeout_sek,
            z.tls_timeout_sek,
            t.max_sendezeit_sek,
            t.sprecher_timeout_sek,
            self.pki.erneuerung_pruefintervall_sek,
        ]
        .contains(&0)
        {
            anyhow::bail!("Zeitlimits muessen groesser 0 sein");
        }
        if z.tcp_heartbeat_timeout_sek <= z.tcp_heartbeat_intervall_sek {
            anyhow::bail!("zeitlimits.tcp_heartbeat_timeout_sek muss groesser als das Intervall sein");
        }
        if self.protokoll.min_major == 0 {
            anyhow::bail!("protokoll.min_major muss mindestens 1 sein");
        }
        if self.min_version() > reflector_protocol::control::AKTUELLE_VERSION {
            anyhow::bail!(
                "Mindestversion {} liegt ueber der unterstuetzten Version",
                self.min_version()
            );
        }
        if p.client_gueltigkeit_tage <= 0
            || p.issuing_gueltigkeit_tage <= 0
            || p.root_gueltigkeit_tage < p.issuing_gueltigkeit_tage
        {
            anyhow::bail!("PKI-Gueltigkeiten sind widerspruechlich");
        }
        if self.server.max_clients == 0 || self.server.max_unauthentifiziert == 0 {
            anyhow::bail!("server.max_clients und server.max_unauthentifiziert muessen groesser 0 sein");
        }
        Ok(())
    }

    /// Gibt die vollstaendige Bind-Adresse fuer TCP zurueck
    pub fn tcp_bind_adresse(&self) -> String {
        format!("{}:{}", self.netzwerk.bind_adresse, self.netzwerk.tcp_port)
    }

    /// Gibt die vollstaendige Bind-Adresse fuer UDP zurueck
    pub fn udp_bind_adresse(&self) -> String {
        format!("{}:{}", self.netzwerk.bind_adresse, self.netzwerk.udp_port)
    }

    pub fn min_version(&self) -> ProtoVersion {
        ProtoVersion::neu(self.protokoll.min_major, self.protokoll.min_minor)
    }

    /// CA-Konfiguration inklusive Richtlinie
    pub fn ca_config(&self) -> CaConfig {
        CaConfig {
            richtlinie: self.richtlinie.clone(),
            ..self.pki.ca.clone()
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        let t = &self.talkgroups;
        RouterConfig {
            max_sendezeit: Duration::from_secs(t.max_sendezeit_sek),
            sperrzeit: Duration::from_secs(t.sperrzeit_sek),
            sprecher_timeout: Duration::from_secs(t.sprecher_timeout_sek),
            qsy_pool_start: t.qsy_pool_start,
            qsy_pool_groesse: t.qsy_pool_groesse,
            verbotene: t.verbotene_gruppen.iter().copied().map(TalkGroup).collect::<BTreeSet<_>>(),
        }
    }

    pub fn kern_config(&self) -> KernConfig {
        KernConfig {
            max_clients: self.server.max_clients,
            udp_heartbeat_intervall: Duration::from_secs(self.zeitlimits.udp_heartbeat_intervall_sek),
            udp_heartbeat_timeout: Duration::from_secs(self.zeitlimits.udp_heartbeat_timeout_sek),
            router: self.router_config(),
        }
    }

    pub fn signaling_config(&self) -> SignalingConfig {
        let z = &self.zeitlimits;
        SignalingConfig {
            server_name: self.server.name.clone(),
            min_version: self.min_version(),
            max_unauthentifiziert: self.server.max_unauthentifiziert,
            tcp_heartbeat_intervall: Duration::from_secs(z.tcp_heartbeat_intervall_sek),
            tcp_heartbeat_timeout: Duration::from_secs(z.tcp_heartbeat_timeout_sek),
            trennung_timeout: Duration::from_secs(z.trennung_timeout_sek),
            tls_timeout: Duration::from_secs(z.tls_timeout_sek),
        }
    }
}
