//! Gemeinsamer Server-Zustand fuer den Signaling-Service
//!
//! Haelt Routing-Kern, CA und den (austauschbaren) TLS-Acceptor als
//! Arc-Referenzen, die sicher zwischen tokio-Tasks geteilt werden koennen.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use reflector_core::event::EventBus;
use reflector_crypto::CaManager;
use reflector_protocol::control::ProtoVersion;
use reflector_voice::Kern;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::TlsAcceptor;

/// Konfiguration fuer den Signaling-Service
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Anzeigename des Servers
    pub server_name: String,
    /// Aeltere Protokollversionen werden abgelehnt
    pub min_version: ProtoVersion,
    /// Obergrenze gleichzeitiger Verbindungen vor der Authentifizierung
    pub max_unauthentifiziert: usize,
    pub tcp_heartbeat_intervall: Duration,
    pub tcp_heartbeat_timeout: Duration,
    /// Frist bis eine Verbindung in `ErwarteTrennung` zwangsweise geschlossen wird
    pub trennung_timeout: Duration,
    /// Frist fuer den TLS-Handshake nach `start_encryption`, ebenso fuer das
    /// Zustellen von `server_busy` an abgewiesene Verbindungen
    pub tls_timeout: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            server_name: "Reflector".to_string(),
            min_version: ProtoVersion::neu(2, 0),
            max_unauthentifiziert: 64,
            tcp_heartbeat_intervall: Duration::from_secs(10),
            tcp_heartbeat_timeout: Duration::from_secs(15),
            trennung_timeout: Duration::from_secs(5),
            tls_timeout: Duration::from_secs(10),
        }
    }
}

/// Gemeinsamer Server-Zustand (thread-safe, Arc-geteilt)
pub struct SignalingState {
    pub config: SignalingConfig,
    /// Registry und Talk-Group-Router
    pub kern: Kern,
    /// Zertifizierungsstelle; Signieren geschieht synchron unter der Sperre
    pub ca: Arc<Mutex<CaManager>>,
    tls: RwLock<TlsAcceptor>,
    unauthentifiziert: Arc<Semaphore>,
    /// Startzeitpunkt des Servers (fuer Uptime-Berechnung)
    pub start_time: Instant,
}

impl SignalingState {
    pub fn neu(
        config: SignalingConfig,
        kern: Kern,
        ca: Arc<Mutex<CaManager>>,
        tls: TlsAcceptor,
    ) -> Arc<Self> {
        let plaetze = config.max_unauthentifiziert;
        Arc::new(Self {
            config,
            kern,
            ca,
            tls: RwLock::new(tls),
            unauthentifiziert: Arc::new(Semaphore::new(plaetze)),
            start_time: Instant::now(),
        })
    }

    pub fn events(&self) -> &Arc<dyn EventBus> {
        self.kern.events()
    }

    /// Aktueller TLS-Acceptor
    pub fn tls_acceptor(&self) -> TlsAcceptor {
        self.tls.read().clone()
    }

    /// Ersetzt den TLS-Acceptor (nach Erneuerung des Serverzertifikats)
    ///
    /// Laufende Verbindungen behalten ihre TLS-Sitzung.
    pub fn tls_ersetzen(&self, acceptor: TlsAcceptor) {
        *self.tls.write() = acceptor;
    }

    /// Reserviert einen Platz fuer eine unauthentifizierte Verbindung
    ///
    /// Gibt `None` zurueck wenn die Obergrenze erreicht ist.
    pub fn platz_reservieren(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.unauthentifiziert).try_acquire_owned().ok()
    }

    /// Gibt die Uptime in Sekunden zurueck
    pub fn uptime_sek(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
