//! reflector-server – Bibliotheks-Root
//!
//! Verdrahtet CA, Routing-Kern, UDP- und TCP-Server sowie die periodischen
//! Aufgaben und stellt den Einstiegspunkt fuer Integrationstests bereit.

pub mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use config::ServerConfig;
use parking_lot::Mutex;
use reflector_core::event::{BroadcastEventBus, EventBus};
use reflector_crypto::{tls_acceptor_erstellen, CaManager};
use reflector_signaling::{
    erneuerungen_durchfuehren, publisher_starten, AdminSchnittstelle, EreignisPublisher,
    LogPublisher, SignalingServer, SignalingState,
};
use reflector_voice::{Kern, UdpServer};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Takt fuer Floor-Zeitlimits und UDP-Heartbeats
const TICK_INTERVALL: Duration = Duration::from_secs(1);

/// Laufender Server mit allen Subsystemen
pub struct Server {
    pub config: ServerConfig,
    state: Arc<SignalingState>,
    udp: UdpServer,
    tcp: SignalingServer,
    publisher: Arc<dyn EreignisPublisher>,
}

impl Server {
    /// Baut alle Subsysteme auf und bindet die Sockets
    ///
    /// Reihenfolge:
    /// 1. CA laden oder erzeugen, TLS-Acceptor bauen
    /// 2. Routing-Kern mit Event-Bus
    /// 3. UDP-Socket und TCP-Listener binden
    pub async fn neu(config: ServerConfig) -> Result<Self> {
        // Ein Prozess, ein Crypto-Provider; ein zweiter Aufruf ist harmlos
        let _ = rustls::crypto::ring::default_provider().install_default();

        let ca = CaManager::neu(config.ca_config(), Utc::now())
            .context("Zertifizierungsstelle konnte nicht initialisiert werden")?;
        let (kette, key) = ca.server_tls();
        let tls = tls_acceptor_erstellen(&kette, &key).context("TLS-Acceptor fehlgeschlagen")?;
        tracing::info!(
            issuing_serial = %ca.issuing_info().serial,
            gueltig_bis = %ca.issuing_info().gueltig_bis,
            digest = %ca.ca_bundle().digest,
            "Zertifizierungsstelle bereit"
        );

        let events: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
        let kern = Kern::neu(config.kern_config(), events);
        let state = SignalingState::neu(
            config.signaling_config(),
            kern.clone(),
            Arc::new(Mutex::new(ca)),
            tls,
        );

        let udp_addr: SocketAddr = config
            .udp_bind_adresse()
            .parse()
            .with_context(|| format!("Ungueltige UDP-Adresse '{}'", config.udp_bind_adresse()))?;
        let tcp_addr: SocketAddr = config
            .tcp_bind_adresse()
            .parse()
            .with_context(|| format!("Ungueltige TCP-Adresse '{}'", config.tcp_bind_adresse()))?;

        let udp = UdpServer::binden(udp_addr, kern)
            .await
            .with_context(|| format!("UDP-Socket {udp_addr} nicht bindbar"))?;
        let tcp = SignalingServer::binden(tcp_addr, Arc::clone(&state))
            .await
            .with_context(|| format!("TCP-Listener {tcp_addr} nicht bindbar"))?;

        Ok(Self {
            config,
            state,
            udp,
            tcp,
            publisher: Arc::new(LogPublisher),
        })
    }

    /// Ersetzt den Standard-Publisher (Log) durch einen eigenen
    pub fn mit_publisher(mut self, publisher: Arc<dyn EreignisPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Admin-Schnittstelle fuer Betreiber-Werkzeuge
    pub fn admin(&self) -> AdminSchnittstelle {
        AdminSchnittstelle::neu(Arc::clone(&self.state))
    }

    pub fn tcp_adresse(&self) -> std::io::Result<SocketAddr> {
        self.tcp.lokale_adresse()
    }

    pub fn udp_adresse(&self) -> std::io::Result<SocketAddr> {
        self.udp.lokale_adresse()
    }

    /// Startet alle Tasks und laeuft bis `shutdown_rx` `true` meldet
    pub async fn starten(self, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(
            server_name = %self.config.server.name,
            tcp = %self.tcp_adresse()?,
            udp = %self.udp_adresse()?,
            "Server startet"
        );

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let udp = self.udp.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { udp.empfangs_loop(rx).await }));

        tasks.push(tick_starten(
            self.state.kern.clone(),
            self.udp.clone(),
            shutdown_rx.clone(),
        ));
        tasks.push(erneuerung_starten(
            Arc::clone(&self.state),
            Duration::from_secs(self.config.pki.erneuerung_pruefintervall_sek),
            shutdown_rx.clone(),
        ));
        tasks.push(publisher_starten(
            self.state.events(),
            Arc::clone(&self.publisher),
            shutdown_rx.clone(),
        ));

        self.tcp.starten(shutdown_rx).await?;

        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(fehler = %e, "Task nicht sauber beendet");
            }
        }
        if let Err(e) = self.state.ca.lock().speichern() {
            tracing::warn!(fehler = %e, "CA-Zustand konnte nicht gespeichert werden");
        }
        tracing::info!("Server beendet");
        Ok(())
    }
}

/// Periodischer Takt: Router-Zeitlimits und UDP-Heartbeats
fn tick_starten(kern: Kern, udp: UdpServer, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut intervall = tokio::time::interval(TICK_INTERVALL);
        intervall.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = intervall.tick() => {
                    let ausgang = kern.tick(Instant::now());
                    udp.senden_alle(ausgang).await;
                }
                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Prueft in festen Abstaenden auf faellige Zertifikatserneuerungen
fn erneuerung_starten(
    state: Arc<SignalingState>,
    pruefintervall: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut intervall = tokio::time::interval(pruefintervall);
        intervall.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = intervall.tick() => {
                    if let Err(e) = erneuerungen_durchfuehren(&state, Utc::now()) {
                        tracing::error!(fehler = %e, "Zertifikatserneuerung fehlgeschlagen");
                    }
                }
                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
