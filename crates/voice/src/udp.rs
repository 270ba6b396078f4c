//! UDP-Server fuer Audio-Datagramme
//!
//! Ein einziger Socket fuer alle Sessions. Die Empfangs-Loop gibt jedes
//! Datagramm an den [`Kern`] und sendet dessen Ausgaben (neu verschluesselte
//! Kopien pro Empfaenger) direkt zurueck.
//!
//! ```text
//! UDP Socket (recv_from)
//!     |
//!     v
//! Kern::datagramm_verarbeiten()   <- Kopf, Session, Entschluesselung, Floor
//!     |
//!     v
//! send_to() pro Empfaenger
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use reflector_protocol::datagram::{DatagrammKopf, MAX_AUDIO_LAENGE, TAG_LAENGE};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::kern::{Ausgang, Kern};

/// Empfangspuffer: Kopf + Typbyte + maximales Audio + Tag, mit Reserve
const UDP_BUFFER_SIZE: usize = 2048;

const _: () = assert!(UDP_BUFFER_SIZE >= DatagrammKopf::GROESSE + 1 + MAX_AUDIO_LAENGE + TAG_LAENGE);

/// UDP-Server
#[derive(Clone)]
pub struct UdpServer {
    socket: Arc<UdpSocket>,
    kern: Kern,
}

impl UdpServer {
    /// Bindet den UDP-Socket
    pub async fn binden(addr: SocketAddr, kern: Kern) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!(addr = %socket.local_addr()?, "UDP-Server gebunden");
        Ok(Self {
            socket: Arc::new(socket),
            kern,
        })
    }

    pub fn lokale_adresse(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Empfangs-Loop bis zum Shutdown-Signal
    pub async fn empfangs_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = [0u8; UDP_BUFFER_SIZE];
        tracing::info!("UDP-Empfangs-Loop gestartet");

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, absender)) => {
                            let ausgang = self.kern.datagramm_verarbeiten(&buf[..len], absender, Instant::now());
                            self.senden_alle(ausgang).await;
                        }
                        Err(e) => {
                            tracing::error!(fehler = %e, "UDP-Empfangsfehler");
                            // Kurze Pause um Busy-Loop bei persistentem Fehler zu vermeiden
                            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("UDP-Server: Shutdown-Signal empfangen");
                    break;
                }
            }
        }

        tracing::info!("UDP-Empfangs-Loop beendet");
    }

    /// Sendet Datagramme; Fehler einzelner Ziele werden nur protokolliert
    pub async fn senden_alle(&self, ausgang: Ausgang) {
        for (ziel, daten) in ausgang {
            if let Err(e) = self.socket.send_to(&daten, ziel).await {
                tracing::warn!(fehler = %e, ziel = %ziel, "UDP-Sendefehler");
            } else {
                tracing::trace!(bytes = daten.len(), ziel = %ziel, "Datagramm gesendet");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::KernConfig;
    use crate::registry::tests::neue_session;
    use reflector_core::event::BroadcastEventBus;
    use reflector_core::types::TalkGroup;
    use reflector_crypto::{Rolle, UdpCipher};
    use reflector_protocol::datagram::UdpNachricht;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn localhost(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[tokio::test]
    async fn audio_ueber_loopback() {
        let kern = Kern::neu(KernConfig::default(), Arc::new(BroadcastEventBus::default()));
        let server = UdpServer::binden(localhost(0), kern.clone()).await.unwrap();
        let server_addr = server.lokale_adresse().unwrap();
        assert_ne!(server_addr.port(), 0);

        let (neu_a, _ra) = neue_session("DL1ABC", 5000);
        let (neu_b, _rb) = neue_session("SM0ABC", 5001);
        let (ida, pa) = kern.registrieren(neu_a, Instant::now()).unwrap();
        let (idb, pb) = kern.registrieren(neu_b, Instant::now()).unwrap();
        kern.gruppe_waehlen(ida, TalkGroup(42)).unwrap();
        kern.gruppe_waehlen(idb, TalkGroup(42)).unwrap();
        let mut ca = UdpCipher::aus_parametern(ida, &pa, Rolle::Client).unwrap();
        let mut cb = UdpCipher::aus_parametern(idb, &pb, Rolle::Client).unwrap();

        let sock_a = UdpSocket::bind(localhost(0)).await.unwrap();
        let sock_b = UdpSocket::bind(localhost(0)).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let s = server.clone();
        let task = tokio::spawn(async move { s.empfangs_loop(shutdown_rx).await });

        // B meldet seine Adresse per Heartbeat
        let hb = cb.verschluesseln(&UdpNachricht::Heartbeat.encode()).unwrap();
        sock_b.send_to(&hb, server_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let audio = ca.verschluesseln(&UdpNachricht::Audio(vec![0xAB; 60]).encode()).unwrap();
        sock_a.send_to(&audio, server_addr).await.unwrap();

        let mut buf = [0u8; UDP_BUFFER_SIZE];
        let (len, von) = tokio::time::timeout(Duration::from_secs(2), sock_b.recv_from(&mut buf))
            .await
            .expect("Audio muss ankommen")
            .unwrap();
        assert_eq!(von, server_addr);
        let klartext = cb.entschluesseln(&buf[..len]).unwrap();
        assert_eq!(UdpNachricht::decode(&klartext).unwrap(), UdpNachricht::Audio(vec![0xAB; 60]));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
