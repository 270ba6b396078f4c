//! TCP-Listener – Bindet Socket, akzeptiert Verbindungen
//!
//! Der `SignalingServer` bindet einen TCP-Socket und startet fuer jede
//! eingehende Verbindung einen eigenen tokio-Task mit einer `ClientConnection`.
//! Verbindungen ohne freien Platz unter den unauthentifizierten bekommen
//! `server_busy` und werden geschlossen.

use futures_util::SinkExt;
use reflector_protocol::control::{ControlMessage, ErrorCode};
use reflector_protocol::wire::FrameCodec;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::Framed;

use crate::connection::ClientConnection;
use crate::server_state::SignalingState;

/// TCP-Signaling-Server
pub struct SignalingServer {
    state: Arc<SignalingState>,
    listener: TcpListener,
}

impl SignalingServer {
    /// Bindet den TCP-Socket
    pub async fn binden(addr: SocketAddr, state: Arc<SignalingState>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(adresse = %listener.local_addr()?, "TCP Signaling-Server gebunden");
        Ok(Self { state, listener })
    }

    pub fn lokale_adresse(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept-Loop bis `shutdown_rx` ein `true`-Signal empfaengt
    pub async fn starten(self, mut shutdown_rx: watch::Receiver<bool>) -> std::io::Result<()> {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => self.annehmen(stream, peer_addr, shutdown_rx.clone()),
                        Err(e) => {
                            tracing::error!(fehler = %e, "TCP-Accept-Fehler");
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        }
                    }
                }

                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Signaling-Server: Shutdown-Signal empfangen");
                        break;
                    }
                }
            }
        }

        tracing::info!("TCP Signaling-Server gestoppt");
        Ok(())
    }

    fn annehmen(&self, stream: TcpStream, peer_addr: SocketAddr, shutdown_rx: watch::Receiver<bool>) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer_addr, fehler = %e, "TCP_NODELAY nicht gesetzt");
        }

        let Some(platz) = self.state.platz_reservieren() else {
            tracing::warn!(
                peer = %peer_addr,
                max = self.state.config.max_unauthentifiziert,
                "Zu viele unauthentifizierte Verbindungen – abgelehnt"
            );
            let frist = self.state.config.tls_timeout;
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, FrameCodec::new());
                let busy = ControlMessage::error(0, ErrorCode::ServerBusy, "Server ausgelastet");
                match tokio::time::timeout(frist, framed.send(busy)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(peer = %peer_addr, fehler = %e, "server_busy nicht gesendet");
                    }
                    Err(_) => {
                        tracing::debug!(peer = %peer_addr, "server_busy: Frist abgelaufen, Verbindung verworfen");
                    }
                }
            });
            return;
        };

        tracing::debug!(peer = %peer_addr, "Verbindung akzeptiert");
        let verbindung = ClientConnection::neu(Arc::clone(&self.state), peer_addr);
        tokio::spawn(async move {
            verbindung.verarbeiten(stream, platz, shutdown_rx).await;
        });
    }
}
