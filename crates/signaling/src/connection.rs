//! Client-Connection – Verwaltet eine einzelne TCP-Verbindung
//!
//! Jede TCP-Verbindung bekommt eine `ClientConnection` in einem eigenen
//! tokio-Task. Das Protokoll steckt in der [`ClientSession`]; hier passiert
//! nur I/O: Frames lesen, Antworten und Broadcasts schreiben, Heartbeats,
//! Fristen und der TLS-Wechsel.
//!
//! ## Ablauf
//! ```text
//! TcpStream (Klartext)  proto_ver, ca_bundle_request, start_encryption_request
//!     |
//!     v  start_encryption gesendet, TLS-Accept auf demselben Socket
//! TlsStream<TcpStream>  Zertifikat, Challenge, Steuerbefehle, Broadcasts
//! ```
//!
//! ## Keepalive
//! - Server sendet alle `tcp_heartbeat_intervall` einen Heartbeat
//! - Ohne eingehenden Verkehr innerhalb von `tcp_heartbeat_timeout` wird getrennt

use futures_util::{SinkExt, StreamExt};
use reflector_protocol::control::{ControlMessage, ErrorCode};
use reflector_protocol::wire::FrameCodec;
use reflector_voice::Herzschlag;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit};
use tokio_util::codec::Framed;

use crate::error::SignalingError;
use crate::handshake::{ClientSession, Folge};
use crate::server_state::SignalingState;

/// Kapazitaet der Sende-Queue pro Verbindung
const SENDE_QUEUE: usize = 256;

/// Warum eine Verbindungsphase endete
#[derive(Debug, PartialEq, Eq)]
enum Ende {
    TlsStarten,
    Geschlossen(&'static str),
}

/// Zeitliche Verbindungsdaten ueber beide Phasen hinweg
struct Verbindungszustand {
    herzschlag: Herzschlag,
    /// Gesetzt sobald die Session eine Trennung verlangt
    trennung_frist: Option<Instant>,
    /// Platz unter den unauthentifizierten Verbindungen
    platz: Option<OwnedSemaphorePermit>,
}

// ---------------------------------------------------------------------------
// ClientConnection
// ---------------------------------------------------------------------------

/// Verarbeitet eine einzelne TCP-Verbindung
pub struct ClientConnection {
    state: Arc<SignalingState>,
    peer_addr: SocketAddr,
}

impl ClientConnection {
    pub fn neu(state: Arc<SignalingState>, peer_addr: SocketAddr) -> Self {
        Self { state, peer_addr }
    }

    /// Startet die Verbindungs-Verarbeitung
    ///
    /// Laeuft bis die Verbindung getrennt wird oder ein Shutdown-Signal
    /// eingeht. Die Session wird in jedem Fall aus dem Kern entfernt.
    pub async fn verarbeiten(
        self,
        stream: TcpStream,
        platz: OwnedSemaphorePermit,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let peer_addr = self.peer_addr;
        tracing::info!(peer = %peer_addr, "Neue Verbindung");

        let (sende_tx, mut sende_rx) = mpsc::channel::<ControlMessage>(SENDE_QUEUE);
        let mut session = ClientSession::neu(Arc::clone(&self.state), peer_addr, sende_tx);
        let config = &self.state.config;
        let mut zustand = Verbindungszustand {
            herzschlag: Herzschlag::neu(
                config.tcp_heartbeat_intervall,
                config.tcp_heartbeat_timeout,
                Instant::now(),
            ),
            trennung_frist: None,
            platz: Some(platz),
        };

        // Phase 1: Klartext bis start_encryption
        let mut framed = Framed::new(stream, FrameCodec::new());
        let ende = self
            .schleife(&mut framed, &mut session, &mut sende_rx, &mut zustand, &mut shutdown_rx)
            .await;

        let grund = match ende {
            Ende::Geschlossen(grund) => grund,
            Ende::TlsStarten => match self.tls_phase(framed, &mut session, &mut sende_rx, &mut zustand, &mut shutdown_rx).await {
                Ok(grund) => grund,
                Err(e) => {
                    tracing::warn!(peer = %peer_addr, fehler = %e, "TLS-Aufbau fehlgeschlagen");
                    "TLS-Fehler"
                }
            },
        };

        session.beenden(grund);
        tracing::info!(peer = %peer_addr, grund, "Verbindungs-Task beendet");
    }

    /// Phase 2: TLS auf demselben Socket aushandeln und weiterlaufen
    async fn tls_phase(
        &self,
        framed: Framed<TcpStream, FrameCodec>,
        session: &mut ClientSession,
        sende_rx: &mut mpsc::Receiver<ControlMessage>,
        zustand: &mut Verbindungszustand,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<&'static str, SignalingError> {
        let teile = framed.into_parts();
        // Klartext der nach start_encryption_request kam wuerde im TLS verloren gehen
        if !teile.read_buf.is_empty() {
            return Err(SignalingError::protokoll("Daten vor dem TLS-Handshake"));
        }

        let acceptor = self.state.tls_acceptor();
        let tls = tokio::time::timeout(self.state.config.tls_timeout, acceptor.accept(teile.io))
            .await
            .map_err(|_| SignalingError::Timeout)??;
        tracing::debug!(peer = %self.peer_addr, "TLS-Handshake abgeschlossen");

        let mut framed = Framed::new(tls, teile.codec);
        for nachricht in session.tls_aktiv()? {
            framed.send(nachricht).await?;
        }
        zustand.herzschlag.empfangen(Instant::now());

        match self.schleife(&mut framed, session, sende_rx, zustand, shutdown_rx).await {
            Ende::Geschlossen(grund) => Ok(grund),
            Ende::TlsStarten => Err(SignalingError::protokoll("TLS bereits aktiv")),
        }
    }

    /// Haupt-Loop einer Phase
    async fn schleife<S>(
        &self,
        framed: &mut Framed<S, FrameCodec>,
        session: &mut ClientSession,
        sende_rx: &mut mpsc::Receiver<ControlMessage>,
        zustand: &mut Verbindungszustand,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Ende
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let peer_addr = self.peer_addr;

        loop {
            let jetzt = Instant::now();

            if zustand.herzschlag.abgelaufen(jetzt) {
                tracing::warn!(peer = %peer_addr, callsign = ?session.callsign(), "TCP-Heartbeat-Timeout");
                return Ende::Geschlossen("Heartbeat-Timeout");
            }
            if zustand.trennung_frist.is_some_and(|frist| jetzt >= frist) {
                tracing::debug!(peer = %peer_addr, "Gegenseite hat nicht getrennt, Verbindung wird geschlossen");
                return Ende::Geschlossen("Trennung");
            }
            if zustand.herzschlag.senden_faellig(jetzt) {
                if let Err(e) = framed.send(ControlMessage::heartbeat()).await {
                    tracing::warn!(peer = %peer_addr, fehler = %e, "Heartbeat-Senden fehlgeschlagen");
                    return Ende::Geschlossen("Sendefehler");
                }
                zustand.herzschlag.gesendet(jetzt);
            }

            let mut weckzeit = zustand
                .herzschlag
                .frist()
                .min(zustand.herzschlag.naechster_versand());
            if let Some(frist) = zustand.trennung_frist {
                weckzeit = weckzeit.min(frist);
            }
            let verbunden = session.ist_verbunden();

            tokio::select! {
                // Eingehende Nachricht vom Knoten
                frame = framed.next() => {
                    match frame {
                        Some(Ok(nachricht)) => {
                            let jetzt = Instant::now();
                            zustand.herzschlag.empfangen(jetzt);
                            tracing::trace!(
                                peer = %peer_addr,
                                request_id = nachricht.request_id,
                                typ = nachricht.payload.name(),
                                "Nachricht empfangen"
                            );

                            let schritt = session.verarbeiten(nachricht, jetzt);
                            for antwort in schritt.antworten {
                                if let Err(e) = framed.send(antwort).await {
                                    tracing::warn!(peer = %peer_addr, fehler = %e, "Senden fehlgeschlagen");
                                    return Ende::Geschlossen("Sendefehler");
                                }
                            }
                            if session.ist_verbunden() {
                                zustand.platz = None;
                            }

                            match schritt.folge {
                                Folge::Weiter => {}
                                Folge::TlsStarten => return Ende::TlsStarten,
                                Folge::Schliessen => return Ende::Geschlossen("Abmeldung"),
                                Folge::Trennen => {
                                    zustand
                                        .trennung_frist
                                        .get_or_insert(jetzt + self.state.config.trennung_timeout);
                                }
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(peer = %peer_addr, fehler = %e, "Frame-Lesefehler");
                            let fehler = ControlMessage::error(0, ErrorCode::ProtocolViolation, e.to_string());
                            let _ = framed.send(fehler).await;
                            return Ende::Geschlossen("Protokollverletzung");
                        }
                        None => {
                            tracing::info!(peer = %peer_addr, "Verbindung vom Knoten getrennt");
                            return Ende::Geschlossen("Verbindung geschlossen");
                        }
                    }
                }

                // Broadcasts aus der Registry
                ausgehend = sende_rx.recv(), if verbunden => {
                    match ausgehend {
                        Some(nachricht) => {
                            if let Err(e) = framed.send(nachricht).await {
                                tracing::warn!(peer = %peer_addr, fehler = %e, "Broadcast-Senden fehlgeschlagen");
                                return Ende::Geschlossen("Sendefehler");
                            }
                        }
                        // Registry hat den Eintrag entfernt (Admin-Trennung)
                        None => {
                            tracing::info!(peer = %peer_addr, callsign = ?session.callsign(), "Session vom Server beendet");
                            return Ende::Geschlossen("vom Server getrennt");
                        }
                    }
                }

                _ = tokio::time::sleep_until(weckzeit.into()) => {}

                // Shutdown-Signal
                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!(peer = %peer_addr, "Shutdown-Signal – Verbindung wird getrennt");
                        let abschied = ControlMessage::error(
                            0,
                            ErrorCode::InternalError,
                            "Server wird heruntergefahren",
                        );
                        let _ = framed.send(abschied).await;
                        return Ende::Geschlossen("Shutdown");
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
