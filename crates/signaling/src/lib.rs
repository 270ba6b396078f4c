//! reflector-signaling – TCP/TLS Control Layer
//!
//! Dieser Crate implementiert die Control-Verbindung des Reflectors:
//! Versionsabgleich, TLS-Wechsel auf demselben Socket, Zertifikats- und
//! CSR-Austausch, Challenge-Response-Authentifizierung und danach die
//! Steuerbefehle der Knoten (Gruppe, Monitore, Sprechen, QSY).
//!
//! ## Architektur
//!
//! ```text
//! TCP Listener (SignalingServer)
//!     |
//!     v
//! ClientConnection (pro Verbindung ein Task, I/O + Fristen)
//!     |
//!     v
//! ClientSession (State Machine, frei von I/O)
//!     |  ErwarteProtoVersion -> ... -> ErwarteAuthAntwort -> Verbunden
//!     v
//! MessageDispatcher -> Kern (Registry + Talk-Group-Router)
//!
//! AdminSchnittstelle – Snapshots und Befehle fuer Betreiber
//! EreignisPublisher  – Event-Bus nach aussen
//! ```

pub mod admin;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod server_state;
pub mod tcp;

// Bequeme Re-Exporte
pub use admin::{
    erneuerungen_durchfuehren, publisher_starten, AdminAntwort, AdminSchnittstelle,
    EreignisPublisher, LogPublisher,
};
pub use connection::ClientConnection;
pub use dispatcher::MessageDispatcher;
pub use error::{SignalingError, SignalingResult};
pub use handshake::{ClientSession, Folge, SessionZustand};
pub use server_state::{SignalingConfig, SignalingState};
pub use tcp::SignalingServer;
