//! reflector-voice – Registry, Floor-Vergabe und UDP-Weiterleitung
//!
//! ## Module
//! - [`registry`] – Client-Registry (Slot-Arena mit Indizes nach ID, Adresse, Rufzeichen)
//! - [`filter`] – Kombinierbare Broadcast-Filter
//! - [`talkgroup`] – Talk-Group-Router und Floor-Arbiter inklusive QSY
//! - [`heartbeat`] – Liveness-Verfolgung fuer TCP und UDP
//! - [`kern`] – Gemeinsamer Zustand hinter einem Mutex
//! - [`udp`] – UDP-Server fuer Audio-Datagramme

pub mod error;
pub mod filter;
pub mod heartbeat;
pub mod kern;
pub mod registry;
pub mod talkgroup;
pub mod udp;

pub use error::{RoutingFehler, RoutingResult};
pub use filter::Filter;
pub use heartbeat::Herzschlag;
pub use kern::{Kern, KernConfig, KnotenInfo};
pub use registry::{ClientEintrag, ClientRegistry, NeueSession};
pub use talkgroup::{RouterConfig, SprechErgebnis, TalkGroupRouter};
pub use udp::UdpServer;
