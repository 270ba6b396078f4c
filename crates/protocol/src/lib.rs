//! reflector-protocol – Netzwerkprotokoll-Definitionen
//!
//! Dieses Crate definiert die Control-Nachrichten der TCP-Verbindung, deren
//! Frame-Codec sowie das binaere Format der verschluesselten UDP-Datagramme.

pub mod control;
pub mod datagram;
pub mod wire;

pub use control::{ControlMessage, ControlPayload, ErrorCode, ProtoVersion};
pub use datagram::{DatagrammKopf, UdpNachricht};
pub use wire::FrameCodec;
