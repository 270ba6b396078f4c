//! reflector-core – Gemeinsame Typen, Ereignisse und Fehlertypen
//!
//! Dieses Crate stellt die fundamentalen Bausteine bereit, die von allen
//! anderen Reflector-Crates gemeinsam genutzt werden.

pub mod error;
pub mod event;
pub mod types;

// Re-Exporte fuer bequemen Zugriff
pub use error::{ReflectorError, Result};
pub use event::{BroadcastEventBus, EventBus, ReflectorEvent};
pub use types::{Callsign, SessionId, TalkGroup};
