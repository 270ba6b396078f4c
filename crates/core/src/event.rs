//! Ereignis-Bus
//!
//! Geschlossene Menge von Reflector-Ereignissen, die ueber eine einzige
//! geordnete Queue an Beobachter (Admin-Schnittstelle, Publisher) gehen.
//! Die Standard-Implementierung nutzt `tokio::sync::broadcast`.

use crate::types::{Callsign, SessionId, TalkGroup};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Alle systemweiten Ereignisse die ueber den Event-Bus fliessen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ereignis", rename_all = "snake_case")]
pub enum ReflectorEvent {
    /// Knoten hat sich authentifiziert und ist registriert
    KnotenVerbunden {
        session_id: SessionId,
        callsign: Callsign,
    },
    /// Knoten wurde getrennt
    KnotenGetrennt {
        session_id: SessionId,
        callsign: Callsign,
        grund: String,
    },
    /// Sprecher einer Gruppe hat gewechselt (`callsign: None` = frei)
    SprecherGeaendert {
        tg: TalkGroup,
        callsign: Option<Callsign>,
    },
    /// Client-Zertifikat ausgestellt
    ZertifikatAusgestellt { callsign: Callsign, serial: String },
    /// Client- oder Ausstellerzertifikat erneuert
    ZertifikatErneuert { subjekt: String, serial: String },
    /// Zertifikat widerrufen
    ZertifikatWiderrufen { callsign: Callsign },
    /// UDP-Heartbeat eines Knotens ausgeblieben (nicht fatal)
    UdpQualitaet {
        session_id: SessionId,
        callsign: Callsign,
        verbindung_ok: bool,
    },
}

/// Trait fuer den Event-Bus
pub trait EventBus: Send + Sync + 'static {
    /// Sendet ein Ereignis an alle Abonnenten
    ///
    /// Fehlende Abonnenten sind kein Fehler.
    fn senden(&self, event: ReflectorEvent);

    /// Abonniert alle zukuenftigen Ereignisse
    fn abonnieren(&self) -> broadcast::Receiver<ReflectorEvent>;
}

/// Event-Bus auf Basis eines tokio broadcast-Kanals
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    tx: broadcast::Sender<ReflectorEvent>,
}

impl BroadcastEventBus {
    /// Erstellt einen neuen Bus mit der angegebenen Puffer-Kapazitaet
    pub fn neu(kapazitaet: usize) -> Self {
        let (tx, _) = broadcast::channel(kapazitaet.max(1));
        Self { tx }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::neu(256)
    }
}

impl EventBus for BroadcastEventBus {
    fn senden(&self, event: ReflectorEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Ereignis ohne Abonnenten verworfen");
        }
    }

    fn abonnieren(&self) -> broadcast::Receiver<ReflectorEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ist_serde_kompatibel() {
        let event = ReflectorEvent::SprecherGeaendert {
            tg: TalkGroup(42),
            callsign: Some(Callsign::neu("DL1ABC").unwrap()),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"ereignis\":\"sprecher_geaendert\""));
        let zurueck: ReflectorEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(zurueck, event);
    }

    #[tokio::test]
    async fn bus_liefert_in_reihenfolge() {
        let bus = BroadcastEventBus::default();
        let mut rx = bus.abonnieren();
        let cs = Callsign::neu("SM0XYZ").unwrap();
        bus.senden(ReflectorEvent::KnotenVerbunden {
            session_id: SessionId(1),
            callsign: cs.clone(),
        });
        bus.senden(ReflectorEvent::ZertifikatWiderrufen { callsign: cs });
        assert!(matches!(
            rx.recv().await.unwrap(),
            ReflectorEvent::KnotenVerbunden { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            ReflectorEvent::ZertifikatWiderrufen { .. }
        ));
    }

    #[test]
    fn senden_ohne_abonnenten_ist_kein_fehler() {
        let bus = BroadcastEventBus::neu(4);
        bus.senden(ReflectorEvent::ZertifikatErneuert {
            subjekt: "issuing".into(),
            serial: "01".into(),
        });
    }
}
