//! Client-Registry
//!
//! Prozessweiter Index aller authentifizierten Sessions. Eintraege liegen in
//! einer Slot-Arena; die [`SessionId`] kodiert Slot und Generation, damit
//! eine veraltete ID nach Wiederbelegung eines Slots ins Leere greift.
//!
//! Nachschlagen in O(1) ueber Session-ID, UDP-Adresse und Rufzeichen.
//! Die Registry ist nicht selbst synchronisiert; sie liegt zusammen mit dem
//! Router hinter einem Mutex im [`Kern`](crate::kern::Kern).

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;
use reflector_core::types::{Callsign, SessionId, TalkGroup};
use reflector_crypto::UdpCipher;
use reflector_protocol::control::{ControlMessage, ProtoVersion, UdpSchluesselParameter};
use tokio::sync::mpsc;

use crate::error::{RoutingFehler, RoutingResult};
use crate::filter::Filter;
use crate::heartbeat::Herzschlag;

/// Maximale Anzahl Slots (16 Bit Slot-Index)
pub const MAX_SLOTS: usize = u16::MAX as usize;

// ---------------------------------------------------------------------------
// ClientEintrag
// ---------------------------------------------------------------------------

/// Zustand einer authentifizierten Session
#[derive(Debug)]
pub struct ClientEintrag {
    pub id: SessionId,
    pub callsign: Callsign,
    pub tcp_adresse: SocketAddr,
    /// Wird aus dem ersten gueltigen Datagramm gelernt
    pub udp_adresse: Option<SocketAddr>,
    pub version: ProtoVersion,
    /// Gewaehlte Gruppe (0 = keine)
    pub tg: TalkGroup,
    pub monitore: BTreeSet<TalkGroup>,
    pub cipher: UdpCipher,
    /// Ausgangs-Queue der TCP-Verbindung
    pub tx: mpsc::Sender<ControlMessage>,
    pub node_info: Option<serde_json::Value>,
    pub udp_herzschlag: Herzschlag,
    /// UDP gilt als verbunden (Flanke fuer Qualitaetsereignisse)
    pub udp_ok: bool,
    /// Sperre nach ueberlanger Sendung
    pub gesperrt_bis: Option<Instant>,
    pub verbunden_seit: Instant,
    pub letzte_signalstaerke: Option<(String, f32, bool)>,
}

impl ClientEintrag {
    /// Verbleibende Sperrzeit
    pub fn sperre_rest(&self, jetzt: Instant) -> Option<Duration> {
        self.gesperrt_bis
            .filter(|&bis| bis > jetzt)
            .map(|bis| bis - jetzt)
    }

    /// Legt eine Nachricht in die TCP-Queue
    ///
    /// Eine geschlossene Queue (Session im Abbau) ist kein Fehler.
    pub fn senden(&self, msg: ControlMessage) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(session = %self.id, callsign = %self.callsign, "Sende-Queue voll, Nachricht verworfen");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(session = %self.id, "Sende-Queue geschlossen (Session im Abbau)");
                false
            }
        }
    }
}

/// Daten fuer die Registrierung einer frisch authentifizierten Session
#[derive(Debug)]
pub struct NeueSession {
    pub callsign: Callsign,
    pub tcp_adresse: SocketAddr,
    pub version: ProtoVersion,
    pub tx: mpsc::Sender<ControlMessage>,
}

// ---------------------------------------------------------------------------
// ClientRegistry
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Slot {
    generation: u16,
    eintrag: Option<ClientEintrag>,
}

/// Arena aller Sessions mit drei Indizes
#[derive(Debug)]
pub struct ClientRegistry {
    slots: Vec<Slot>,
    frei: Vec<u16>,
    nach_adresse: HashMap<SocketAddr, SessionId>,
    nach_callsign: HashMap<Callsign, SessionId>,
    max_sessions: usize,
    udp_intervall: Duration,
    udp_timeout: Duration,
}

impl ClientRegistry {
    pub fn neu(max_sessions: usize, udp_intervall: Duration, udp_timeout: Duration) -> Self {
        Self {
            slots: Vec::new(),
            frei: Vec::new(),
            nach_adresse: HashMap::new(),
            nach_callsign: HashMap::new(),
            max_sessions: max_sessions.min(MAX_SLOTS),
            udp_intervall,
            udp_timeout,
        }
    }

    pub fn anzahl(&self) -> usize {
        self.nach_callsign.len()
    }

    /// Nimmt eine authentifizierte Session auf
    ///
    /// Erzeugt die Session-ID und das UDP-Schluesselmaterial.
    pub fn registrieren(
        &mut self,
        neu: NeueSession,
        jetzt: Instant,
    ) -> RoutingResult<(SessionId, UdpSchluesselParameter)> {
        if self.nach_callsign.contains_key(&neu.callsign) {
            return Err(RoutingFehler::RufzeichenBelegt(neu.callsign));
        }
        if self.anzahl() >= self.max_sessions {
            return Err(RoutingFehler::RegistryVoll(self.max_sessions));
        }

        let slot = match self.frei.pop() {
            Some(s) => s,
            None => {
                // Erste Generation eines Slots ist zufaellig
                self.slots.push(Slot {
                    generation: rand::thread_rng().gen(),
                    eintrag: None,
                });
                (self.slots.len() - 1) as u16
            }
        };
        let generation = self.slots[slot as usize].generation;
        let id = SessionId::aus_teilen(slot, generation);

        let (cipher, params) = match UdpCipher::erzeugen(id) {
            Ok(ok) => ok,
            Err(e) => {
                self.frei.push(slot);
                return Err(e.into());
            }
        };

        self.nach_callsign.insert(neu.callsign.clone(), id);
        self.slots[slot as usize].eintrag = Some(ClientEintrag {
            id,
            callsign: neu.callsign,
            tcp_adresse: neu.tcp_adresse,
            udp_adresse: None,
            version: neu.version,
            tg: TalkGroup::KEINE,
            monitore: BTreeSet::new(),
            cipher,
            tx: neu.tx,
            node_info: None,
            udp_herzschlag: Herzschlag::neu(self.udp_intervall, self.udp_timeout, jetzt),
            udp_ok: false,
            gesperrt_bis: None,
            verbunden_seit: jetzt,
            letzte_signalstaerke: None,
        });
        Ok((id, params))
    }

    /// Entfernt eine Session aus allen Indizes
    pub fn entfernen(&mut self, id: SessionId) -> Option<ClientEintrag> {
        let slot = self.slots.get_mut(id.slot() as usize)?;
        if slot.generation != id.generation() || slot.eintrag.is_none() {
            return None;
        }
        let eintrag = slot.eintrag.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.frei.push(id.slot());

        self.nach_callsign.remove(&eintrag.callsign);
        if let Some(addr) = eintrag.udp_adresse {
            self.nach_adresse.remove(&addr);
        }
        Some(eintrag)
    }

    pub fn get(&self, id: SessionId) -> Option<&ClientEintrag> {
        self.slots
            .get(id.slot() as usize)
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.eintrag.as_ref())
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut ClientEintrag> {
        self.slots
            .get_mut(id.slot() as usize)
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.eintrag.as_mut())
    }

    pub fn nach_adresse(&self, addr: &SocketAddr) -> Option<SessionId> {
        self.nach_adresse.get(addr).copied()
    }

    pub fn nach_callsign(&self, callsign: &Callsign) -> Option<SessionId> {
        self.nach_callsign.get(callsign).copied()
    }

    /// Setzt die UDP-Adresse einer Session (erstes Lernen oder NAT-Wechsel)
    pub fn udp_adresse_setzen(&mut self, id: SessionId, addr: SocketAddr) -> bool {
        let alt = match self.get_mut(id) {
            Some(e) => e.udp_adresse.replace(addr),
            None => return false,
        };
        if let Some(alt) = alt {
            self.nach_adresse.remove(&alt);
        }
        // Eine andere Session mit derselben Adresse verliert die Zuordnung
        if let Some(vorher) = self.nach_adresse.insert(addr, id) {
            if vorher != id {
                if let Some(e) = self.get_mut(vorher) {
                    e.udp_adresse = None;
                }
            }
        }
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientEintrag> {
        self.slots.iter().filter_map(|s| s.eintrag.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientEintrag> {
        self.slots.iter_mut().filter_map(|s| s.eintrag.as_mut())
    }

    /// IDs aller Sessions auf die der Filter passt
    pub fn auswaehlen(&self, filter: &Filter) -> Vec<SessionId> {
        self.iter().filter(|e| filter.passt(e)).map(|e| e.id).collect()
    }

    /// Sendet eine Control-Nachricht an alle passenden Sessions
    ///
    /// Gibt die Anzahl erfolgreich eingereihter Nachrichten zurueck.
    pub fn senden(&self, filter: &Filter, msg: &ControlMessage) -> usize {
        self.iter()
            .filter(|e| filter.passt(e))
            .filter(|e| e.senden(msg.clone()))
            .count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use reflector_protocol::control::ControlPayload;
    use std::net::{IpAddr, Ipv4Addr};

    pub(crate) fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    pub(crate) fn test_eintrag(slot: u16, callsign: &str) -> ClientEintrag {
        let id = SessionId::aus_teilen(slot, 1);
        let (cipher, _) = UdpCipher::erzeugen(id).unwrap();
        let (tx, _rx) = mpsc::channel(4);
        ClientEintrag {
            id,
            callsign: Callsign::neu(callsign).unwrap(),
            tcp_adresse: addr(1000 + slot),
            udp_adresse: None,
            version: ProtoVersion::neu(2, 1),
            tg: TalkGroup::KEINE,
            monitore: BTreeSet::new(),
            cipher,
            tx,
            node_info: None,
            udp_herzschlag: Herzschlag::neu(
                Duration::from_secs(15),
                Duration::from_secs(60),
                Instant::now(),
            ),
            udp_ok: false,
            gesperrt_bis: None,
            verbunden_seit: Instant::now(),
            letzte_signalstaerke: None,
        }
    }

    pub(crate) fn registry() -> ClientRegistry {
        ClientRegistry::neu(100, Duration::from_secs(15), Duration::from_secs(60))
    }

    pub(crate) fn neue_session(
        callsign: &str,
        port: u16,
    ) -> (NeueSession, mpsc::Receiver<ControlMessage>) {
        let (tx, rx) = mpsc::channel(32);
        (
            NeueSession {
                callsign: Callsign::neu(callsign).unwrap(),
                tcp_adresse: addr(port),
                version: ProtoVersion::neu(2, 1),
                tx,
            },
            rx,
        )
    }

    #[test]
    fn registrieren_und_nachschlagen() {
        let mut reg = registry();
        let (neu, _rx) = neue_session("DL1ABC", 5000);
        let (id, _) = reg.registrieren(neu, Instant::now()).unwrap();

        assert_eq!(reg.anzahl(), 1);
        assert_eq!(reg.nach_callsign(&Callsign::neu("dl1abc").unwrap()), Some(id));
        assert!(reg.get(id).is_some());
        assert!(reg.nach_adresse(&addr(6000)).is_none());

        assert!(reg.udp_adresse_setzen(id, addr(6000)));
        assert_eq!(reg.nach_adresse(&addr(6000)), Some(id));
    }

    #[test]
    fn rufzeichen_nur_einmal() {
        let mut reg = registry();
        let (a, _ra) = neue_session("DL1ABC", 5000);
        let (b, _rb) = neue_session("DL1ABC", 5001);
        reg.registrieren(a, Instant::now()).unwrap();
        assert!(matches!(
            reg.registrieren(b, Instant::now()),
            Err(RoutingFehler::RufzeichenBelegt(_))
        ));
    }

    #[test]
    fn veraltete_id_greift_ins_leere() {
        let mut reg = registry();
        let (a, _ra) = neue_session("DL1ABC", 5000);
        let (alt, _) = reg.registrieren(a, Instant::now()).unwrap();
        reg.udp_adresse_setzen(alt, addr(6000));
        assert!(reg.entfernen(alt).is_some());
        assert!(reg.nach_adresse(&addr(6000)).is_none());
        assert!(reg.entfernen(alt).is_none());

        let (b, _rb) = neue_session("SM0ABC", 5001);
        let (neu, _) = reg.registrieren(b, Instant::now()).unwrap();
        assert_eq!(neu.slot(), alt.slot(), "Slot wird wiederverwendet");
        assert_ne!(neu, alt);
        assert!(reg.get(alt).is_none());
        assert!(reg.get(neu).is_some());
    }

    #[test]
    fn nat_wechsel_aktualisiert_index() {
        let mut reg = registry();
        let (a, _ra) = neue_session("DL1ABC", 5000);
        let (id, _) = reg.registrieren(a, Instant::now()).unwrap();
        reg.udp_adresse_setzen(id, addr(6000));
        reg.udp_adresse_setzen(id, addr(6001));
        assert!(reg.nach_adresse(&addr(6000)).is_none());
        assert_eq!(reg.nach_adresse(&addr(6001)), Some(id));
    }

    #[test]
    fn obergrenze() {
        let mut reg = ClientRegistry::neu(1, Duration::from_secs(1), Duration::from_secs(1));
        let (a, _ra) = neue_session("DL1ABC", 5000);
        let (b, _rb) = neue_session("SM0ABC", 5001);
        reg.registrieren(a, Instant::now()).unwrap();
        assert!(matches!(
            reg.registrieren(b, Instant::now()),
            Err(RoutingFehler::RegistryVoll(1))
        ));
    }

    #[tokio::test]
    async fn senden_mit_filter_und_geschlossener_queue() {
        let mut reg = registry();
        let (a, mut ra) = neue_session("DL1ABC", 5000);
        let (b, rb) = neue_session("SM0ABC", 5001);
        let (ida, _) = reg.registrieren(a, Instant::now()).unwrap();
        let (idb, _) = reg.registrieren(b, Instant::now()).unwrap();
        reg.get_mut(ida).unwrap().tg = TalkGroup(42);
        drop(rb);

        let msg = ControlMessage::heartbeat();
        assert_eq!(reg.senden(&Filter::Gruppe(TalkGroup(42)), &msg), 1);
        assert_eq!(ra.recv().await.unwrap().payload, ControlPayload::Heartbeat);

        // B ist im Abbau: kein Fehler, nur nicht zugestellt
        assert_eq!(reg.senden(&Filter::Session(idb), &msg), 0);
        assert_eq!(reg.senden(&Filter::Alle, &msg), 1);
    }
}
