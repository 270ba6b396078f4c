//! Talk-Group-Router und Floor-Vergabe
//!
//! Pro Talk-Group haelt der Router hoechstens einen aktuellen Sprecher.
//! Die Vergabe ist strikt first-come-first-served ohne Vorrang oder
//! Verdraengung. Mitgliedschaft und Mithoeren stehen in der
//! [`ClientRegistry`]; der Router leitet daraus nur den Sprecherzustand ab.
//!
//! ## Zeitverhalten
//!
//! - Wer laenger als `max_sendezeit` sendet, verliert das Rederecht und wird
//!   fuer `sperrzeit` gesperrt.
//! - Ein Sprecher ohne Audio fuer `sprecher_timeout` verliert das
//!   Rederecht ohne Sperre.
//!
//! Alle Zeitpunkte kommen als Argument herein, damit Tests ohne Schlafen
//! auskommen.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use rand::Rng;
use reflector_core::event::{EventBus, ReflectorEvent};
use reflector_core::types::{Callsign, SessionId, TalkGroup};
use reflector_protocol::control::{ControlMessage, ControlPayload};

use crate::error::{RoutingFehler, RoutingResult};
use crate::filter::Filter;
use crate::registry::ClientRegistry;

/// Zufallsversuche bevor der QSY-Pool linear durchsucht wird
const QSY_ZUFALLSVERSUCHE: usize = 16;

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Zeit- und Pool-Parameter des Routers
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_sendezeit: Duration,
    pub sperrzeit: Duration,
    pub sprecher_timeout: Duration,
    /// Erste Gruppennummer des QSY-Pools
    pub qsy_pool_start: u32,
    pub qsy_pool_groesse: u32,
    /// Gruppen die per QSY nicht erreichbar sind
    pub verbotene: BTreeSet<TalkGroup>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_sendezeit: Duration::from_secs(300),
            sperrzeit: Duration::from_secs(60),
            sprecher_timeout: Duration::from_secs(10),
            qsy_pool_start: 90_000,
            qsy_pool_groesse: 10_000,
            verbotene: BTreeSet::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Typen
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Sprecher {
    id: SessionId,
    callsign: Callsign,
    seit: Instant,
    letztes_audio: Instant,
}

/// Ergebnis einer Sprechanfrage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SprechErgebnis {
    Erteilt,
    /// Gruppe ist durch eine andere Session belegt
    Verweigert,
    /// Session ist noch fuer die angegebene Dauer gesperrt
    Gesperrt(Duration),
}

/// Floor-Arbiter ueber alle Talk-Groups
#[derive(Debug)]
pub struct TalkGroupRouter {
    config: RouterConfig,
    sprecher: HashMap<TalkGroup, Sprecher>,
}

impl TalkGroupRouter {
    pub fn neu(config: RouterConfig) -> Self {
        Self {
            config,
            sprecher: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Aktueller Sprecher einer Gruppe
    pub fn sprecher(&self, tg: TalkGroup) -> Option<SessionId> {
        self.sprecher.get(&tg).map(|s| s.id)
    }

    /// Gruppe in der die Session das Rederecht haelt
    pub fn spricht_in(&self, id: SessionId) -> Option<TalkGroup> {
        self.sprecher
            .iter()
            .find(|(_, s)| s.id == id)
            .map(|(tg, _)| *tg)
    }

    /// Gruppen mit mindestens einem Mitglied oder einem Sprecher
    pub fn aktive_gruppen(&self, reg: &ClientRegistry) -> BTreeSet<TalkGroup> {
        reg.iter()
            .map(|e| e.tg)
            .filter(|tg| !tg.ist_keine())
            .chain(self.sprecher.keys().copied())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Gruppenwahl
    // -----------------------------------------------------------------------

    /// Setzt die gewaehlte Gruppe einer Session
    ///
    /// Haelt die Session das Rederecht auf ihrer bisherigen Gruppe, wird es
    /// freigegeben. Spricht auf der neuen Gruppe gerade jemand, erfaehrt die
    /// Session das sofort.
    pub fn gruppe_waehlen(
        &mut self,
        reg: &mut ClientRegistry,
        events: &dyn EventBus,
        id: SessionId,
        tg: TalkGroup,
    ) -> RoutingResult<()> {
        let e = reg.get_mut(id).ok_or(RoutingFehler::SessionNichtGefunden(id))?;
        let alt = std::mem::replace(&mut e.tg, tg);
        tracing::debug!(session = %id, alt = alt.0, neu = tg.0, "Talk-Group gewaehlt");

        if alt != tg {
            if let Some(sprech_tg) = self.spricht_in(id) {
                if sprech_tg == alt {
                    self.freigeben_gruppe(reg, events, alt);
                }
            }
        }
        self.sprecher_melden(reg, id, tg);
        Ok(())
    }

    /// Ersetzt die Menge der mitgehoerten Gruppen
    pub fn monitore_setzen(
        &mut self,
        reg: &mut ClientRegistry,
        id: SessionId,
        tgs: impl IntoIterator<Item = TalkGroup>,
    ) -> RoutingResult<()> {
        let e = reg.get_mut(id).ok_or(RoutingFehler::SessionNichtGefunden(id))?;
        e.monitore = tgs.into_iter().filter(|tg| !tg.ist_keine()).collect();
        tracing::debug!(session = %id, anzahl = e.monitore.len(), "Monitor-Gruppen gesetzt");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Rederecht
    // -----------------------------------------------------------------------

    /// Explizite Sprechanfrage (`talk_request`)
    ///
    /// Ablehnung und Sperre werden der Session per Control-Nachricht
    /// mitgeteilt.
    pub fn sprechen_anfordern(
        &mut self,
        reg: &mut ClientRegistry,
        events: &dyn EventBus,
        id: SessionId,
        jetzt: Instant,
    ) -> RoutingResult<SprechErgebnis> {
        self.anfordern(reg, events, id, jetzt, true)
    }

    /// Gibt das Rederecht der Session frei, falls sie es haelt
    pub fn sprechen_freigeben(
        &mut self,
        reg: &mut ClientRegistry,
        events: &dyn EventBus,
        id: SessionId,
    ) -> Option<TalkGroup> {
        let tg = self.spricht_in(id)?;
        self.freigeben_gruppe(reg, events, tg);
        Some(tg)
    }

    /// Audio von einer Session
    ///
    /// Gibt die Gruppe zurueck, an deren Hoerer das Audio gehen darf. Audio
    /// ohne Rederecht gilt als implizite Sprechanfrage; eine Ablehnung wird
    /// nicht gemeldet, das Audio nur verworfen.
    pub fn audio(
        &mut self,
        reg: &mut ClientRegistry,
        events: &dyn EventBus,
        id: SessionId,
        jetzt: Instant,
    ) -> Option<TalkGroup> {
        let tg = reg.get(id)?.tg;
        if let Some(s) = self.sprecher.get_mut(&tg) {
            if s.id == id {
                s.letztes_audio = jetzt;
                return Some(tg);
            }
        }
        match self.anfordern(reg, events, id, jetzt, false) {
            Ok(SprechErgebnis::Erteilt) => Some(tg),
            _ => None,
        }
    }

    fn anfordern(
        &mut self,
        reg: &mut ClientRegistry,
        events: &dyn EventBus,
        id: SessionId,
        jetzt: Instant,
        melden: bool,
    ) -> RoutingResult<SprechErgebnis> {
        let e = reg.get(id).ok_or(RoutingFehler::SessionNichtGefunden(id))?;
        let tg = e.tg;
        if tg.ist_keine() {
            return Err(RoutingFehler::KeineGruppe);
        }

        if let Some(rest) = e.sperre_rest(jetzt) {
            if melden {
                e.senden(ControlMessage::push(ControlPayload::TalkBlocked {
                    secs: aufgerundete_sekunden(rest),
                }));
            }
            tracing::debug!(session = %id, tg = tg.0, rest_sek = rest.as_secs(), "Sprechanfrage gesperrt");
            return Ok(SprechErgebnis::Gesperrt(rest));
        }

        match self.sprecher.get(&tg) {
            Some(s) if s.id == id => return Ok(SprechErgebnis::Erteilt),
            Some(s) => {
                if melden {
                    e.senden(ControlMessage::push(ControlPayload::TalkDenied {
                        tg,
                        reason: format!("Gruppe belegt durch {}", s.callsign),
                    }));
                }
                tracing::debug!(session = %id, tg = tg.0, sprecher = %s.callsign, "Sprechanfrage abgelehnt");
                return Ok(SprechErgebnis::Verweigert);
            }
            None => {}
        }

        let callsign = e.callsign.clone();
        self.sprecher.insert(
            tg,
            Sprecher {
                id,
                callsign: callsign.clone(),
                seit: jetzt,
                letztes_audio: jetzt,
            },
        );
        tracing::info!(callsign = %callsign, tg = tg.0, "Rederecht erteilt");

        reg.senden(
            &Filter::hoerer(tg),
            &ControlMessage::push(ControlPayload::TalkerStart {
                tg,
                callsign: callsign.clone(),
            }),
        );
        events.senden(ReflectorEvent::SprecherGeaendert {
            tg,
            callsign: Some(callsign),
        });
        Ok(SprechErgebnis::Erteilt)
    }

    fn freigeben_gruppe(&mut self, reg: &ClientRegistry, events: &dyn EventBus, tg: TalkGroup) {
        let Some(s) = self.sprecher.remove(&tg) else {
            return;
        };
        tracing::info!(callsign = %s.callsign, tg = tg.0, "Rederecht freigegeben");
        reg.senden(
            &Filter::hoerer(tg),
            &ControlMessage::push(ControlPayload::TalkerStop {
                tg,
                callsign: s.callsign,
            }),
        );
        events.senden(ReflectorEvent::SprecherGeaendert { tg, callsign: None });
    }

    /// Teilt einer Session den aktuellen Sprecher ihrer Gruppe mit
    fn sprecher_melden(&self, reg: &ClientRegistry, id: SessionId, tg: TalkGroup) {
        if let (Some(s), Some(e)) = (self.sprecher.get(&tg), reg.get(id)) {
            if s.id != id {
                e.senden(ControlMessage::push(ControlPayload::TalkerStart {
                    tg,
                    callsign: s.callsign.clone(),
                }));
            }
        }
    }

    // -----------------------------------------------------------------------
    // QSY
    // -----------------------------------------------------------------------

    /// Verlegt die Session und alle Mitglieder ihrer Gruppe auf eine neue
    /// Gruppe
    ///
    /// `tg = 0` waehlt eine freie Gruppe aus dem QSY-Pool. Ein QSY vergibt
    /// nie das Rederecht.
    ///
    /// Mithoerer der alten Gruppe werden nicht verlegt: sie behalten die alte
    /// Gruppe in ihrer Monitor-Menge und hoeren die neue zusaetzlich. Ihre
    /// gewaehlte Gruppe bleibt unveraendert und sie bekommen kein `qsy`.
    pub fn qsy_anfordern(
        &mut self,
        reg: &mut ClientRegistry,
        events: &dyn EventBus,
        id: SessionId,
        tg: TalkGroup,
    ) -> RoutingResult<TalkGroup> {
        let alt = reg.get(id).ok_or(RoutingFehler::SessionNichtGefunden(id))?.tg;

        let ziel = if tg.ist_keine() {
            self.freie_gruppe(reg)?
        } else if self.config.verbotene.contains(&tg) {
            return Err(RoutingFehler::GruppeVerboten(tg));
        } else {
            tg
        };

        let mut mitglieder = if alt.ist_keine() {
            Vec::new()
        } else {
            reg.auswaehlen(&Filter::Gruppe(alt))
        };
        if !mitglieder.contains(&id) {
            mitglieder.push(id);
        }
        let mithoerer = if alt.ist_keine() {
            Vec::new()
        } else {
            reg.auswaehlen(&Filter::Monitor(alt).und(Filter::Gruppe(alt).nicht()))
        };

        if alt != ziel {
            self.freigeben_gruppe(reg, events, alt);
        }

        for &m in &mitglieder {
            if let Some(e) = reg.get_mut(m) {
                e.tg = ziel;
                e.senden(ControlMessage::push(ControlPayload::Qsy { tg: ziel }));
            }
            self.sprecher_melden(reg, m, ziel);
        }
        for &m in &mithoerer {
            if let Some(e) = reg.get_mut(m) {
                e.monitore.insert(ziel);
            }
        }

        tracing::info!(
            session = %id,
            alt = alt.0,
            neu = ziel.0,
            mitglieder = mitglieder.len(),
            mithoerer = mithoerer.len(),
            "QSY durchgefuehrt"
        );
        Ok(ziel)
    }

    /// Zieht eine nicht aktive, nicht verbotene Gruppe aus dem QSY-Pool
    fn freie_gruppe(&self, reg: &ClientRegistry) -> RoutingResult<TalkGroup> {
        let start = self.config.qsy_pool_start;
        let groesse = self.config.qsy_pool_groesse;
        if groesse == 0 {
            return Err(RoutingFehler::QsyPoolErschoepft);
        }
        let aktiv = self.aktive_gruppen(reg);
        let frei = |tg: &TalkGroup| {
            !tg.ist_keine() && !aktiv.contains(tg) && !self.config.verbotene.contains(tg)
        };

        let mut rng = rand::thread_rng();
        for _ in 0..QSY_ZUFALLSVERSUCHE {
            let tg = TalkGroup(start.wrapping_add(rng.gen_range(0..groesse)));
            if frei(&tg) {
                return Ok(tg);
            }
        }
        (0..groesse)
            .map(|i| TalkGroup(start.wrapping_add(i)))
            .find(frei)
            .ok_or(RoutingFehler::QsyPoolErschoepft)
    }

    // -----------------------------------------------------------------------
    // Zeitsteuerung und Abbau
    // -----------------------------------------------------------------------

    /// Prueft Sendezeit-Limit und Sprecher-Timeout
    pub fn tick(&mut self, reg: &mut ClientRegistry, events: &dyn EventBus, jetzt: Instant) {
        let mut ueberlang = Vec::new();
        let mut untaetig = Vec::new();
        for (tg, s) in &self.sprecher {
            if jetzt.saturating_duration_since(s.seit) >= self.config.max_sendezeit {
                ueberlang.push((*tg, s.id));
            } else if jetzt.saturating_duration_since(s.letztes_audio) >= self.config.sprecher_timeout {
                untaetig.push(*tg);
            }
        }

        for (tg, id) in ueberlang {
            self.freigeben_gruppe(reg, events, tg);
            if let Some(e) = reg.get_mut(id) {
                e.gesperrt_bis = Some(jetzt + self.config.sperrzeit);
                tracing::warn!(callsign = %e.callsign, tg = tg.0, sperre_sek = self.config.sperrzeit.as_secs(), "Sendezeit ueberschritten, Session gesperrt");
                e.senden(ControlMessage::push(ControlPayload::TalkBlocked {
                    secs: aufgerundete_sekunden(self.config.sperrzeit),
                }));
            }
        }
        for tg in untaetig {
            tracing::debug!(tg = tg.0, "Sprecher-Timeout");
            self.freigeben_gruppe(reg, events, tg);
        }
    }

    /// Gibt alles frei, was eine Session haelt (vor dem Entfernen aufrufen)
    pub fn session_entfernen(&mut self, reg: &ClientRegistry, events: &dyn EventBus, id: SessionId) {
        if let Some(tg) = self.spricht_in(id) {
            self.freigeben_gruppe(reg, events, tg);
        }
    }

    /// Jeder Sprecher hat seine Gruppe gewaehlt und ist registriert
    pub fn konsistent(&self, reg: &ClientRegistry) -> bool {
        self.sprecher
            .iter()
            .all(|(tg, s)| reg.get(s.id).is_some_and(|e| e.tg == *tg))
    }
}

fn aufgerundete_sekunden(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{neue_session, registry};
    use reflector_core::event::BroadcastEventBus;
    use tokio::sync::mpsc;

    struct Aufbau {
        reg: ClientRegistry,
        router: TalkGroupRouter,
        events: BroadcastEventBus,
        t0: Instant,
    }

    impl Aufbau {
        fn neu(config: RouterConfig) -> Self {
            Self {
                reg: registry(),
                router: TalkGroupRouter::neu(config),
                events: BroadcastEventBus::default(),
                t0: Instant::now(),
            }
        }

        fn session(&mut self, callsign: &str, tg: u32) -> (SessionId, mpsc::Receiver<ControlMessage>) {
            let (neu, rx) = neue_session(callsign, 5000);
            let (id, _) = self.reg.registrieren(neu, self.t0).unwrap();
            self.router
                .gruppe_waehlen(&mut self.reg, &self.events, id, TalkGroup(tg))
                .unwrap();
            (id, rx)
        }

        fn anfordern(&mut self, id: SessionId, nach: Duration) -> SprechErgebnis {
            self.router
                .sprechen_anfordern(&mut self.reg, &self.events, id, self.t0 + nach)
                .unwrap()
        }
    }

    fn payloads(rx: &mut mpsc::Receiver<ControlMessage>) -> Vec<ControlPayload> {
        let mut v = Vec::new();
        while let Ok(m) = rx.try_recv() {
            v.push(m.payload);
        }
        v
    }

    #[test]
    fn fcfs_auf_gruppe_42() {
        let mut a = Aufbau::neu(RouterConfig::default());
        let (ida, _ra) = a.session("DL1ABC", 42);
        let (idb, mut rb) = a.session("SM0ABC", 42);

        assert_eq!(a.anfordern(ida, Duration::ZERO), SprechErgebnis::Erteilt);
        assert_eq!(a.anfordern(idb, Duration::from_secs(1)), SprechErgebnis::Verweigert);
        assert_eq!(a.router.sprecher(TalkGroup(42)), Some(ida));

        let p = payloads(&mut rb);
        assert!(p.iter().any(|p| matches!(p, ControlPayload::TalkerStart { tg, .. } if tg.0 == 42)));
        assert!(p.iter().any(|p| matches!(p, ControlPayload::TalkDenied { .. })));

        assert_eq!(
            a.router.sprechen_freigeben(&mut a.reg, &a.events, ida),
            Some(TalkGroup(42))
        );
        assert_eq!(a.anfordern(idb, Duration::from_secs(2)), SprechErgebnis::Erteilt);
        assert_eq!(a.router.sprecher(TalkGroup(42)), Some(idb));
        assert!(a.router.konsistent(&a.reg));
    }

    #[test]
    fn erneute_anfrage_desselben_sprechers() {
        let mut a = Aufbau::neu(RouterConfig::default());
        let (ida, _ra) = a.session("DL1ABC", 42);
        assert_eq!(a.anfordern(ida, Duration::ZERO), SprechErgebnis::Erteilt);
        assert_eq!(a.anfordern(ida, Duration::from_secs(1)), SprechErgebnis::Erteilt);
    }

    #[test]
    fn ohne_gruppe_kein_rederecht() {
        let mut a = Aufbau::neu(RouterConfig::default());
        let (ida, _ra) = a.session("DL1ABC", 0);
        assert!(matches!(
            a.router.sprechen_anfordern(&mut a.reg, &a.events, ida, a.t0),
            Err(RoutingFehler::KeineGruppe)
        ));
    }

    #[test]
    fn sperre_nach_ueberlanger_sendung() {
        let mut a = Aufbau::neu(RouterConfig {
            max_sendezeit: Duration::from_secs(300),
            sperrzeit: Duration::from_secs(60),
            sprecher_timeout: Duration::from_secs(10),
            ..RouterConfig::default()
        });
        let (ida, mut ra) = a.session("DL1ABC", 42);
        assert_eq!(a.anfordern(ida, Duration::ZERO), SprechErgebnis::Erteilt);

        // Dauerhaft Audio, damit der Sprecher-Timeout nicht greift
        for s in (5..300).step_by(5) {
            let t = a.t0 + Duration::from_secs(s);
            assert_eq!(a.router.audio(&mut a.reg, &a.events, ida, t), Some(TalkGroup(42)));
            a.router.tick(&mut a.reg, &a.events, t);
        }
        let t_sperre = a.t0 + Duration::from_secs(300);
        a.router.tick(&mut a.reg, &a.events, t_sperre);
        assert_eq!(a.router.sprecher(TalkGroup(42)), None);
        assert!(payloads(&mut ra)
            .iter()
            .any(|p| matches!(p, ControlPayload::TalkBlocked { secs: 60 })));

        // Gruppe ist frei, trotzdem gesperrt
        assert!(matches!(
            a.anfordern(ida, Duration::from_secs(301)),
            SprechErgebnis::Gesperrt(_)
        ));
        assert_eq!(a.router.audio(&mut a.reg, &a.events, ida, a.t0 + Duration::from_secs(302)), None);

        assert_eq!(a.anfordern(ida, Duration::from_secs(360)), SprechErgebnis::Erteilt);
    }

    #[test]
    fn sprecher_timeout_ohne_sperre() {
        let mut a = Aufbau::neu(RouterConfig::default());
        let (ida, _ra) = a.session("DL1ABC", 42);
        assert_eq!(a.anfordern(ida, Duration::ZERO), SprechErgebnis::Erteilt);
        a.router.tick(&mut a.reg, &a.events, a.t0 + Duration::from_secs(10));
        assert_eq!(a.router.sprecher(TalkGroup(42)), None);
        assert_eq!(a.anfordern(ida, Duration::from_secs(11)), SprechErgebnis::Erteilt);
    }

    #[test]
    fn audio_fordert_implizit_an() {
        let mut a = Aufbau::neu(RouterConfig::default());
        let (ida, _ra) = a.session("DL1ABC", 42);
        let (idb, mut rb) = a.session("SM0ABC", 42);
        assert_eq!(a.router.audio(&mut a.reg, &a.events, ida, a.t0), Some(TalkGroup(42)));
        payloads(&mut rb);
        assert_eq!(a.router.audio(&mut a.reg, &a.events, idb, a.t0), None);
        assert!(payloads(&mut rb).is_empty(), "implizite Ablehnung wird nicht gemeldet");
    }

    #[test]
    fn gruppenwechsel_gibt_rederecht_frei() {
        let mut a = Aufbau::neu(RouterConfig::default());
        let (ida, _ra) = a.session("DL1ABC", 42);
        let (_idb, mut rb) = a.session("SM0ABC", 42);
        a.anfordern(ida, Duration::ZERO);
        a.router
            .gruppe_waehlen(&mut a.reg, &a.events, ida, TalkGroup(7))
            .unwrap();
        assert_eq!(a.router.sprecher(TalkGroup(42)), None);
        assert!(payloads(&mut rb)
            .iter()
            .any(|p| matches!(p, ControlPayload::TalkerStop { .. })));
        assert!(a.router.konsistent(&a.reg));
    }

    #[test]
    fn sprecher_wird_bei_wahl_gemeldet() {
        let mut a = Aufbau::neu(RouterConfig::default());
        let (ida, _ra) = a.session("DL1ABC", 42);
        a.anfordern(ida, Duration::ZERO);
        let (_idb, mut rb) = a.session("SM0ABC", 42);
        assert!(payloads(&mut rb)
            .iter()
            .any(|p| matches!(p, ControlPayload::TalkerStart { callsign, .. } if callsign.as_str() == "DL1ABC")));
    }

    #[test]
    fn qsy_explizit_verschiebt_gruppe_und_mithoerer() {
        let mut a = Aufbau::neu(RouterConfig::default());
        let (ida, mut ra) = a.session("DL1ABC", 42);
        let (idb, _rb) = a.session("SM0ABC", 42);
        let (idc, _rc) = a.session("OH1ABC", 7);
        let (idd, _rd) = a.session("G4ABC", 9);
        a.router
            .monitore_setzen(&mut a.reg, idc, [TalkGroup(42)])
            .unwrap();
        a.anfordern(ida, Duration::ZERO);

        let ziel = a
            .router
            .qsy_anfordern(&mut a.reg, &a.events, ida, TalkGroup(4711))
            .unwrap();
        assert_eq!(ziel, TalkGroup(4711));
        assert_eq!(a.reg.get(ida).unwrap().tg, ziel);
        assert_eq!(a.reg.get(idb).unwrap().tg, ziel);
        assert_eq!(a.reg.get(idc).unwrap().tg, TalkGroup(7));
        assert!(a.reg.get(idc).unwrap().monitore.contains(&ziel));
        assert_eq!(a.reg.get(idd).unwrap().tg, TalkGroup(9));

        // QSY vergibt kein Rederecht
        assert_eq!(a.router.sprecher(ziel), None);
        assert_eq!(a.router.sprecher(TalkGroup(42)), None);
        assert!(payloads(&mut ra)
            .iter()
            .any(|p| matches!(p, ControlPayload::Qsy { tg } if *tg == ziel)));
    }

    #[test]
    fn qsy_verbotene_gruppe() {
        let mut a = Aufbau::neu(RouterConfig {
            verbotene: [TalkGroup(666)].into_iter().collect(),
            ..RouterConfig::default()
        });
        let (ida, _ra) = a.session("DL1ABC", 42);
        assert!(matches!(
            a.router.qsy_anfordern(&mut a.reg, &a.events, ida, TalkGroup(666)),
            Err(RoutingFehler::GruppeVerboten(_))
        ));
        assert_eq!(a.reg.get(ida).unwrap().tg, TalkGroup(42));
    }

    #[test]
    fn qsy_zufall_meidet_aktive_gruppen() {
        let mut a = Aufbau::neu(RouterConfig {
            qsy_pool_start: 100,
            qsy_pool_groesse: 3,
            ..RouterConfig::default()
        });
        let (_b1, _r1) = a.session("SM0AAA", 100);
        let (_b2, _r2) = a.session("SM0BBB", 102);
        let (ida, _ra) = a.session("DL1ABC", 42);

        let ziel = a
            .router
            .qsy_anfordern(&mut a.reg, &a.events, ida, TalkGroup::KEINE)
            .unwrap();
        assert_eq!(ziel, TalkGroup(101));

        let (idc, _rc) = a.session("OH1ABC", 5);
        assert!(matches!(
            a.router.qsy_anfordern(&mut a.reg, &a.events, idc, TalkGroup::KEINE),
            Err(RoutingFehler::QsyPoolErschoepft)
        ));
    }

    #[test]
    fn entfernen_gibt_rederecht_frei() {
        let mut a = Aufbau::neu(RouterConfig::default());
        let (ida, _ra) = a.session("DL1ABC", 42);
        let (idb, _rb) = a.session("SM0ABC", 42);
        a.anfordern(ida, Duration::ZERO);
        a.router.session_entfernen(&a.reg, &a.events, ida);
        a.reg.entfernen(ida);
        assert!(a.router.konsistent(&a.reg));
        assert_eq!(a.anfordern(idb, Duration::from_secs(1)), SprechErgebnis::Erteilt);
    }

    #[tokio::test]
    async fn sprecherwechsel_als_ereignis() {
        let mut a = Aufbau::neu(RouterConfig::default());
        let mut ereignisse = a.events.abonnieren();
        let (ida, _ra) = a.session("DL1ABC", 42);
        a.anfordern(ida, Duration::ZERO);
        a.router.sprechen_freigeben(&mut a.reg, &a.events, ida);

        assert!(matches!(
            ereignisse.recv().await.unwrap(),
            ReflectorEvent::SprecherGeaendert { callsign: Some(_), .. }
        ));
        assert!(matches!(
            ereignisse.recv().await.unwrap(),
            ReflectorEvent::SprecherGeaendert { callsign: None, .. }
        ));
    }
}
