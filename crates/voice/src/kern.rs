//! Gemeinsamer Routing-Kern
//!
//! [`Kern`] ist das einzige sessionuebergreifende, veraenderliche Objekt des
//! Reflectors. Registry und Router liegen zusammen hinter genau einem
//! Mutex; jede Operation nimmt die Sperre fuer die Dauer der Mutation und
//! gibt sie vor jedem I/O wieder ab. UDP-Ausgaben werden deshalb als Liste
//! `(Ziel, Datagramm)` zurueckgegeben und vom Aufrufer gesendet.
//!
//! Der Handle ist billig klonbar (`Arc` intern).

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reflector_core::event::{EventBus, ReflectorEvent};
use reflector_core::types::{Callsign, SessionId, TalkGroup};
use reflector_protocol::control::{
    ControlMessage, ControlPayload, UdpSchluesselParameter, VERSION_KNOTEN_MELDUNGEN,
};
use reflector_protocol::datagram::{DatagrammKopf, UdpNachricht};
use serde::Serialize;

use crate::error::{RoutingFehler, RoutingResult};
use crate::filter::Filter;
use crate::registry::{ClientRegistry, NeueSession};
use crate::talkgroup::{RouterConfig, SprechErgebnis, TalkGroupRouter};

/// Ausgehendes Datagramm
pub type Ausgang = Vec<(SocketAddr, Vec<u8>)>;

// ---------------------------------------------------------------------------
// Konfiguration und Abbilder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct KernConfig {
    pub max_clients: usize,
    pub udp_heartbeat_intervall: Duration,
    pub udp_heartbeat_timeout: Duration,
    pub router: RouterConfig,
}

impl Default for KernConfig {
    fn default() -> Self {
        Self {
            max_clients: 1000,
            udp_heartbeat_intervall: Duration::from_secs(15),
            udp_heartbeat_timeout: Duration::from_secs(60),
            router: RouterConfig::default(),
        }
    }
}

/// Schnappschuss einer Session fuer die Admin-Schnittstelle
#[derive(Debug, Clone, Serialize)]
pub struct KnotenInfo {
    pub session_id: SessionId,
    pub callsign: Callsign,
    pub tcp_adresse: SocketAddr,
    pub udp_adresse: Option<SocketAddr>,
    pub version: String,
    pub tg: TalkGroup,
    pub monitore: BTreeSet<TalkGroup>,
    /// Gruppe in der der Knoten gerade spricht
    pub spricht: Option<TalkGroup>,
    pub gesperrt_sek: Option<u64>,
    pub udp_ok: bool,
    pub verbunden_sek: u64,
    pub node_info: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Kern
// ---------------------------------------------------------------------------

struct KernZustand {
    registry: ClientRegistry,
    router: TalkGroupRouter,
}

struct KernInner {
    zustand: Mutex<KernZustand>,
    events: Arc<dyn EventBus>,
}

/// Handle auf Registry und Router
#[derive(Clone)]
pub struct Kern {
    inner: Arc<KernInner>,
}

impl Kern {
    pub fn neu(config: KernConfig, events: Arc<dyn EventBus>) -> Self {
        let registry = ClientRegistry::neu(
            config.max_clients,
            config.udp_heartbeat_intervall,
            config.udp_heartbeat_timeout,
        );
        Self {
            inner: Arc::new(KernInner {
                zustand: Mutex::new(KernZustand {
                    registry,
                    router: TalkGroupRouter::neu(config.router),
                }),
                events,
            }),
        }
    }

    pub fn events(&self) -> &Arc<dyn EventBus> {
        &self.inner.events
    }

    // -----------------------------------------------------------------------
    // Session-Lebenszyklus
    // -----------------------------------------------------------------------

    /// Registriert eine authentifizierte Session
    ///
    /// Knoten ab Protokoll 2.1 erfahren per `node_joined` vom Neuzugang; der
    /// Neuzugang erhaelt die Liste der bereits verbundenen Knoten.
    pub fn registrieren(
        &self,
        neu: NeueSession,
        jetzt: Instant,
    ) -> RoutingResult<(SessionId, UdpSchluesselParameter)> {
        let mut z = self.inner.zustand.lock();
        let callsign = neu.callsign.clone();
        let (id, params) = z.registry.registrieren(neu, jetzt)?;

        z.registry.senden(
            &Filter::ab_version(VERSION_KNOTEN_MELDUNGEN).und(Filter::AlleAusser(id)),
            &ControlMessage::push(ControlPayload::NodeJoined {
                callsign: callsign.clone(),
            }),
        );
        if let Some(e) = z.registry.get(id) {
            if e.version >= VERSION_KNOTEN_MELDUNGEN {
                for andere in z.registry.iter().filter(|a| a.id != id) {
                    e.senden(ControlMessage::push(ControlPayload::NodeJoined {
                        callsign: andere.callsign.clone(),
                    }));
                }
            }
        }

        tracing::info!(session = %id, callsign = %callsign, anzahl = z.registry.anzahl(), "Knoten registriert");
        self.inner
            .events
            .senden(ReflectorEvent::KnotenVerbunden { session_id: id, callsign });
        Ok((id, params))
    }

    /// Entfernt eine Session und gibt alles frei was sie haelt
    ///
    /// Mehrfacher Aufruf ist harmlos; nur der erste liefert `Some`.
    pub fn entfernen(&self, id: SessionId, grund: &str) -> Option<Callsign> {
        let mut z = self.inner.zustand.lock();
        let KernZustand { registry, router } = &mut *z;
        registry.get(id)?;

        router.session_entfernen(registry, self.inner.events.as_ref(), id);
        let eintrag = registry.entfernen(id)?;
        registry.senden(
            &Filter::ab_version(VERSION_KNOTEN_MELDUNGEN),
            &ControlMessage::push(ControlPayload::NodeLeft {
                callsign: eintrag.callsign.clone(),
            }),
        );

        tracing::info!(session = %id, callsign = %eintrag.callsign, grund, "Knoten entfernt");
        self.inner.events.senden(ReflectorEvent::KnotenGetrennt {
            session_id: id,
            callsign: eintrag.callsign.clone(),
            grund: grund.to_string(),
        });
        Some(eintrag.callsign)
    }

    pub fn nach_callsign(&self, callsign: &Callsign) -> Option<SessionId> {
        self.inner.zustand.lock().registry.nach_callsign(callsign)
    }

    pub fn anzahl(&self) -> usize {
        self.inner.zustand.lock().registry.anzahl()
    }

    // -----------------------------------------------------------------------
    // Control-Operationen verbundener Sessions
    // -----------------------------------------------------------------------

    pub fn gruppe_waehlen(&self, id: SessionId, tg: TalkGroup) -> RoutingResult<()> {
        let mut z = self.inner.zustand.lock();
        let KernZustand { registry, router } = &mut *z;
        router.gruppe_waehlen(registry, self.inner.events.as_ref(), id, tg)
    }

    pub fn monitore_setzen(&self, id: SessionId, tgs: Vec<TalkGroup>) -> RoutingResult<()> {
        let mut z = self.inner.zustand.lock();
        let KernZustand { registry, router } = &mut *z;
        router.monitore_setzen(registry, id, tgs)
    }

    pub fn sprechen_anfordern(&self, id: SessionId, jetzt: Instant) -> RoutingResult<SprechErgebnis> {
        let mut z = self.inner.zustand.lock();
        let KernZustand { registry, router } = &mut *z;
        router.sprechen_anfordern(registry, self.inner.events.as_ref(), id, jetzt)
    }

    pub fn sprechen_freigeben(&self, id: SessionId) -> Option<TalkGroup> {
        let mut z = self.inner.zustand.lock();
        let KernZustand { registry, router } = &mut *z;
        router.sprechen_freigeben(registry, self.inner.events.as_ref(), id)
    }

    pub fn qsy(&self, id: SessionId, tg: TalkGroup) -> RoutingResult<TalkGroup> {
        let mut z = self.inner.zustand.lock();
        let KernZustand { registry, router } = &mut *z;
        router.qsy_anfordern(registry, self.inner.events.as_ref(), id, tg)
    }

    pub fn node_info_setzen(&self, id: SessionId, info: serde_json::Value) -> RoutingResult<()> {
        let mut z = self.inner.zustand.lock();
        let e = z
            .registry
            .get_mut(id)
            .ok_or(RoutingFehler::SessionNichtGefunden(id))?;
        e.node_info = Some(info);
        Ok(())
    }

    pub fn signalstaerke_setzen(
        &self,
        id: SessionId,
        rx_id: String,
        siglev: f32,
        aktiv: bool,
    ) -> RoutingResult<()> {
        let mut z = self.inner.zustand.lock();
        let e = z
            .registry
            .get_mut(id)
            .ok_or(RoutingFehler::SessionNichtGefunden(id))?;
        tracing::trace!(callsign = %e.callsign, rx_id = %rx_id, siglev, aktiv, "Signalstaerke");
        e.letzte_signalstaerke = Some((rx_id, siglev, aktiv));
        Ok(())
    }

    /// Broadcast einer Control-Nachricht
    pub fn senden(&self, filter: &Filter, msg: &ControlMessage) -> usize {
        self.inner.zustand.lock().registry.senden(filter, msg)
    }

    // -----------------------------------------------------------------------
    // UDP
    // -----------------------------------------------------------------------

    /// Verarbeitet ein empfangenes Datagramm
    ///
    /// Die Absenderadresse wird erst nach erfolgreicher Entschluesselung mit
    /// frischem Zaehler gelernt oder gewechselt. Alles andere wird
    /// verworfen.
    pub fn datagramm_verarbeiten(&self, daten: &[u8], absender: SocketAddr, jetzt: Instant) -> Ausgang {
        let kopf = match DatagrammKopf::decode(daten) {
            Ok(k) => k,
            Err(e) => {
                tracing::trace!(absender = %absender, fehler = %e, "Ungueltiger Datagramm-Kopf");
                return Vec::new();
            }
        };

        let mut z = self.inner.zustand.lock();
        let KernZustand { registry, router } = &mut *z;
        let events = self.inner.events.as_ref();

        let id = match registry.nach_adresse(&absender) {
            Some(id) if id == kopf.client_id => id,
            Some(id) => {
                tracing::debug!(absender = %absender, erwartet = %id, erhalten = %kopf.client_id, "Client-ID passt nicht zur Adresse");
                return Vec::new();
            }
            None => kopf.client_id,
        };
        let Some(e) = registry.get_mut(id) else {
            tracing::debug!(absender = %absender, client_id = %kopf.client_id, "Datagramm von unbekannter Session");
            return Vec::new();
        };

        let klartext = match e.cipher.entschluesseln(daten) {
            Ok(k) => k,
            Err(err) => {
                tracing::debug!(callsign = %e.callsign, absender = %absender, fehler = %err, "Datagramm verworfen");
                return Vec::new();
            }
        };

        e.udp_herzschlag.empfangen(jetzt);
        let flanke = !e.udp_ok;
        e.udp_ok = true;
        let callsign = e.callsign.clone();
        let alte_adresse = e.udp_adresse;

        if alte_adresse != Some(absender) {
            registry.udp_adresse_setzen(id, absender);
            match alte_adresse {
                None => tracing::info!(callsign = %callsign, udp = %absender, "UDP-Adresse gelernt"),
                Some(alt) => tracing::info!(callsign = %callsign, alt = %alt, neu = %absender, "UDP-Adresse gewechselt"),
            }
        }
        if flanke {
            events.senden(ReflectorEvent::UdpQualitaet {
                session_id: id,
                callsign: callsign.clone(),
                verbindung_ok: true,
            });
        }

        let nachricht = match UdpNachricht::decode(&klartext) {
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(callsign = %callsign, fehler = %err, "Ungueltiger Datagramm-Inhalt");
                return Vec::new();
            }
        };

        let mut ausgang = Vec::new();
        match nachricht {
            UdpNachricht::Heartbeat => {
                tracing::trace!(callsign = %callsign, "UDP-Heartbeat");
            }
            UdpNachricht::Audio(_) => {
                if let Some(tg) = router.audio(registry, events, id, jetzt) {
                    weiterleiten(registry, id, tg, &klartext, &mut ausgang);
                }
            }
            UdpNachricht::FlushSamples => {
                if let Some(tg) = router.sprechen_freigeben(registry, events, id) {
                    weiterleiten(registry, id, tg, &klartext, &mut ausgang);
                }
                an_session(registry, id, &UdpNachricht::AllSamplesFlushed, &mut ausgang);
            }
            UdpNachricht::AllSamplesFlushed => {
                tracing::trace!(callsign = %callsign, "Empfaenger hat ausgespielt");
            }
            UdpNachricht::SignalStrength { rx_id, siglev, active } => {
                if let Some(e) = registry.get_mut(id) {
                    e.letzte_signalstaerke = Some((rx_id.to_string(), siglev, active));
                }
            }
        }
        ausgang
    }

    // -----------------------------------------------------------------------
    // Zeitsteuerung
    // -----------------------------------------------------------------------

    /// Periodische Arbeit: Floor-Zeitlimits und UDP-Heartbeats
    pub fn tick(&self, jetzt: Instant) -> Ausgang {
        let mut z = self.inner.zustand.lock();
        let KernZustand { registry, router } = &mut *z;
        let events = self.inner.events.as_ref();
        router.tick(registry, events, jetzt);

        let mut ausgang = Vec::new();
        for e in registry.iter_mut() {
            if e.udp_ok && e.udp_herzschlag.abgelaufen(jetzt) {
                e.udp_ok = false;
                tracing::warn!(callsign = %e.callsign, "UDP-Heartbeat ausgeblieben");
                events.senden(ReflectorEvent::UdpQualitaet {
                    session_id: e.id,
                    callsign: e.callsign.clone(),
                    verbindung_ok: false,
                });
            }
            let Some(ziel) = e.udp_adresse else { continue };
            if !e.udp_herzschlag.senden_faellig(jetzt) {
                continue;
            }
            match e.cipher.verschluesseln(&UdpNachricht::Heartbeat.encode()) {
                Ok(dg) => {
                    e.udp_herzschlag.gesendet(jetzt);
                    ausgang.push((ziel, dg));
                }
                Err(err) => {
                    tracing::warn!(callsign = %e.callsign, fehler = %err, "UDP-Heartbeat nicht verschluesselbar");
                }
            }
        }
        ausgang
    }

    // -----------------------------------------------------------------------
    // Abbilder
    // -----------------------------------------------------------------------

    pub fn knoten_liste(&self, jetzt: Instant) -> Vec<KnotenInfo> {
        let z = self.inner.zustand.lock();
        z.registry
            .iter()
            .map(|e| KnotenInfo {
                session_id: e.id,
                callsign: e.callsign.clone(),
                tcp_adresse: e.tcp_adresse,
                udp_adresse: e.udp_adresse,
                version: e.version.to_string(),
                tg: e.tg,
                monitore: e.monitore.clone(),
                spricht: z.router.spricht_in(e.id),
                gesperrt_sek: e.sperre_rest(jetzt).map(|d| d.as_secs()),
                udp_ok: e.udp_ok,
                verbunden_sek: jetzt.saturating_duration_since(e.verbunden_seit).as_secs(),
                node_info: e.node_info.clone(),
            })
            .collect()
    }

    /// Aktueller Sprecher einer Gruppe
    pub fn sprecher(&self, tg: TalkGroup) -> Option<Callsign> {
        let z = self.inner.zustand.lock();
        let id = z.router.sprecher(tg)?;
        z.registry.get(id).map(|e| e.callsign.clone())
    }
}

/// Verschluesselt den Klartext fuer alle anderen Hoerer der Gruppe neu
fn weiterleiten(
    registry: &mut ClientRegistry,
    von: SessionId,
    tg: TalkGroup,
    klartext: &[u8],
    ausgang: &mut Ausgang,
) {
    let empfaenger = registry.auswaehlen(&Filter::hoerer(tg).und(Filter::AlleAusser(von)));
    for id in empfaenger {
        let Some(e) = registry.get_mut(id) else { continue };
        let Some(ziel) = e.udp_adresse else { continue };
        match e.cipher.verschluesseln(klartext) {
            Ok(dg) => ausgang.push((ziel, dg)),
            Err(err) => tracing::debug!(callsign = %e.callsign, fehler = %err, "Weiterleitung fehlgeschlagen"),
        }
    }
}

fn an_session(registry: &mut ClientRegistry, id: SessionId, nachricht: &UdpNachricht, ausgang: &mut Ausgang) {
    let Some(e) = registry.get_mut(id) else { return };
    let Some(ziel) = e.udp_adresse else { return };
    match e.cipher.verschluesseln(&nachricht.encode()) {
        Ok(dg) => ausgang.push((ziel, dg)),
        Err(err) => tracing::debug!(callsign = %e.callsign, fehler = %err, "Antwort nicht verschluesselbar"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
