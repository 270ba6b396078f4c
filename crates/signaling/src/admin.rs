//! Admin-Schnittstelle und Ereignis-Publisher
//!
//! Lesende Snapshots und ein kleiner Befehlssatz fuer Betreiber-Werkzeuge.
//! Jeder Befehl liefert eine strukturierte [`AdminAntwort`]. Ereignisse
//! gehen ueber den Event-Bus an einen austauschbaren [`EreignisPublisher`];
//! dessen Fehler werden nur protokolliert.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reflector_core::event::{EventBus, ReflectorEvent};
use reflector_core::types::{Callsign, TalkGroup};
use reflector_crypto::{tls_acceptor_erstellen, ZertEintrag};
use reflector_protocol::control::{ControlMessage, ControlPayload, VERSION_KNOTEN_MELDUNGEN};
use reflector_voice::Filter;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::dispatcher::ca_bundle_nachricht;
use crate::error::SignalingResult;
use crate::server_state::SignalingState;

// ---------------------------------------------------------------------------
// Antworten
// ---------------------------------------------------------------------------

/// Ergebnis eines Admin-Befehls
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdminAntwort {
    Ok { daten: Value },
    Fehler { meldung: String },
}

impl AdminAntwort {
    fn ok(daten: Value) -> Self {
        Self::Ok { daten }
    }

    fn fehler(meldung: impl Into<String>) -> Self {
        Self::Fehler {
            meldung: meldung.into(),
        }
    }

    pub fn ist_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// Zertifikatseintrag ohne PEM-Inhalte
fn eintrag_zusammenfassung(e: &ZertEintrag) -> Value {
    json!({
        "callsign": e.callsign,
        "status": e.status,
        "serial": e.serial,
        "schluessel_fingerprint": e.schluessel_fingerprint,
        "email": e.email,
        "gueltig_ab": e.gueltig_ab,
        "gueltig_bis": e.gueltig_bis,
        "geaendert": e.geaendert,
    })
}

// ---------------------------------------------------------------------------
// AdminSchnittstelle
// ---------------------------------------------------------------------------

/// Befehle und Snapshots fuer Betreiber
#[derive(Clone)]
pub struct AdminSchnittstelle {
    state: Arc<SignalingState>,
}

impl AdminSchnittstelle {
    pub fn neu(state: Arc<SignalingState>) -> Self {
        Self { state }
    }

    /// Alle verbundenen Knoten mit Gruppe, Monitoren und Sprechstatus
    pub fn knoten_liste(&self) -> AdminAntwort {
        match serde_json::to_value(self.state.kern.knoten_liste(Instant::now())) {
            Ok(v) => AdminAntwort::ok(v),
            Err(e) => AdminAntwort::fehler(e.to_string()),
        }
    }

    /// Zertifikatsstatus eines Rufzeichens oder aller Eintraege
    pub fn zertifikat_status(&self, callsign: Option<&str>) -> AdminAntwort {
        let ca = self.state.ca.lock();
        match callsign {
            None => AdminAntwort::ok(Value::Array(
                ca.eintraege().iter().map(eintrag_zusammenfassung).collect(),
            )),
            Some(roh) => {
                let cs = match Callsign::neu(roh) {
                    Ok(cs) => cs,
                    Err(e) => return AdminAntwort::fehler(e.to_string()),
                };
                match ca.letzter_eintrag(&cs) {
                    Some(e) => AdminAntwort::ok(eintrag_zusammenfassung(e)),
                    None => AdminAntwort::fehler(format!("Kein Zertifikat fuer {cs}")),
                }
            }
        }
    }

    /// Vollstaendiger Zustand fuer Diagnose
    pub fn zustand_ausgeben(&self) -> AdminAntwort {
        let knoten = self.state.kern.knoten_liste(Instant::now());
        let sprecher: Vec<Value> = knoten
            .iter()
            .filter_map(|k| k.spricht.map(|tg| json!({ "tg": tg, "callsign": k.callsign })))
            .collect();
        let ca = self.state.ca.lock();
        let issuing = ca.issuing_info();

        AdminAntwort::ok(json!({
            "server_name": self.state.config.server_name,
            "uptime_sek": self.state.uptime_sek(),
            "knoten": knoten,
            "sprecher": sprecher,
            "pki": {
                "issuing_serial": issuing.serial,
                "issuing_gueltig_bis": issuing.gueltig_bis,
                "digest": ca.ca_bundle().digest,
                "eintraege": ca.eintraege().len(),
                "ausstehend": ca.ausstehende_anzahl(),
            },
        }))
    }

    /// Trennt einen verbundenen Knoten
    pub fn trennen(&self, callsign: &str) -> AdminAntwort {
        let cs = match Callsign::neu(callsign) {
            Ok(cs) => cs,
            Err(e) => return AdminAntwort::fehler(e.to_string()),
        };
        match self.state.kern.nach_callsign(&cs) {
            Some(id) => {
                self.state.kern.entfernen(id, "Admin-Trennung");
                tracing::info!(callsign = %cs, "Knoten vom Admin getrennt");
                AdminAntwort::ok(json!({ "getrennt": cs }))
            }
            None => AdminAntwort::fehler(format!("{cs} ist nicht verbunden")),
        }
    }

    /// Widerruft das Zertifikat und trennt den Knoten falls verbunden
    pub fn widerrufen(&self, callsign: &str) -> AdminAntwort {
        let cs = match Callsign::neu(callsign) {
            Ok(cs) => cs,
            Err(e) => return AdminAntwort::fehler(e.to_string()),
        };
        if let Err(e) = self.state.ca.lock().widerrufen(&cs, Utc::now()) {
            return AdminAntwort::fehler(e.to_string());
        }
        self.state
            .events()
            .senden(ReflectorEvent::ZertifikatWiderrufen { callsign: cs.clone() });

        let getrennt = match self.state.kern.nach_callsign(&cs) {
            Some(id) => self.state.kern.entfernen(id, "Zertifikat widerrufen").is_some(),
            None => false,
        };
        AdminAntwort::ok(json!({ "widerrufen": cs, "getrennt": getrennt }))
    }

    /// Verschiebt einen Knoten (und seine Gruppe) auf eine andere Talk-Group
    ///
    /// `tg = 0` waehlt eine zufaellige freie Gruppe.
    pub fn qsy(&self, callsign: &str, tg: u32) -> AdminAntwort {
        let cs = match Callsign::neu(callsign) {
            Ok(cs) => cs,
            Err(e) => return AdminAntwort::fehler(e.to_string()),
        };
        let Some(id) = self.state.kern.nach_callsign(&cs) else {
            return AdminAntwort::fehler(format!("{cs} ist nicht verbunden"));
        };
        match self.state.kern.qsy(id, TalkGroup(tg)) {
            Ok(ziel) => AdminAntwort::ok(json!({ "callsign": cs, "tg": ziel })),
            Err(e) => AdminAntwort::fehler(e.to_string()),
        }
    }

    /// Gibt einen ausstehenden CSR frei
    pub fn csr_genehmigen(&self, callsign: &str) -> AdminAntwort {
        let cs = match Callsign::neu(callsign) {
            Ok(cs) => cs,
            Err(e) => return AdminAntwort::fehler(e.to_string()),
        };
        let jetzt = Utc::now();
        let mut ca = self.state.ca.lock();
        let serial = match ca
            .csr_genehmigen(&cs, jetzt)
            .and_then(|pem| ca.zertifikat_pruefen(&cs, &pem, jetzt))
        {
            Ok(info) => info.serial,
            Err(e) => return AdminAntwort::fehler(e.to_string()),
        };
        drop(ca);

        self.state.events().senden(ReflectorEvent::ZertifikatAusgestellt {
            callsign: cs.clone(),
            serial: serial.clone(),
        });
        AdminAntwort::ok(json!({ "callsign": cs, "serial": serial }))
    }
}

// ---------------------------------------------------------------------------
// Erneuerung
// ---------------------------------------------------------------------------

/// Erneuert faellige Zertifikate und verteilt die Ergebnisse
///
/// Nach einer Issuing-Erneuerung wird der TLS-Acceptor ausgetauscht und
/// das neue Bundle an alle Knoten ab Version 2.1 geschickt. Erneuerte
/// Client-Zertifikate gehen an den jeweiligen Knoten, falls verbunden.
pub fn erneuerungen_durchfuehren(state: &SignalingState, jetzt: DateTime<Utc>) -> SignalingResult<()> {
    let mut ca = state.ca.lock();
    let erneuerungen = ca.erneuerungen_pruefen(jetzt)?;

    if erneuerungen.issuing_erneuert {
        let (kette, key) = ca.server_tls();
        state.tls_ersetzen(tls_acceptor_erstellen(&kette, &key)?);

        let bundle = ca_bundle_nachricht(&ca, 0);
        let n = state
            .kern
            .senden(&Filter::ab_version(VERSION_KNOTEN_MELDUNGEN), &bundle);
        state.events().senden(ReflectorEvent::ZertifikatErneuert {
            subjekt: ca.config().issuing_cn.clone(),
            serial: ca.issuing_info().serial.clone(),
        });
        tracing::info!(empfaenger = n, "Neues CA-Bundle verteilt");
    }

    for (callsign, cert_pem) in erneuerungen.clients {
        let serial = ca
            .aktiver_eintrag(&callsign)
            .and_then(|e| e.serial.clone())
            .unwrap_or_default();
        if let Some(id) = state.kern.nach_callsign(&callsign) {
            let nachricht = ControlMessage::push(ControlPayload::ClientCertificate {
                cert_pem,
                key_pem: None,
            });
            state.kern.senden(&Filter::Session(id), &nachricht);
        }
        tracing::info!(callsign = %callsign, serial = %serial, "Client-Zertifikat erneuert");
        state.events().senden(ReflectorEvent::ZertifikatErneuert {
            subjekt: callsign.to_string(),
            serial,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Ziel fuer Reflector-Ereignisse (Message-Bus, Webhook, ...)
#[async_trait]
pub trait EreignisPublisher: Send + Sync + 'static {
    async fn veroeffentlichen(&self, event: &ReflectorEvent) -> anyhow::Result<()>;
}

/// Schreibt Ereignisse als strukturierte Log-Zeilen
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

#[async_trait]
impl EreignisPublisher for LogPublisher {
    async fn veroeffentlichen(&self, event: &ReflectorEvent) -> anyhow::Result<()> {
        let json = serde_json::to_string(event)?;
        tracing::info!(target: "reflector::ereignis", ereignis = %json, "Ereignis");
        Ok(())
    }
}

/// Startet den Task, der den Event-Bus an den Publisher weiterreicht
pub fn publisher_starten(
    events: &Arc<dyn EventBus>,
    publisher: Arc<dyn EreignisPublisher>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut rx = events.abonnieren();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                empfangen = rx.recv() => match empfangen {
                    Ok(event) => {
                        if let Err(e) = publisher.veroeffentlichen(&event).await {
                            tracing::warn!(fehler = %e, "Ereignis konnte nicht veroeffentlicht werden");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(verpasst = n, "Publisher kommt nicht hinterher");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Ereignis-Publisher beendet");
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::tests::{test_state, verbinden, TestKnoten};
    use reflector_crypto::{CaConfig, ZertStatus};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn snapshots() {
        let state = test_state(CaConfig::default());
        let admin = AdminSchnittstelle::neu(Arc::clone(&state));
        let (_session, _rx, _) = verbinden(&state, &TestKnoten::neu("DL1ABC"));

        let AdminAntwort::Ok { daten } = admin.knoten_liste() else {
            panic!("knoten_liste fehlgeschlagen");
        };
        assert_eq!(daten.as_array().unwrap().len(), 1);
        assert_eq!(daten[0]["callsign"], "DL1ABC");

        let AdminAntwort::Ok { daten } = admin.zertifikat_status(Some("dl1abc")) else {
            panic!("zertifikat_status fehlgeschlagen");
        };
        assert_eq!(daten["status"], "ausgestellt");
        assert!(daten.get("cert_pem").is_none());

        assert!(!admin.zertifikat_status(Some("SM0XYZ")).ist_ok());
        let AdminAntwort::Ok { daten } = admin.zustand_ausgeben() else {
            panic!("zustand_ausgeben fehlgeschlagen");
        };
        assert_eq!(daten["pki"]["eintraege"], 1);
    }

    #[test]
    fn zustand_nennt_sprecher_mit_sprechgruppe() {
        let state = test_state(CaConfig::default());
        let admin = AdminSchnittstelle::neu(Arc::clone(&state));
        let (a, _a_rx, _) = verbinden(&state, &TestKnoten::neu("DL1ABC"));
        let (b, _b_rx, _) = verbinden(&state, &TestKnoten::neu("SM0ABC"));
        let a = a.session_id().unwrap();
        let b = b.session_id().unwrap();

        state.kern.gruppe_waehlen(a, TalkGroup(42)).unwrap();
        state.kern.gruppe_waehlen(b, TalkGroup(42)).unwrap();
        state.kern.sprechen_anfordern(a, Instant::now()).unwrap();

        let AdminAntwort::Ok { daten } = admin.zustand_ausgeben() else {
            panic!("zustand_ausgeben fehlgeschlagen");
        };
        assert_eq!(daten["sprecher"], json!([{ "tg": 42, "callsign": "DL1ABC" }]));

        state.kern.sprechen_freigeben(a);
        let AdminAntwort::Ok { daten } = admin.zustand_ausgeben() else {
            panic!("zustand_ausgeben fehlgeschlagen");
        };
        assert_eq!(daten["sprecher"], json!([]));
    }

    #[tokio::test]
    async fn trennen_schliesst_sende_queue() {
        let state = test_state(CaConfig::default());
        let admin = AdminSchnittstelle::neu(Arc::clone(&state));
        let (_session, mut rx, _) = verbinden(&state, &TestKnoten::neu("DL1ABC"));

        assert!(admin.trennen("DL1ABC").ist_ok());
        assert_eq!(state.kern.anzahl(), 0);
        // Registry haelt keinen Sender mehr, die Verbindung sieht das Ende
        while rx.recv().await.is_some() {}

        assert!(!admin.trennen("DL1ABC").ist_ok());
    }

    #[test]
    fn widerruf_trennt_und_sperrt() {
        let state = test_state(CaConfig::default());
        let admin = AdminSchnittstelle::neu(Arc::clone(&state));
        let mut ereignisse = state.events().abonnieren();
        let (_session, _rx, _) = verbinden(&state, &TestKnoten::neu("DL1ABC"));

        let antwort = admin.widerrufen("DL1ABC");
        assert_eq!(
            antwort,
            AdminAntwort::Ok {
                daten: json!({ "widerrufen": "DL1ABC", "getrennt": true })
            }
        );
        assert_eq!(state.kern.anzahl(), 0);
        let cs = Callsign::neu("DL1ABC").unwrap();
        assert_eq!(
            state.ca.lock().letzter_eintrag(&cs).unwrap().status,
            ZertStatus::Widerrufen
        );

        let mut gesehen = false;
        while let Ok(e) = ereignisse.try_recv() {
            gesehen |= matches!(e, ReflectorEvent::ZertifikatWiderrufen { .. });
        }
        assert!(gesehen);
    }

    #[test]
    fn qsy_per_admin() {
        let state = test_state(CaConfig::default());
        let admin = AdminSchnittstelle::neu(Arc::clone(&state));
        let (_session, mut rx, _) = verbinden(&state, &TestKnoten::neu("DL1ABC"));

        let AdminAntwort::Ok { daten } = admin.qsy("DL1ABC", 4711) else {
            panic!("qsy fehlgeschlagen");
        };
        assert_eq!(daten["tg"], 4711);

        let mut qsy = None;
        while let Ok(m) = rx.try_recv() {
            if let ControlPayload::Qsy { tg } = m.payload {
                qsy = Some(tg);
            }
        }
        assert_eq!(qsy, Some(TalkGroup(4711)));
        assert!(!admin.qsy("SM0ABC", 1).ist_ok());
    }

    #[test]
    fn ausstehenden_csr_genehmigen() {
        let state = test_state(CaConfig {
            auto_ausstellen: false,
            ..CaConfig::default()
        });
        let admin = AdminSchnittstelle::neu(Arc::clone(&state));
        let knoten = TestKnoten::neu("DL1ABC");
        let cs = Callsign::neu("DL1ABC").unwrap();
        state
            .ca
            .lock()
            .csr_einreichen(&cs, &knoten.csr(), Utc::now())
            .unwrap();

        let antwort = admin.csr_genehmigen("DL1ABC");
        assert!(antwort.ist_ok());
        assert_eq!(
            state.ca.lock().aktiver_eintrag(&cs).unwrap().status,
            ZertStatus::Ausgestellt
        );
        assert!(!admin.csr_genehmigen("DL1ABC").ist_ok());
    }

    #[test]
    fn erneuerung_verteilt_zertifikate_und_bundle() {
        let state = test_state(CaConfig::default());
        let (_session, mut rx, _) = verbinden(&state, &TestKnoten::neu("DL1ABC"));
        while rx.try_recv().is_ok() {}
        let digest_vorher = state.ca.lock().ca_bundle().digest.clone();

        // Kurz vor Ablauf des Issuing-Zertifikats sind alle Zertifikate faellig
        let spaeter = Utc::now() + chrono::Duration::days(340);
        erneuerungen_durchfuehren(&state, spaeter).unwrap();

        let mut bundle = false;
        let mut zertifikat = false;
        while let Ok(m) = rx.try_recv() {
            match m.payload {
                ControlPayload::CaBundle { digest, .. } => {
                    assert_ne!(digest, digest_vorher);
                    bundle = true;
                }
                ControlPayload::ClientCertificate { key_pem: None, .. } => zertifikat = true,
                _ => {}
            }
        }
        assert!(bundle);
        assert!(zertifikat);
    }

    struct KanalPublisher(mpsc::Sender<ReflectorEvent>);

    #[async_trait]
    impl EreignisPublisher for KanalPublisher {
        async fn veroeffentlichen(&self, event: &ReflectorEvent) -> anyhow::Result<()> {
            self.0.send(event.clone()).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn publisher_erhaelt_ereignisse() {
        let state = test_state(CaConfig::default());
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = publisher_starten(state.events(), Arc::new(KanalPublisher(tx)), shutdown_rx);

        let event = ReflectorEvent::ZertifikatWiderrufen {
            callsign: Callsign::neu("DL1ABC").unwrap(),
        };
        state.events().senden(event.clone());
        let empfangen = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(empfangen, event);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
