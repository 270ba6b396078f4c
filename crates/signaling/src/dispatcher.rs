//! Message-Dispatcher fuer verbundene Sessions
//!
//! Nach erfolgreicher Authentifizierung landen alle Control-Nachrichten
//! hier. Der Dispatcher setzt sie in Operationen auf dem Routing-Kern um
//! und liefert hoechstens eine direkte Antwort. Broadcasts (Sprecherwechsel,
//! QSY) laufen ueber die Registry.
//!
//! ## Zustandspruefung
//! Handshake-Nachrichten (`proto_ver`, `client_csr`, ...) und alle
//! Server→Knoten-Typen sind hier Protokollverletzungen.

use std::sync::Arc;
use std::time::Instant;

use reflector_core::types::{SessionId, TalkGroup};
use reflector_crypto::CaManager;
use reflector_protocol::control::{ControlMessage, ControlPayload, ErrorCode};
use reflector_voice::{RoutingFehler, SprechErgebnis};

use crate::error::{SignalingError, SignalingResult};
use crate::server_state::SignalingState;

/// Baut die `ca_bundle`-Nachricht aus dem aktuellen Stand der CA
pub fn ca_bundle_nachricht(ca: &CaManager, request_id: u32) -> ControlMessage {
    let b = ca.ca_bundle().clone();
    ControlMessage::new(
        request_id,
        ControlPayload::CaBundle {
            ca_pem: b.ca_pem,
            issuing_pem: b.issuing_pem,
            digest: b.digest,
            signature: b.signatur,
        },
    )
}

/// Zentraler Dispatcher fuer den Zustand `Verbunden`
pub struct MessageDispatcher {
    state: Arc<SignalingState>,
}

impl MessageDispatcher {
    pub fn neu(state: Arc<SignalingState>) -> Self {
        Self { state }
    }

    /// Verarbeitet eine Nachricht einer verbundenen Session
    ///
    /// `Err` bedeutet Protokollverletzung; fachliche Ablehnungen (Gruppe
    /// belegt, QSY verboten) kommen als Antwort zurueck.
    pub fn dispatch(
        &self,
        message: ControlMessage,
        session_id: SessionId,
        jetzt: Instant,
    ) -> SignalingResult<Option<ControlMessage>> {
        let request_id = message.request_id;
        let kern = &self.state.kern;

        let antwort = match message.payload {
            ControlPayload::SelectTg { tg } => {
                kern.gruppe_waehlen(session_id, tg)?;
                None
            }

            ControlPayload::TgMonitor { tgs } => {
                kern.monitore_setzen(session_id, tgs)?;
                None
            }

            ControlPayload::RequestQsy { tg } => match kern.qsy(session_id, tg) {
                Ok(_) => None,
                Err(RoutingFehler::GruppeVerboten(tg)) => Some(ControlMessage::error(
                    request_id,
                    ErrorCode::AccessDenied,
                    format!("QSY auf {tg} nicht erlaubt"),
                )),
                Err(RoutingFehler::QsyPoolErschoepft) => Some(ControlMessage::error(
                    request_id,
                    ErrorCode::ServerBusy,
                    "Keine freie Talk-Group verfuegbar",
                )),
                Err(e) => return Err(e.into()),
            },

            ControlPayload::TalkRequest => match kern.sprechen_anfordern(session_id, jetzt) {
                // Ablehnung und Sperre meldet der Router selbst
                Ok(SprechErgebnis::Erteilt | SprechErgebnis::Verweigert | SprechErgebnis::Gesperrt(_)) => None,
                Err(RoutingFehler::KeineGruppe) => Some(ControlMessage::new(
                    request_id,
                    ControlPayload::TalkDenied {
                        tg: TalkGroup::KEINE,
                        reason: "Keine Talk-Group gewaehlt".into(),
                    },
                )),
                Err(e) => return Err(e.into()),
            },

            ControlPayload::TalkRelease => {
                kern.sprechen_freigeben(session_id);
                None
            }

            ControlPayload::NodeInfo { info } => {
                kern.node_info_setzen(session_id, info)?;
                None
            }

            ControlPayload::SignalStrength {
                rx_id,
                siglev,
                active,
            } => {
                kern.signalstaerke_setzen(session_id, rx_id, siglev, active)?;
                None
            }

            ControlPayload::CaBundleRequest => {
                Some(ca_bundle_nachricht(&self.state.ca.lock(), request_id))
            }

            andere => {
                return Err(SignalingError::protokoll(format!(
                    "Nachricht '{}' im Zustand Verbunden nicht erlaubt",
                    andere.name()
                )));
            }
        };

        tracing::trace!(session = %session_id, request_id, "Nachricht verarbeitet");
        Ok(antwort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::tests::{nachricht, test_state, test_state_mit_kern, verbinden, TestKnoten};
    use reflector_crypto::CaConfig;
    use reflector_voice::{KernConfig, RouterConfig};
    use std::collections::BTreeSet;

    fn verbunden(state: &Arc<SignalingState>) -> (MessageDispatcher, SessionId) {
        let (session, _rx, _) = verbinden(state, &TestKnoten::neu("DL1ABC"));
        let id = session.session_id().unwrap();
        (MessageDispatcher::neu(Arc::clone(state)), id)
    }

    fn fehlercode(antwort: Option<ControlMessage>) -> Option<ErrorCode> {
        match antwort?.payload {
            ControlPayload::Error { code, .. } => Some(code),
            _ => None,
        }
    }

    #[test]
    fn qsy_auf_verbotene_gruppe() {
        let state = test_state_mit_kern(
            CaConfig::default(),
            KernConfig {
                router: RouterConfig {
                    verbotene: BTreeSet::from([TalkGroup(9)]),
                    ..RouterConfig::default()
                },
                ..KernConfig::default()
            },
        );
        let (dispatcher, id) = verbunden(&state);
        dispatcher
            .dispatch(nachricht(ControlPayload::SelectTg { tg: TalkGroup(42) }), id, Instant::now())
            .unwrap();

        let antwort = dispatcher
            .dispatch(nachricht(ControlPayload::RequestQsy { tg: TalkGroup(9) }), id, Instant::now())
            .unwrap();
        assert_eq!(antwort.as_ref().map(|m| m.request_id), Some(7));
        assert_eq!(fehlercode(antwort), Some(ErrorCode::AccessDenied));
    }

    #[test]
    fn qsy_pool_erschoepft() {
        let state = test_state_mit_kern(
            CaConfig::default(),
            KernConfig {
                router: RouterConfig {
                    qsy_pool_groesse: 0,
                    ..RouterConfig::default()
                },
                ..KernConfig::default()
            },
        );
        let (dispatcher, id) = verbunden(&state);

        let antwort = dispatcher
            .dispatch(nachricht(ControlPayload::RequestQsy { tg: TalkGroup::KEINE }), id, Instant::now())
            .unwrap();
        assert_eq!(fehlercode(antwort), Some(ErrorCode::ServerBusy));
    }

    #[test]
    fn sprechen_ohne_gruppe() {
        let state = test_state(CaConfig::default());
        let (dispatcher, id) = verbunden(&state);

        let antwort = dispatcher
            .dispatch(nachricht(ControlPayload::TalkRequest), id, Instant::now())
            .unwrap()
            .unwrap();
        assert!(matches!(
            antwort.payload,
            ControlPayload::TalkDenied { tg: TalkGroup::KEINE, .. }
        ));
        assert!(state.kern.sprecher(TalkGroup::KEINE).is_none());
    }

    #[test]
    fn sprechen_mit_gruppe_antwortet_nicht_direkt() {
        let state = test_state(CaConfig::default());
        let (dispatcher, id) = verbunden(&state);
        dispatcher
            .dispatch(nachricht(ControlPayload::SelectTg { tg: TalkGroup(42) }), id, Instant::now())
            .unwrap();

        let antwort = dispatcher
            .dispatch(nachricht(ControlPayload::TalkRequest), id, Instant::now())
            .unwrap();
        assert!(antwort.is_none());
        assert_eq!(state.kern.sprecher(TalkGroup(42)).unwrap().as_str(), "DL1ABC");
    }

    #[test]
    fn handshake_nachrichten_sind_verboten() {
        let state = test_state(CaConfig::default());
        let (dispatcher, id) = verbunden(&state);
        let knoten = TestKnoten::neu("DL1ABC");

        for payload in [
            ControlPayload::ProtoVer { major: 2, minor: 1 },
            ControlPayload::ClientCsr {
                callsign: knoten.callsign.clone(),
                csr_pem: knoten.csr(),
            },
            ControlPayload::StartEncryptionRequest,
        ] {
            let ergebnis = dispatcher.dispatch(nachricht(payload), id, Instant::now());
            assert!(matches!(ergebnis, Err(SignalingError::Protokoll(_))));
        }
        // Session bleibt davon unberuehrt
        assert_eq!(state.kern.anzahl(), 1);
    }

    #[test]
    fn ca_bundle_auf_anfrage() {
        let state = test_state(CaConfig::default());
        let (dispatcher, id) = verbunden(&state);
        let digest = state.ca.lock().ca_bundle().digest.clone();

        let antwort = dispatcher
            .dispatch(nachricht(ControlPayload::CaBundleRequest), id, Instant::now())
            .unwrap()
            .unwrap();
        match antwort.payload {
            ControlPayload::CaBundle { digest: d, .. } => assert_eq!(d, digest),
            p => panic!("ca_bundle erwartet, {p:?}"),
        }
    }
}
