//! Verschluesselung des UDP-Kanals
//!
//! AES-256-GCM mit getrennten Schluesseln und Salts pro Richtung.
//!
//! ## Nonce-Aufbau
//! ```text
//! [salt(4)] [zaehler(8, big-endian)]
//! ```
//!
//! ## AAD
//! Der 13-Byte-Datagrammkopf (Version, Client-ID, Zaehler). Ein
//! Datagramm ist dadurch an Session und Zaehlerwert gebunden.
//!
//! Der Sendezaehler beginnt bei 1 und wiederholt sich fuer einen Schluessel
//! nie. Beim Empfang wird jeder Zaehler <= dem hoechsten bereits
//! angenommenen verworfen. Der hoechste Wert wird erst nach erfolgreicher
//! Entschluesselung fortgeschrieben.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use reflector_core::types::SessionId;
use reflector_protocol::control::UdpSchluesselParameter;
use reflector_protocol::datagram::DatagrammKopf;

use crate::error::{CryptoError, CryptoResult};

/// Laenge eines AES-256-Schluessels
pub const SCHLUESSEL_LAENGE: usize = 32;

/// Laenge des Nonce-Salts
pub const SALT_LAENGE: usize = 4;

/// Sicht auf das Schluesselmaterial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rolle {
    /// Reflector: sendet mit dem Server-, empfaengt mit dem Client-Schluessel
    Server,
    /// Knoten: umgekehrt
    Client,
}

struct Richtung {
    cipher: Aes256Gcm,
    salt: [u8; SALT_LAENGE],
}

impl Richtung {
    fn neu(schluessel: &[u8], salt: &[u8]) -> CryptoResult<Self> {
        if schluessel.len() != SCHLUESSEL_LAENGE {
            return Err(CryptoError::UngueltigeSchluesselLaenge {
                erwartet: SCHLUESSEL_LAENGE,
                erhalten: schluessel.len(),
            });
        }
        let salt: [u8; SALT_LAENGE] =
            salt.try_into()
                .map_err(|_| CryptoError::UngueltigeSchluesselLaenge {
                    erwartet: SALT_LAENGE,
                    erhalten: salt.len(),
                })?;
        let cipher = Aes256Gcm::new_from_slice(schluessel)
            .map_err(|e| CryptoError::UngueltigeDaten(e.to_string()))?;
        Ok(Self { cipher, salt })
    }

    fn nonce(&self, zaehler: u64) -> [u8; 12] {
        let mut n = [0u8; 12];
        n[..SALT_LAENGE].copy_from_slice(&self.salt);
        n[SALT_LAENGE..].copy_from_slice(&zaehler.to_be_bytes());
        n
    }
}

/// Cipher-Zustand einer Session
pub struct UdpCipher {
    client_id: SessionId,
    senden: Richtung,
    empfangen: Richtung,
    /// Naechster zu verwendender Sendezaehler
    sende_zaehler: u64,
    /// Hoechster erfolgreich entschluesselter Zaehler (0 = noch keiner)
    hoechster_empfangen: u64,
}

impl std::fmt::Debug for UdpCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpCipher")
            .field("client_id", &self.client_id)
            .field("sende_zaehler", &self.sende_zaehler)
            .field("hoechster_empfangen", &self.hoechster_empfangen)
            .finish()
    }
}

impl UdpCipher {
    /// Erzeugt frisches Schluesselmaterial fuer eine Session (Server-Sicht)
    ///
    /// Die Parameter werden dem Knoten ueber den TLS-Kanal uebermittelt.
    pub fn erzeugen(client_id: SessionId) -> CryptoResult<(Self, UdpSchluesselParameter)> {
        let mut material = [0u8; 2 * (SCHLUESSEL_LAENGE + SALT_LAENGE)];
        OsRng.fill_bytes(&mut material);
        let (client_schluessel, rest) = material.split_at(SCHLUESSEL_LAENGE);
        let (client_salt, rest) = rest.split_at(SALT_LAENGE);
        let (server_schluessel, server_salt) = rest.split_at(SCHLUESSEL_LAENGE);

        let params = UdpSchluesselParameter {
            client_schluessel: B64.encode(client_schluessel),
            client_salt: B64.encode(client_salt),
            server_schluessel: B64.encode(server_schluessel),
            server_salt: B64.encode(server_salt),
        };
        let cipher = Self::aus_parametern(client_id, &params, Rolle::Server)?;
        Ok((cipher, params))
    }

    /// Baut den Cipher aus uebermittelten Parametern
    pub fn aus_parametern(
        client_id: SessionId,
        params: &UdpSchluesselParameter,
        rolle: Rolle,
    ) -> CryptoResult<Self> {
        let client = Richtung::neu(
            &B64.decode(&params.client_schluessel)?,
            &B64.decode(&params.client_salt)?,
        )?;
        let server = Richtung::neu(
            &B64.decode(&params.server_schluessel)?,
            &B64.decode(&params.server_salt)?,
        )?;
        let (senden, empfangen) = match rolle {
            Rolle::Server => (server, client),
            Rolle::Client => (client, server),
        };
        Ok(Self {
            client_id,
            senden,
            empfangen,
            sende_zaehler: 1,
            hoechster_empfangen: 0,
        })
    }

    pub fn client_id(&self) -> SessionId {
        self.client_id
    }

    /// Hoechster bisher angenommener Empfangszaehler
    pub fn hoechster_empfangen(&self) -> u64 {
        self.hoechster_empfangen
    }

    /// Verschluesselt einen Klartext zu einem vollstaendigen Datagramm
    pub fn verschluesseln(&mut self, klartext: &[u8]) -> CryptoResult<Vec<u8>> {
        let zaehler = self.sende_zaehler;
        if zaehler == u64::MAX {
            return Err(CryptoError::ZaehlerErschoepft);
        }

        let kopf = DatagrammKopf::neu(self.client_id, zaehler).encode();
        let nonce = self.senden.nonce(zaehler);
        let chiffrat = self
            .senden
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: klartext,
                    aad: &kopf,
                },
            )
            .map_err(|e| CryptoError::Verschluesselung(e.to_string()))?;

        self.sende_zaehler += 1;

        let mut datagramm = Vec::with_capacity(kopf.len() + chiffrat.len());
        datagramm.extend_from_slice(&kopf);
        datagramm.extend_from_slice(&chiffrat);
        Ok(datagramm)
    }

    /// Prueft und entschluesselt ein empfangenes Datagramm
    ///
    /// Wiederholungen und Tag-Fehler lassen den Zustand unveraendert.
    pub fn entschluesseln(&mut self, datagramm: &[u8]) -> CryptoResult<Vec<u8>> {
        let kopf = DatagrammKopf::decode(datagramm)
            .map_err(|e| CryptoError::UngueltigeDaten(e.to_string()))?;
        if kopf.client_id != self.client_id {
            return Err(CryptoError::UngueltigeDaten(format!(
                "Client-ID {} passt nicht zu {}",
                kopf.client_id, self.client_id
            )));
        }
        if kopf.zaehler <= self.hoechster_empfangen {
            return Err(CryptoError::Wiederholung {
                zaehler: kopf.zaehler,
                hoechster: self.hoechster_empfangen,
            });
        }

        let (aad, chiffrat) = datagramm.split_at(DatagrammKopf::GROESSE);
        let nonce = self.empfangen.nonce(kopf.zaehler);
        let klartext = self
            .empfangen
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload { msg: chiffrat, aad },
            )
            .map_err(|_| CryptoError::Entschluesselung("Authentifizierungs-Tag ungueltig".into()))?;

        self.hoechster_empfangen = kopf.zaehler;
        Ok(klartext)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn paar() -> (UdpCipher, UdpCipher) {
        let (server, params) = UdpCipher::erzeugen(SessionId(0x0001_0002)).unwrap();
        let client = UdpCipher::aus_parametern(SessionId(0x0001_0002), &params, Rolle::Client)
            .unwrap();
        (server, client)
    }

    #[test]
    fn beide_richtungen() {
        let (mut server, mut client) = paar();
        let d = client.verschluesseln(b"\x01audio").unwrap();
        assert_eq!(server.entschluesseln(&d).unwrap(), b"\x01audio");

        let d = server.verschluesseln(b"\x00").unwrap();
        assert_eq!(client.entschluesseln(&d).unwrap(), b"\x00");
    }

    #[test]
    fn zaehler_beginnt_bei_eins_und_steigt() {
        let (_, mut client) = paar();
        let a = DatagrammKopf::decode(&client.verschluesseln(b"a").unwrap()).unwrap();
        let b = DatagrammKopf::decode(&client.verschluesseln(b"b").unwrap()).unwrap();
        assert_eq!(a.zaehler, 1);
        assert_eq!(b.zaehler, 2);
    }

    #[test]
    fn wiederholung_wird_verworfen() {
        let (mut server, mut client) = paar();
        let erstes = client.verschluesseln(b"1").unwrap();
        let zweites = client.verschluesseln(b"2").unwrap();

        assert!(server.entschluesseln(&zweites).is_ok());
        assert!(matches!(
            server.entschluesseln(&zweites),
            Err(CryptoError::Wiederholung { zaehler: 2, hoechster: 2 })
        ));
        // Aelterer Zaehler kommt verspaetet an
        assert!(matches!(
            server.entschluesseln(&erstes),
            Err(CryptoError::Wiederholung { .. })
        ));

        let drittes = client.verschluesseln(b"3").unwrap();
        assert_eq!(server.entschluesseln(&drittes).unwrap(), b"3");
    }

    #[test]
    fn tag_fehler_aendert_nichts() {
        let (mut server, mut client) = paar();
        let mut d = client.verschluesseln(b"geheim").unwrap();
        let letztes = d.len() - 1;
        d[letztes] ^= 0x01;
        assert!(matches!(
            server.entschluesseln(&d),
            Err(CryptoError::Entschluesselung(_))
        ));
        assert_eq!(server.hoechster_empfangen(), 0);

        // Das unveraenderte Datagramm mit gleichem Zaehler wird weiterhin angenommen
        d[letztes] ^= 0x01;
        assert!(server.entschluesseln(&d).is_ok());
        assert_eq!(server.hoechster_empfangen(), 1);
    }

    #[test]
    fn manipulierte_aad_faellt_auf() {
        let (mut server, mut client) = paar();
        let mut d = client.verschluesseln(b"x").unwrap();
        // Zaehler im Kopf hochsetzen: Nonce und AAD passen nicht mehr
        d[12] = 0x09;
        assert!(server.entschluesseln(&d).is_err());
        assert_eq!(server.hoechster_empfangen(), 0);
    }

    #[test]
    fn fremde_client_id() {
        let (mut server, _) = paar();
        let (_, params) = UdpCipher::erzeugen(SessionId(7)).unwrap();
        let mut fremd = UdpCipher::aus_parametern(SessionId(7), &params, Rolle::Client).unwrap();
        let d = fremd.verschluesseln(b"x").unwrap();
        assert!(server.entschluesseln(&d).is_err());
    }

    #[test]
    fn falsche_schluessellaenge() {
        let params = UdpSchluesselParameter {
            client_schluessel: B64.encode([0u8; 16]),
            client_salt: B64.encode([0u8; 4]),
            server_schluessel: B64.encode([0u8; 32]),
            server_salt: B64.encode([0u8; 4]),
        };
        assert!(matches!(
            UdpCipher::aus_parametern(SessionId(1), &params, Rolle::Server),
            Err(CryptoError::UngueltigeSchluesselLaenge { erwartet: 32, erhalten: 16 })
        ));
    }
}
