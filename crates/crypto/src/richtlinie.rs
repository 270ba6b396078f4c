//! Rufzeichen- und E-Mail-Richtlinie
//!
//! Muster sind einfache Wildcards: `*` passt auf beliebig viele Zeichen,
//! `?` auf genau eines. Der Vergleich ignoriert Gross-/Kleinschreibung.
//!
//! Das sind bewusst keine regulaeren Ausdruecke. Ein Muster passt immer auf
//! den ganzen Text, und Zeichen wie `.`, `+` oder `[` stehen fuer sich
//! selbst. Regex-Listen aus anderen Reflector-Konfigurationen muessen beim
//! Uebernehmen umgeschrieben werden, etwa `^DL.*$` zu `DL*`.

use serde::{Deserialize, Serialize};

/// Richtlinie fuer beantragte Rufzeichen und E-Mail-Adressen
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Richtlinie {
    /// Erlaubte Rufzeichen-Muster (leer = alle erlaubt)
    pub callsign_erlaubt: Vec<String>,
    /// Verbotene Rufzeichen-Muster (hat Vorrang)
    pub callsign_verboten: Vec<String>,
    /// Erlaubte E-Mail-Domains (leer = alle erlaubt)
    ///
    /// Die Muster werden nur gegen den Teil nach dem letzten `@` geprueft.
    pub email_domains: Vec<String>,
}

impl Richtlinie {
    /// Prueft ein Rufzeichen gegen Erlaubt- und Verboten-Listen
    pub fn callsign_erlaubt(&self, callsign: &str) -> bool {
        if self
            .callsign_verboten
            .iter()
            .any(|m| muster_passt(m, callsign))
        {
            return false;
        }
        self.callsign_erlaubt.is_empty()
            || self
                .callsign_erlaubt
                .iter()
                .any(|m| muster_passt(m, callsign))
    }

    /// Prueft eine E-Mail-Adresse gegen die Domain-Allow-List
    pub fn email_erlaubt(&self, email: &str) -> bool {
        let Some((lokal, domain)) = email.rsplit_once('@') else {
            return false;
        };
        if lokal.is_empty() || domain.is_empty() {
            return false;
        }
        self.email_domains.is_empty()
            || self
                .email_domains
                .iter()
                .any(|d| muster_passt(d, domain))
    }
}

/// Wildcard-Vergleich ohne Beachtung der Gross-/Kleinschreibung
pub fn muster_passt(muster: &str, text: &str) -> bool {
    let m: Vec<char> = muster.to_ascii_uppercase().chars().collect();
    let t: Vec<char> = text.to_ascii_uppercase().chars().collect();

    // Iteratives Matching mit Rueckspruengen zum letzten '*'
    let (mut mi, mut ti) = (0usize, 0usize);
    let mut stern: Option<(usize, usize)> = None;
    while ti < t.len() {
        if mi < m.len() && (m[mi] == '?' || m[mi] == t[ti]) {
            mi += 1;
            ti += 1;
        } else if mi < m.len() && m[mi] == '*' {
            stern = Some((mi, ti));
            mi += 1;
        } else if let Some((sm, st)) = stern {
            mi = sm + 1;
            ti = st + 1;
            stern = Some((sm, st + 1));
        } else {
            return false;
        }
    }
    m[mi..].iter().all(|&c| c == '*')
}
