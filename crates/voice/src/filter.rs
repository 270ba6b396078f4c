//! Broadcast-Filter
//!
//! Kleiner Ausdrucksbaum aus Praedikaten ueber Registry-Eintraege. Filter
//! sind reine Werte und werden ueber `und`/`oder`/`nicht` kombiniert.

use reflector_core::types::{SessionId, TalkGroup};
use reflector_protocol::control::ProtoVersion;

use crate::registry::ClientEintrag;

/// Praedikat fuer Broadcasts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Alle,
    /// Alle ausser dieser Session
    AlleAusser(SessionId),
    /// Genau diese Session
    Session(SessionId),
    /// Protokollversion im Bereich `[ab, bis]` (`bis` offen wenn None)
    VersionBereich {
        ab: ProtoVersion,
        bis: Option<ProtoVersion>,
    },
    /// Sessions die diese Gruppe gewaehlt haben
    Gruppe(TalkGroup),
    /// Sessions die diese Gruppe mithoeren
    Monitor(TalkGroup),
    Und(Box<Filter>, Box<Filter>),
    Oder(Box<Filter>, Box<Filter>),
    Nicht(Box<Filter>),
}

impl Filter {
    /// Wertet den Filter fuer einen Eintrag aus
    pub fn passt(&self, e: &ClientEintrag) -> bool {
        match self {
            Self::Alle => true,
            Self::AlleAusser(id) => e.id != *id,
            Self::Session(id) => e.id == *id,
            Self::VersionBereich { ab, bis } => {
                e.version >= *ab && bis.map_or(true, |b| e.version <= b)
            }
            Self::Gruppe(tg) => !tg.ist_keine() && e.tg == *tg,
            Self::Monitor(tg) => e.monitore.contains(tg),
            Self::Und(a, b) => a.passt(e) && b.passt(e),
            Self::Oder(a, b) => a.passt(e) || b.passt(e),
            Self::Nicht(f) => !f.passt(e),
        }
    }

    pub fn und(self, anderer: Filter) -> Filter {
        Filter::Und(Box::new(self), Box::new(anderer))
    }

    pub fn oder(self, anderer: Filter) -> Filter {
        Filter::Oder(Box::new(self), Box::new(anderer))
    }

    pub fn nicht(self) -> Filter {
        Filter::Nicht(Box::new(self))
    }

    /// Alle Sessions ab dieser Version
    pub fn ab_version(ab: ProtoVersion) -> Filter {
        Filter::VersionBereich { ab, bis: None }
    }

    /// Mitglieder und Mithoerer einer Gruppe
    pub fn hoerer(tg: TalkGroup) -> Filter {
        Filter::Gruppe(tg).oder(Filter::Monitor(tg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::test_eintrag;

    #[test]
    fn grundfilter() {
        let mut e = test_eintrag(1, "DL1ABC");
        e.tg = TalkGroup(42);
        e.monitore.insert(TalkGroup(7));

        assert!(Filter::Alle.passt(&e));
        assert!(!Filter::AlleAusser(e.id).passt(&e));
        assert!(Filter::Session(e.id).passt(&e));
        assert!(Filter::Gruppe(TalkGroup(42)).passt(&e));
        assert!(!Filter::Gruppe(TalkGroup(7)).passt(&e));
        assert!(Filter::Monitor(TalkGroup(7)).passt(&e));
        assert!(Filter::hoerer(TalkGroup(7)).passt(&e));
        assert!(!Filter::hoerer(TalkGroup(8)).passt(&e));
    }

    #[test]
    fn gruppe_null_passt_nie() {
        let e = test_eintrag(1, "DL1ABC");
        assert!(!Filter::Gruppe(TalkGroup::KEINE).passt(&e));
    }

    #[test]
    fn versionsbereich() {
        let mut e = test_eintrag(1, "DL1ABC");
        e.version = ProtoVersion::neu(2, 0);
        assert!(!Filter::ab_version(ProtoVersion::neu(2, 1)).passt(&e));
        assert!(Filter::VersionBereich {
            ab: ProtoVersion::neu(1, 0),
            bis: Some(ProtoVersion::neu(2, 0)),
        }
        .passt(&e));
    }

    #[test]
    fn kombination() {
        let mut e = test_eintrag(1, "DL1ABC");
        e.tg = TalkGroup(42);
        let f = Filter::Gruppe(TalkGroup(42)).und(Filter::AlleAusser(e.id));
        assert!(!f.passt(&e));
        assert!(f.clone().nicht().passt(&e));
        assert!(f.oder(Filter::Alle).passt(&e));
    }
}
