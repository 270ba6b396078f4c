//! Heartbeat-Verfolgung
//!
//! Ein [`Herzschlag`] beobachtet eine Richtung eines Kanals: wann zuletzt
//! etwas empfangen wurde und wann der naechste eigene Heartbeat faellig
//! ist. TCP und UDP werden mit getrennten Instanzen verfolgt; nur ein
//! abgelaufener TCP-Herzschlag fuehrt zur Trennung.

use std::time::{Duration, Instant};

/// Liveness-Zustand eines Kanals
#[derive(Debug, Clone)]
pub struct Herzschlag {
    intervall: Duration,
    timeout: Duration,
    letzter_empfang: Instant,
    letzter_versand: Instant,
    empfangen: u64,
    gesendet: u64,
}

impl Herzschlag {
    pub fn neu(intervall: Duration, timeout: Duration, jetzt: Instant) -> Self {
        Self {
            intervall,
            timeout,
            letzter_empfang: jetzt,
            letzter_versand: jetzt,
            empfangen: 0,
            gesendet: 0,
        }
    }

    /// Beliebiger eingehender Verkehr zaehlt als Lebenszeichen
    pub fn empfangen(&mut self, jetzt: Instant) {
        self.letzter_empfang = jetzt;
        self.empfangen += 1;
    }

    /// Gibt true zurueck wenn ein eigener Heartbeat gesendet werden sollte
    pub fn senden_faellig(&self, jetzt: Instant) -> bool {
        jetzt.saturating_duration_since(self.letzter_versand) >= self.intervall
    }

    /// Zeitpunkt an dem der naechste eigene Heartbeat faellig wird
    pub fn naechster_versand(&self) -> Instant {
        self.letzter_versand + self.intervall
    }

    pub fn gesendet(&mut self, jetzt: Instant) {
        self.letzter_versand = jetzt;
        self.gesendet += 1;
    }

    /// Gibt true zurueck wenn innerhalb des Timeouts nichts empfangen wurde
    pub fn abgelaufen(&self, jetzt: Instant) -> bool {
        jetzt.saturating_duration_since(self.letzter_empfang) >= self.timeout
    }

    /// Zeitpunkt an dem ohne weiteren Empfang der Timeout eintritt
    pub fn frist(&self) -> Instant {
        self.letzter_empfang + self.timeout
    }

    pub fn zaehler(&self) -> (u64, u64) {
        (self.empfangen, self.gesendet)
    }
}
