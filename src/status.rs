use std::fmt;

/// Aggregate health of the UPS, ordered by the value published in `status.severity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Idle = 0,
    Operating = 1,
    OperatingCritical = 2,
    ActionNeeded = 3,
    Unknown = 4,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Idle,
        Severity::Operating,
        Severity::OperatingCritical,
        Severity::ActionNeeded,
        Severity::Unknown,
    ];

    pub fn value(self) -> i64 {
        self as i64
    }

    pub fn label(self) -> &'static str {
        match self {
            Severity::Idle => "idle",
            Severity::Operating => "operating",
            Severity::OperatingCritical => "operating_critical",
            Severity::ActionNeeded => "action_needed",
            Severity::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.value())
    }
}

/// Buckets raised by the status codes, independent of each other.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeverityFlags {
    pub idle: bool,
    pub operating: bool,
    pub operating_critical: bool,
    pub action_needed: bool,
}

impl SeverityFlags {
    fn raise(&mut self, bucket: Severity) {
        match bucket {
            Severity::Idle => self.idle = true,
            Severity::Operating => self.operating = true,
            Severity::OperatingCritical => self.operating_critical = true,
            Severity::ActionNeeded => self.action_needed = true,
            Severity::Unknown => {}
        }
    }

    /// Critical beats action needed beats operating beats idle.
    pub fn level(&self) -> Severity {
        if self.operating_critical {
            Severity::OperatingCritical
        } else if self.action_needed {
            Severity::ActionNeeded
        } else if self.operating {
            Severity::Operating
        } else if self.idle {
            Severity::Idle
        } else {
            Severity::Unknown
        }
    }
}

/// A `ups.status` code, the state it is published under and the bucket it raises.
#[derive(Debug)]
pub struct StatusCode {
    pub code: &'static str,
    pub name: &'static str,
    pub bucket: Severity,
}

const fn code(code: &'static str, name: &'static str, bucket: Severity) -> StatusCode {
    StatusCode { code, name, bucket }
}

pub const STATUS_CODES: [StatusCode; 14] = [
    code("OL", "online", Severity::Idle),
    code("OB", "onbattery", Severity::Operating),
    code("LB", "lowbattery", Severity::OperatingCritical),
    code("HB", "highbattery", Severity::OperatingCritical),
    code("RB", "replacebattery", Severity::ActionNeeded),
    code("CHRG", "charging", Severity::Idle),
    code("DISCHRG", "discharging", Severity::Operating),
    code("BYPASS", "bypass", Severity::ActionNeeded),
    code("CAL", "calibration", Severity::Operating),
    code("OFF", "offline", Severity::ActionNeeded),
    code("OVER", "overload", Severity::ActionNeeded),
    code("TRIM", "trimming", Severity::Operating),
    code("BOOST", "boosting", Severity::Operating),
    code("FSD", "shutdown", Severity::OperatingCritical),
];

/// Everything derived from one `ups.status` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReading {
    /// One entry per [`STATUS_CODES`] entry, in table order.
    pub states: Vec<(&'static str, bool)>,
    pub flags: SeverityFlags,
    pub severity: Severity,
}

impl StatusReading {
    pub fn is_set(&self, name: &str) -> bool {
        self.states.iter().any(|(n, on)| *n == name && *on)
    }

    pub fn active(&self) -> Vec<&'static str> {
        self.states
            .iter()
            .filter(|(_, on)| *on)
            .map(|(n, _)| *n)
            .collect()
    }
}

/// Classifies a space separated `ups.status` string.
///
/// A code counts as present when `" " + code` occurs anywhere in the padded
/// string, so codes are matched as token prefixes (`OVERHEAT` reads as `OVER`).
/// A forced shutdown (`FSD`) implies on battery and low battery.
pub fn parse_status(status: &str) -> StatusReading {
    let mut status = status.to_string();
    if status.contains("FSD") {
        status.push_str(" OB LB");
    }
    let padded = format!(" {} ", status);

    let mut flags = SeverityFlags::default();
    let states = STATUS_CODES
        .iter()
        .map(|c| {
            let found = padded.contains(&format!(" {}", c.code));
            if found {
                flags.raise(c.bucket);
            }
            (c.name, found)
        })
        .collect();

    StatusReading {
        states,
        severity: flags.level(),
        flags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_is_idle() {
        let reading = parse_status("OL");
        assert_eq!(reading.active(), vec!["online"]);
        assert_eq!(reading.severity, Severity::Idle);
        assert_eq!(reading.severity.value(), 0);
    }

    #[test]
    fn low_battery_beats_on_battery() {
        let reading = parse_status("OB LB");
        assert_eq!(reading.active(), vec!["onbattery", "lowbattery"]);
        assert!(reading.flags.operating);
        assert!(reading.flags.operating_critical);
        assert_eq!(reading.severity, Severity::OperatingCritical);
    }

    #[test]
    fn empty_status_is_unknown() {
        let reading = parse_status("");
        assert!(reading.active().is_empty());
        assert_eq!(reading.states.len(), 14);
        assert_eq!(reading.flags, SeverityFlags::default());
        assert_eq!(reading.severity, Severity::Unknown);
    }

    #[test]
    fn replace_battery_needs_action() {
        let reading = parse_status("RB");
        assert_eq!(reading.active(), vec!["replacebattery"]);
        assert_eq!(reading.severity.value(), 3);
    }

    #[test]
    fn forced_shutdown_implies_battery_flags() {
        for status in ["FSD", "OL FSD", "FSD CHRG"] {
            let reading = parse_status(status);
            assert!(reading.is_set("shutdown"), "{}", status);
            assert!(reading.is_set("onbattery"), "{}", status);
            assert!(reading.is_set("lowbattery"), "{}", status);
            assert_eq!(reading.severity, Severity::OperatingCritical);
        }
    }

    #[test]
    fn codes_do_not_match_inside_other_codes() {
        let reading = parse_status("OB DISCHRG");
        assert!(!reading.is_set("charging"));
        assert!(reading.is_set("discharging"));
        assert_eq!(reading.severity, Severity::Operating);

        let reading = parse_status("OL CHRG");
        assert_eq!(reading.active(), vec!["online", "charging"]);
        assert_eq!(reading.severity, Severity::Idle);
    }

    #[test]
    fn codes_match_as_token_prefixes() {
        let reading = parse_status("OL OVERHEAT");
        assert!(reading.is_set("overload"));
        assert_eq!(reading.severity, Severity::ActionNeeded);
    }

    #[test]
    fn offline_needs_action() {
        let reading = parse_status("OFF");
        assert_eq!(reading.active(), vec!["offline"]);
        assert_eq!(reading.severity, Severity::ActionNeeded);
    }

    #[test]
    fn critical_beats_action_needed() {
        assert_eq!(parse_status("OB LB RB").severity, Severity::OperatingCritical);
        assert_eq!(parse_status("OL RB").severity, Severity::ActionNeeded);
        assert_eq!(parse_status("OL TRIM").severity, Severity::Operating);
    }
}
