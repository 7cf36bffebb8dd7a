use serde_json::Value;
use tracing::{debug, error};

use crate::store::{ObjectDef, StateStore, ValueType};
use crate::ups::Telemetry;

/// The one variable upsd reports as text that is published as a number.
const BATTERY_CHARGE: &str = "battery.charge";

/// Splits a dotted variable name into its channel and the state id under it.
///
/// `battery.charge.low` becomes channel `battery` and state `battery.charge-low`.
/// Names without a channel part are published at the root.
pub fn state_id(key: &str) -> (&str, String) {
    match key.split_once('.') {
        Some((channel, rest)) if !channel.is_empty() => {
            (channel, format!("{}.{}", channel, rest.replace('.', "-")))
        }
        _ => ("", key.to_string()),
    }
}

/// Parses the leading integer of `s`, ignoring whatever follows it ("87.5" is 87).
pub(crate) fn leading_int(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().ok().map(|n| sign * n)
}

/// Mirrors one variable listing into the store.
///
/// A channel is declared whenever a key's channel differs from the previous
/// key's, so keys are expected to arrive grouped by channel. Every state is
/// declared if missing and then written, changed or not. A failure on one key
/// is logged and the remaining keys are still written.
pub fn store_telemetry(store: &mut dyn StateStore, vars: &Telemetry) {
    let mut last = "";
    for (key, value) in vars {
        let (channel, id) = state_id(key);

        if !channel.is_empty() && channel != last {
            debug!("Create Channel {}", channel);
            if let Err(e) = store.set_object_not_exists(channel, ObjectDef::channel(channel)) {
                error!("Error creating Channel {}: {}", channel, e);
            }
        }
        last = channel;

        let (def, val) = if id == BATTERY_CHARGE {
            let def = ObjectDef::state(&id, ValueType::Number, "value.battery").unit("%");
            let val = leading_int(value).map(Value::from).unwrap_or(Value::Null);
            (def, val)
        } else {
            let def = ObjectDef::state(&id, ValueType::String, "state");
            (def, Value::String(value.clone()))
        };

        debug!("Create State {}", id);
        if let Err(e) = store.set_object_not_exists(&id, def) {
            error!("Error creating State {}: {}", id, e);
        }
        debug!("Set State {} = {}", id, val);
        if let Err(e) = store.set_state(&id, val, true) {
            error!("Error setting State {}: {}", id, e);
        }
    }
    debug!("All NUT values set");
}
