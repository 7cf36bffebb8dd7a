use serde_json::Value;
use tracing::{debug, error, info};

use crate::adapter::{Adapter, COMMANDS};
use crate::error::{AdapterError, NutError};
use crate::session::Session;
use crate::store::{State, StateStore};

/// Only a set value fires a command; clearing a button does nothing.
fn is_trigger(val: &Value) -> bool {
    !matches!(val, Value::Null | Value::Bool(false))
}

/// The button that fires `command`, e.g. `commands.beeper-toggle` for `beeper.toggle`.
pub fn button_for(command: &str) -> String {
    format!("{}.{}", COMMANDS, command.replace('.', "-"))
}

/// Maps a button id such as `commands.test-battery-start` back to `test.battery.start`.
pub fn command_for(id: &str) -> Option<String> {
    let leaf = id.strip_prefix(COMMANDS)?.strip_prefix('.')?;
    if leaf.is_empty() {
        return None;
    }
    Some(leaf.replace('-', "."))
}

impl<S: StateStore> Adapter<S> {
    /// Runs the command behind a button that was pressed from outside.
    ///
    /// The button is reset once the command has been sent, and the UPS is
    /// polled straight away so the store shows how it reacted.
    pub fn on_state_change(&mut self, id: &str, state: &State) -> Result<(), AdapterError> {
        debug!("stateChange {} {:?}", id, state);
        let command = match command_for(id) {
            Some(command) => command,
            None => return Ok(()),
        };
        if state.ack || !is_trigger(&state.val) {
            return Ok(());
        }

        let mut session = match self.open_session()? {
            Some(session) => session,
            None => {
                error!("UPS not available - Error while sending command: {}", command);
                return Ok(());
            }
        };
        if self.is_stopping() {
            return Ok(());
        }

        if let Err((stage, e)) = self.send_command(&mut session, &command) {
            error!("Err while sending {} for command {}: {}", stage, command, e);
            session.close();
            if e.is_transport() {
                self.handle_connection_error(&e);
            }
        }
        self.write(id, Value::Bool(false));

        if session.is_ready() {
            self.fetch_values(&mut session);
            session.close();
            Ok(())
        } else {
            self.update()
        }
    }

    /// Logs in when credentials are configured, then sends the command.
    /// Stops at the first failing step and names it.
    fn send_command(&self, session: &mut Session, command: &str) -> Result<(), (&'static str, NutError)> {
        match self.settings.credentials() {
            Some((username, password)) => {
                info!("send username for command {}", command);
                session.set_username(username).map_err(|e| ("username", e))?;
                info!("send password for command {}", command);
                session.set_password(password).map_err(|e| ("password", e))?;
                info!("send command {}", command);
            }
            None => info!("send command {} without username and password", command),
        }
        session.run_command(command).map_err(|e| ("command", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::tests::{adapter, adapter_with, value};
    use crate::adapter::{LAST_NOTIFY, STATUS_SEVERITY};
    use crate::config::Settings;
    use crate::store::MemoryStore;
    use crate::testing::FakeClient;
    use serde_json::json;

    const BEEPER: &str = "commands.beeper-toggle";

    fn started(client: &FakeClient, settings: Option<Settings>) -> Adapter<MemoryStore> {
        client.set_commands(&["beeper.toggle", "test.battery.start"]);
        let mut adapter = match settings {
            Some(settings) => adapter_with(client, settings),
            None => adapter(client),
        };
        adapter.start().unwrap();
        client.clear_calls();
        adapter
    }

    fn with_credentials() -> Settings {
        Settings {
            ups_name: "myups".into(),
            username: Some("admin".into()),
            password: Some("secret".into()),
            ..Settings::default()
        }
    }

    #[test]
    fn maps_button_ids_to_commands() {
        assert_eq!(button_for("beeper.toggle"), BEEPER);
        assert_eq!(command_for("commands.test-battery-start").as_deref(), Some("test.battery.start"));
        assert_eq!(command_for("commands."), None);
        assert_eq!(command_for("commandsX.beeper"), None);
        assert_eq!(command_for("status.severity"), None);
    }

    #[test]
    fn runs_command_then_refetches_on_same_session() {
        let client = FakeClient::with_vars(&[("ups.status", "OL")]);
        let mut adapter = started(&client, None);

        client.set_var("ups.status", "OL CAL");
        adapter.handle_write("commands.test-battery-start", json!(true)).unwrap();

        assert_eq!(
            client.calls(),
            vec!["INSTCMD myups test.battery.start", "LIST VAR myups", "LOGOUT"]
        );
        let state = adapter.store().get_state("commands.test-battery-start").unwrap().unwrap();
        assert_eq!(state.val, json!(false));
        assert!(state.ack);
        assert_eq!(value(&adapter, "status.calibration"), Some(&json!(true)));
        assert_eq!(value(&adapter, STATUS_SEVERITY), Some(&json!(1)));
    }

    #[test]
    fn logs_in_before_the_command() {
        let client = FakeClient::with_vars(&[("ups.status", "OL")]);
        let mut adapter = started(&client, Some(with_credentials()));

        adapter.handle_write(BEEPER, json!(true)).unwrap();
        assert_eq!(
            client.calls(),
            vec![
                "USERNAME admin",
                "PASSWORD secret",
                "INSTCMD myups beeper.toggle",
                "LIST VAR myups",
                "LOGOUT"
            ]
        );
    }

    #[test]
    fn failed_login_aborts_but_still_refetches() {
        let client = FakeClient::with_vars(&[("ups.status", "OL")]);
        let mut adapter = started(&client, Some(with_credentials()));
        client.refuse("PASSWORD", "INVALID-PASSWORD");

        adapter.handle_write(BEEPER, json!(true)).unwrap();
        assert_eq!(
            client.calls(),
            vec!["USERNAME admin", "PASSWORD secret", "LOGOUT", "LIST VAR myups", "LOGOUT"]
        );
        assert_eq!(value(&adapter, BEEPER), Some(&json!(false)));
        assert_eq!(value(&adapter, LAST_NOTIFY), Some(&json!("")));
    }

    #[test]
    fn refused_command_closes_and_refetches() {
        let client = FakeClient::with_vars(&[("ups.status", "OL")]);
        let mut adapter = started(&client, None);
        client.refuse("INSTCMD", "CMD-NOT-SUPPORTED");

        adapter.handle_write(BEEPER, json!(true)).unwrap();
        assert_eq!(
            client.calls(),
            vec!["INSTCMD myups beeper.toggle", "LOGOUT", "LIST VAR myups", "LOGOUT"]
        );
        assert_eq!(value(&adapter, BEEPER), Some(&json!(false)));
    }

    #[test]
    fn unreachable_ups_leaves_button_pressed() {
        let client = FakeClient::with_vars(&[("ups.status", "OL")]);
        let mut adapter = started(&client, None);
        client.set_reachable(false);

        adapter.handle_write(BEEPER, json!(true)).unwrap();
        let state = adapter.store().get_state(BEEPER).unwrap().unwrap();
        assert_eq!(state.val, json!(true));
        assert!(!state.ack);
        assert_eq!(value(&adapter, LAST_NOTIFY), Some(&json!("ERROR")));
    }

    #[test]
    fn cleared_or_acknowledged_buttons_do_nothing() {
        let client = FakeClient::with_vars(&[("ups.status", "OL")]);
        let mut adapter = started(&client, None);

        adapter.handle_write(BEEPER, json!(false)).unwrap();
        adapter.handle_write(BEEPER, Value::Null).unwrap();
        adapter
            .on_state_change(BEEPER, &State::new(json!(true), true))
            .unwrap();
        adapter
            .on_state_change("status.severity", &State::new(json!(3), false))
            .unwrap();
        assert!(client.calls().is_empty());
    }

    #[test]
    fn scheduled_poll_is_untouched() {
        let client = FakeClient::with_vars(&[("ups.status", "OL")]);
        let mut adapter = started(&client, None);
        let next = adapter.next_poll();

        adapter.handle_write(BEEPER, json!(true)).unwrap();
        assert_eq!(adapter.next_poll(), next);
    }
}
