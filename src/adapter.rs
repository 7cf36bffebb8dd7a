use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::Settings;
use crate::dispatch::button_for;
use crate::error::{AdapterError, StoreError};
use crate::mailer::AlertSink;
use crate::mapper::store_telemetry;
use crate::session::Session;
use crate::status::{parse_status, Severity, StatusReading};
use crate::store::{ObjectDef, ObjectKind, StateStore, ValueType};
use crate::ups::NutClient;

pub const INFO_CONNECTION: &str = "info.connection";
pub const STATUS_SEVERITY: &str = "status.severity";
pub const LAST_NOTIFY: &str = "status.last_notify";
pub const COMMANDS: &str = "commands";

const NOTIFY_ERROR: &str = "ERROR";
// Notifications that already describe the failure better than ERROR does.
const STICKY_NOTIFICATIONS: [&str; 3] = ["COMMBAD", "SHUTDOWN", "NOCOMM"];
// Notifications after which the UPS is known to be unreachable.
const OFFLINE_NOTIFICATIONS: [&str; 2] = ["COMMBAD", "NOCOMM"];
const OFFLINE_STATUS: &str = "OFF";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unknown,
    Connected,
    Disconnected,
}

/// A message-box request, e.g. the notification upsmon sends through its NOTIFYCMD.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub command: String,
    #[serde(default)]
    pub message: Option<Value>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Notification {
    pub notifytype: String,
    pub upsname: String,
}

/// Everything the control loop reacts to besides its own timer.
#[derive(Debug)]
pub enum Event {
    Message(Message),
    /// A write to a state from outside the bridge (never acknowledged).
    Write {
        id: String,
        val: Value,
        reply: Sender<Result<(), StoreError>>,
    },
    Dump(Sender<Value>),
    Stop,
}

/// The bridge between one UPS on upsd and the state store.
///
/// All mutable runtime state lives here and is only touched from the thread
/// running [`Adapter::run`], so at most one upsd session is open at a time.
pub struct Adapter<S: StateStore> {
    pub(crate) settings: Settings,
    client: Box<dyn NutClient>,
    pub(crate) store: S,
    alerts: Option<Box<dyn AlertSink>>,
    stop: Arc<AtomicBool>,
    connected: ConnectionState,
    commands_fetched: bool,
    next_poll: Option<Instant>,
    last_severity: Option<Severity>,
}

impl<S: StateStore> Adapter<S> {
    pub fn new(settings: Settings, client: Box<dyn NutClient>, store: S, stop: Arc<AtomicBool>) -> Adapter<S> {
        Adapter {
            settings,
            client,
            store,
            alerts: None,
            stop,
            connected: ConnectionState::Unknown,
            commands_fetched: false,
            next_poll: None,
            last_severity: None,
        }
    }

    pub fn with_alerts(mut self, alerts: Box<dyn AlertSink>) -> Adapter<S> {
        self.alerts = Some(alerts);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connected
    }

    pub fn next_poll(&self) -> Option<Instant> {
        self.next_poll
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn create(&mut self, id: &str, def: ObjectDef) {
        debug!("Create {:?} {}", def.kind, id);
        if let Err(e) = self.store.set_object_not_exists(id, def) {
            error!("Error creating {}: {}", id, e);
        }
    }

    pub(crate) fn write(&mut self, id: &str, val: Value) {
        debug!("Set State {} = {}", id, val);
        if let Err(e) = self.store.set_state(id, val, true) {
            error!("Error setting State {}: {}", id, e);
        }
    }

    /// Declares the fixed part of the state tree and runs the first poll.
    pub fn start(&mut self) -> Result<(), AdapterError> {
        self.create("info", ObjectDef::channel("info"));
        self.create(
            INFO_CONNECTION,
            ObjectDef::state(INFO_CONNECTION, ValueType::Boolean, "indicator.connected"),
        );
        self.set_connected(false);

        debug!("Create Channel status");
        self.create("status", ObjectDef::channel("status"));
        let labels: BTreeMap<i64, String> = Severity::ALL
            .iter()
            .map(|s| (s.value(), s.label().to_string()))
            .collect();
        self.create(
            STATUS_SEVERITY,
            ObjectDef::state(STATUS_SEVERITY, ValueType::Number, "indicator")
                .default_value(Value::from(Severity::Unknown.value()))
                .labels(labels),
        );
        self.apply_severity("", true);

        self.create(LAST_NOTIFY, ObjectDef::state(LAST_NOTIFY, ValueType::String, "state"));
        match self.store.get_state(LAST_NOTIFY) {
            Ok(None) => self.write(LAST_NOTIFY, Value::from("")),
            Ok(Some(_)) => {}
            Err(e) => error!("Error reading {}: {}", LAST_NOTIFY, e),
        }

        self.poll()
    }

    /// Serves events until a stop request arrives or every sender is gone.
    pub fn run(&mut self, events: Receiver<Event>) -> Result<(), AdapterError> {
        loop {
            if self.is_stopping() {
                self.unload();
                return Ok(());
            }

            let event = match self.next_poll {
                Some(at) => match events.recv_timeout(at.saturating_duration_since(Instant::now())) {
                    Ok(event) => Some(event),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => Some(Event::Stop),
                },
                None => Some(events.recv().unwrap_or(Event::Stop)),
            };

            match event {
                None => self.poll()?,
                Some(Event::Message(msg)) => self.handle_message(&msg)?,
                Some(Event::Write { id, val, reply }) => {
                    let result = match self.handle_write(&id, val) {
                        Err(AdapterError::Store(e)) => Err(e),
                        Err(e) => return Err(e),
                        Ok(()) => Ok(()),
                    };
                    let _ = reply.send(result);
                }
                Some(Event::Dump(reply)) => {
                    let _ = reply.send(self.store.dump());
                }
                Some(Event::Stop) => {
                    self.unload();
                    return Ok(());
                }
            }
        }
    }

    fn schedule(&mut self) {
        let interval = self.settings.update_interval();
        debug!("next poll in {}s", interval.as_secs());
        self.next_poll = Some(Instant::now() + interval);
    }

    fn cancel_timer(&mut self) {
        self.next_poll = None;
    }

    /// One polling phase. The next phase is scheduled whatever happens here.
    pub fn poll(&mut self) -> Result<(), AdapterError> {
        debug!("Start NUT update");
        self.cancel_timer();
        let result = self.update();
        self.schedule();
        result
    }

    /// Fetches telemetry on a fresh session, and the command list if still missing.
    pub(crate) fn update(&mut self) -> Result<(), AdapterError> {
        if let Some(mut session) = self.open_session()? {
            if !self.commands_fetched {
                self.fetch_commands(&mut session);
            }
            if session.is_ready() {
                self.fetch_values(&mut session);
            }
            session.close();
        }
        Ok(())
    }

    /// Opens a session to upsd. `None` means the attempt failed and has been recorded.
    ///
    /// An unusable port is the one error that is not retried.
    pub(crate) fn open_session(&mut self) -> Result<Option<Session>, AdapterError> {
        let port = match self.settings.port() {
            Ok(port) => port,
            Err(e) => {
                error!("{}", e);
                return Err(e.into());
            }
        };
        let mut session = Session::new(&self.settings.ups_name);
        match session.start(self.client.as_ref(), &self.settings.host_ip, port) {
            Ok(()) => {
                self.set_connected(true);
                Ok(Some(session))
            }
            Err(e) => {
                self.handle_connection_error(&e);
                Ok(None)
            }
        }
    }

    /// Records a lost or unreachable upsd: disconnected, ERROR unless a more
    /// specific notification is standing, and an unknown severity.
    pub(crate) fn handle_connection_error(&mut self, err: &dyn std::fmt::Display) {
        if self.is_stopping() {
            return;
        }
        error!("Error happened: {}", err);
        self.set_connected(false);
        match self.store.get_state(LAST_NOTIFY) {
            Ok(state) => {
                let sticky = state
                    .as_ref()
                    .and_then(|s| s.val.as_str())
                    .map_or(false, |v| STICKY_NOTIFICATIONS.contains(&v));
                if !sticky {
                    self.write(LAST_NOTIFY, Value::from(NOTIFY_ERROR));
                }
                self.apply_severity("", false);
            }
            Err(e) => error!("Error reading {}: {}", LAST_NOTIFY, e),
        }
    }

    fn set_connected(&mut self, connected: bool) {
        let state = if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        if self.connected == state {
            return;
        }
        self.connected = state;
        match self.store.set_state(INFO_CONNECTION, Value::from(connected), true) {
            Ok(()) => debug!("connected set to {}", connected),
            Err(e) => error!("Can not update connected state: {}", e),
        }
    }

    fn fetch_commands(&mut self, session: &mut Session) {
        match session.list_commands() {
            Ok(commands) => {
                debug!("Got commands, create and subscribe command states");
                self.init_commands(&commands);
                self.commands_fetched = true;
            }
            Err(e) if e.is_transport() => {
                error!("Err while getting all commands: {}", e);
                self.handle_connection_error(&e);
            }
            Err(e) => {
                error!("Err while getting all commands: {}", e);
                self.commands_fetched = true;
            }
        }
    }

    fn init_commands(&mut self, commands: &[String]) {
        debug!("Create Channel commands");
        self.create(COMMANDS, ObjectDef::channel(COMMANDS));
        for command in commands {
            let id = button_for(command);
            self.create(
                &id,
                ObjectDef::state(&id, ValueType::Boolean, "button")
                    .writable()
                    .default_value(Value::Bool(false)),
            );
            self.write(&id, Value::Bool(false));
        }
        if let Err(e) = self.store.subscribe_states(&format!("{}.*", COMMANDS)) {
            error!("Error subscribing to {}: {}", COMMANDS, e);
        }
    }

    /// One `LIST VAR`, mirrored into the store and classified.
    pub(crate) fn fetch_values(&mut self, session: &mut Session) {
        match session.list_vars() {
            Ok(vars) => {
                debug!("Got values, start setting them");
                store_telemetry(&mut self.store, &vars);
                let status = vars.get("ups.status").cloned().unwrap_or_default();
                self.apply_severity(&status, false);
            }
            Err(e) => {
                error!("Err while getting NUT values: {}", e);
                self.handle_connection_error(&e);
            }
        }
    }

    /// Publishes the status flags and severity derived from `status`.
    /// With `create_objects` the flag states are declared first.
    pub(crate) fn apply_severity(&mut self, status: &str, create_objects: bool) -> StatusReading {
        let reading = parse_status(status);
        for (name, found) in &reading.states {
            let id = format!("status.{}", name);
            if create_objects {
                self.create(&id, ObjectDef::state(&id, ValueType::Boolean, "indicator"));
            }
            self.write(&id, Value::Bool(*found));
        }
        self.write(STATUS_SEVERITY, Value::from(reading.severity.value()));
        if !create_objects {
            self.alert_on_change(&reading);
        }
        reading
    }

    fn alert_on_change(&mut self, reading: &StatusReading) {
        let previous = self.last_severity.replace(reading.severity);
        let previous = match previous {
            Some(previous) if previous != reading.severity => previous,
            _ => return,
        };
        info!("UPS severity changed from {} to {}", previous, reading.severity);
        if let Some(alerts) = &self.alerts {
            let last_notify = self
                .store
                .get_state(LAST_NOTIFY)
                .ok()
                .flatten()
                .and_then(|s| s.val.as_str().map(str::to_string))
                .unwrap_or_default();
            alerts.send(
                &format!("UPS severity {}", reading.severity.label()),
                &format!(
                    "UPS {} changed from {} to {}.\nActive status flags: {:?}\nLast notification: {:?}",
                    self.settings.ups_identity(),
                    previous,
                    reading.severity,
                    reading.active(),
                    last_notify
                ),
            );
        }
    }

    /// Handles a message-box request. Any request other than a notification for
    /// another UPS cancels the pending timer and polls right away.
    pub fn handle_message(&mut self, msg: &Message) -> Result<(), AdapterError> {
        info!("Message received = {:?}", msg);
        let update = match (msg.command.as_str(), &msg.message) {
            ("notify", Some(body)) => self.handle_notification(body),
            _ => true,
        };
        if update {
            self.poll()?;
        }
        Ok(())
    }

    fn handle_notification(&mut self, body: &Value) -> bool {
        let notification = match Notification::deserialize(body) {
            Ok(n) => n,
            Err(e) => {
                error!("Invalid notification {}: {}", body, e);
                return false;
            }
        };
        info!("got Notify {} for: {}", notification.notifytype, notification.upsname);
        let own_name = self.settings.ups_identity();
        if notification.upsname != own_name {
            debug!("ignoring notification, this bridge is {}", own_name);
            return false;
        }
        self.write(LAST_NOTIFY, Value::from(notification.notifytype.as_str()));
        if OFFLINE_NOTIFICATIONS.contains(&notification.notifytype.as_str()) {
            self.apply_severity(OFFLINE_STATUS, false);
        }
        true
    }

    /// Applies a write from outside and hands subscribed ids to the command dispatcher.
    pub fn handle_write(&mut self, id: &str, val: Value) -> Result<(), AdapterError> {
        match self.store.get_object(id)? {
            Some(def) if def.kind == ObjectKind::State && def.write => {}
            Some(_) => return Err(StoreError::ReadOnly { id: id.to_string() }.into()),
            None => return Err(StoreError::NoObject(id.to_string()).into()),
        }
        self.store.set_state(id, val, false)?;
        if self.store.is_subscribed(id) {
            if let Some(state) = self.store.get_state(id)? {
                self.on_state_change(id, &state)?;
            }
        }
        Ok(())
    }

    /// Stops polling. Always completes, even when the final write fails.
    pub fn unload(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.cancel_timer();
        self.set_connected(false);
        info!("stopped polling {}", self.settings.ups_identity());
    }
}
