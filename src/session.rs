use tracing::debug;

use crate::error::NutError;
use crate::ups::{NutClient, NutConnection, Telemetry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Ready,
    Closed,
    /// Absorbing: the connection failed and cannot be used again.
    Errored,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Closed => "closed",
            SessionState::Errored => "errored",
        }
    }
}

/// One transient connection to upsd for a single UPS.
///
/// The session is opened with [`Session::start`], used for one unit of work and
/// closed again. A failure of the connection itself moves it to
/// [`SessionState::Errored`]; a request upsd merely refuses leaves it ready.
pub struct Session {
    ups: String,
    state: SessionState,
    conn: Option<Box<dyn NutConnection>>,
}

impl Session {
    pub fn new(ups: &str) -> Session {
        Session {
            ups: ups.to_string(),
            state: SessionState::Idle,
            conn: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn start(&mut self, client: &dyn NutClient, host: &str, port: u16) -> Result<(), NutError> {
        if self.state != SessionState::Idle {
            return Err(NutError::NotReady(self.state.name()));
        }
        self.state = SessionState::Connecting;
        match client.connect(host, port) {
            Ok(conn) => {
                debug!("NUT connection ready");
                self.conn = Some(conn);
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Errored;
                Err(e)
            }
        }
    }

    fn with_conn<T>(
        &mut self,
        op: impl FnOnce(&mut dyn NutConnection, &str) -> Result<T, NutError>,
    ) -> Result<T, NutError> {
        let conn = match (self.state, self.conn.as_mut()) {
            (SessionState::Ready, Some(conn)) => conn,
            _ => return Err(NutError::NotReady(self.state.name())),
        };
        let result = op(conn.as_mut(), &self.ups);
        if let Err(e) = &result {
            if e.is_transport() {
                self.state = SessionState::Errored;
                self.conn = None;
            }
        }
        result
    }

    pub fn list_vars(&mut self) -> Result<Telemetry, NutError> {
        self.with_conn(|c, ups| c.list_vars(ups))
    }

    pub fn list_commands(&mut self) -> Result<Vec<String>, NutError> {
        self.with_conn(|c, ups| c.list_commands(ups))
    }

    pub fn set_username(&mut self, username: &str) -> Result<(), NutError> {
        self.with_conn(|c, _| c.set_username(username))
    }

    pub fn set_password(&mut self, password: &str) -> Result<(), NutError> {
        self.with_conn(|c, _| c.set_password(password))
    }

    pub fn run_command(&mut self, command: &str) -> Result<(), NutError> {
        self.with_conn(|c, ups| c.run_command(ups, command))
    }

    /// Ends a ready session. Closing an errored or closed session does nothing.
    pub fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.close() {
                debug!("error while closing NUT connection: {}", e);
            }
            debug!("NUT connection closed");
        }
        if self.state != SessionState::Errored {
            self.state = SessionState::Closed;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.conn.is_some() {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeClient;

    #[test]
    fn walks_idle_ready_closed() {
        let client = FakeClient::with_vars(&[("ups.status", "OL")]);
        let mut session = Session::new("myups");
        assert_eq!(session.state(), SessionState::Idle);

        session.start(&client, "localhost", 3493).unwrap();
        assert!(session.is_ready());
        assert_eq!(session.list_vars().unwrap()["ups.status"], "OL");

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(session.list_vars(), Err(NutError::NotReady("closed"))));
        assert_eq!(client.calls(), vec!["LIST VAR myups", "LOGOUT"]);
    }

    #[test]
    fn unreachable_daemon_errors_the_session() {
        let client = FakeClient::unreachable();
        let mut session = Session::new("myups");
        assert!(session.start(&client, "localhost", 3493).unwrap_err().is_transport());
        assert_eq!(session.state(), SessionState::Errored);

        session.close();
        assert_eq!(session.state(), SessionState::Errored);
        assert!(session.start(&client, "localhost", 3493).is_err());
    }

    #[test]
    fn refused_request_keeps_session_ready() {
        let client = FakeClient::with_vars(&[]);
        client.refuse("LIST CMD", "ACCESS-DENIED");
        let mut session = Session::new("myups");
        session.start(&client, "localhost", 3493).unwrap();

        assert!(session.list_commands().is_err());
        assert!(session.is_ready());
        assert!(session.list_vars().is_ok());
    }

    #[test]
    fn dropped_connection_errors_the_session() {
        let client = FakeClient::with_vars(&[]);
        client.hang_up_on("LIST VAR");
        let mut session = Session::new("myups");
        session.start(&client, "localhost", 3493).unwrap();

        assert!(session.list_vars().unwrap_err().is_transport());
        assert_eq!(session.state(), SessionState::Errored);
        assert!(matches!(session.run_command("beeper.toggle"), Err(NutError::NotReady("errored"))));
    }

    #[test]
    fn drop_logs_out() {
        let client = FakeClient::with_vars(&[]);
        {
            let mut session = Session::new("myups");
            session.start(&client, "localhost", 3493).unwrap();
        }
        assert_eq!(client.calls(), vec!["LOGOUT"]);
    }
}
