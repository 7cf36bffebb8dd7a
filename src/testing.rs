//! Scripted stand-in for upsd used by the unit tests.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;

use crate::error::NutError;
use crate::ups::{NutClient, NutConnection, Telemetry};

#[derive(Default)]
struct FakeUps {
    reachable: bool,
    vars: Telemetry,
    commands: Vec<String>,
    refused: HashMap<String, String>,
    hang_up: Option<String>,
    calls: Vec<String>,
    connects: usize,
}

#[derive(Clone, Default)]
pub struct FakeClient(Rc<RefCell<FakeUps>>);

impl FakeClient {
    pub fn with_vars(vars: &[(&str, &str)]) -> FakeClient {
        let client = FakeClient::default();
        {
            let mut ups = client.0.borrow_mut();
            ups.reachable = true;
            ups.vars = vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
        }
        client
    }

    pub fn unreachable() -> FakeClient {
        FakeClient::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.0.borrow_mut().reachable = reachable;
    }

    pub fn set_var(&self, key: &str, value: &str) {
        self.0.borrow_mut().vars.insert(key.to_string(), value.to_string());
    }

    pub fn set_commands(&self, commands: &[&str]) {
        self.0.borrow_mut().commands = commands.iter().map(|c| c.to_string()).collect();
    }

    /// Makes upsd answer `ERR <code>` to requests starting with `request`.
    pub fn refuse(&self, request: &str, code: &str) {
        self.0
            .borrow_mut()
            .refused
            .insert(request.to_string(), code.to_string());
    }

    /// Makes the connection drop when a request starting with `request` is sent.
    pub fn hang_up_on(&self, request: &str) {
        self.0.borrow_mut().hang_up = Some(request.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.0.borrow_mut().calls.clear();
    }

    pub fn connects(&self) -> usize {
        self.0.borrow().connects
    }
}

impl NutClient for FakeClient {
    fn connect(&self, _host: &str, _port: u16) -> Result<Box<dyn NutConnection>, NutError> {
        let mut ups = self.0.borrow_mut();
        ups.connects += 1;
        if !ups.reachable {
            return Err(NutError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        Ok(Box::new(FakeConnection(self.0.clone())))
    }
}

struct FakeConnection(Rc<RefCell<FakeUps>>);

impl FakeConnection {
    fn request(&self, request: String) -> Result<(), NutError> {
        let mut ups = self.0.borrow_mut();
        ups.calls.push(request.clone());
        if let Some(prefix) = &ups.hang_up {
            if request.starts_with(prefix.as_str()) {
                return Err(NutError::Closed);
            }
        }
        for (prefix, code) in &ups.refused {
            if request.starts_with(prefix.as_str()) {
                return Err(NutError::Refused {
                    request,
                    code: code.clone(),
                });
            }
        }
        Ok(())
    }
}

impl NutConnection for FakeConnection {
    fn list_vars(&mut self, ups: &str) -> Result<Telemetry, NutError> {
        self.request(format!("LIST VAR {}", ups))?;
        Ok(self.0.borrow().vars.clone())
    }

    fn list_commands(&mut self, ups: &str) -> Result<Vec<String>, NutError> {
        self.request(format!("LIST CMD {}", ups))?;
        Ok(self.0.borrow().commands.clone())
    }

    fn set_username(&mut self, username: &str) -> Result<(), NutError> {
        self.request(format!("USERNAME {}", username))
    }

    fn set_password(&mut self, password: &str) -> Result<(), NutError> {
        self.request(format!("PASSWORD {}", password))
    }

    fn run_command(&mut self, ups: &str, command: &str) -> Result<(), NutError> {
        self.request(format!("INSTCMD {} {}", ups, command))
    }

    fn close(&mut self) -> Result<(), NutError> {
        self.request("LOGOUT".to_string())
    }
}
