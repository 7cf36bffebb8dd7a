use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::MailerError;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MailerSettings {
    pub user: String,
    pub pass: String,
    pub relay: String,
    pub from: String,
    pub to: Vec<String>,
    /// Prefix for every subject; the host name when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
}

/// Where severity alerts go.
pub trait AlertSink {
    fn send(&self, subject: &str, message: &str);
}

pub struct Mailer {
    from: Mailbox,
    vec_to: Vec<Mailbox>,
    machine_id: String,
    relay: SmtpTransport,
}

impl Mailer {
    pub fn new(settings: MailerSettings) -> Result<Mailer, MailerError> {
        let machine_id = match settings.machine_id {
            Some(id) => id,
            None => hostname::get()?.to_string_lossy().into_owned(),
        };
        let vec_to = settings
            .to
            .iter()
            .map(|to| to.parse())
            .collect::<Result<Vec<Mailbox>, _>>()?;
        Ok(Mailer {
            from: settings.from.parse()?,
            vec_to,
            machine_id,
            relay: SmtpTransport::relay(&settings.relay)?
                .credentials(Credentials::new(settings.user, settings.pass))
                .build(),
        })
    }

    fn build(&self, subject: &str, message: &str) -> Result<Message, MailerError> {
        let mut builder = Message::builder().from(self.from.clone());
        for to in &self.vec_to {
            builder = builder.to(to.clone())
        }
        Ok(builder
            .subject(format!("{}: {}", self.machine_id, subject))
            .body(message.to_string())?)
    }
}

impl AlertSink for Mailer {
    fn send(&self, subject: &str, message: &str) {
        if cfg!(debug_assertions) {
            info!("In debug build, not sending email: {}", subject);
            return;
        }
        let result = self
            .build(subject, message)
            .and_then(|email| self.relay.send(&email).map_err(MailerError::from));
        if let Err(e) = result {
            error!("Failed to send email {:?}: {}", subject, e)
        }
    }
}
