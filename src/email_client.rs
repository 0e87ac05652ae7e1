use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::{get_email_config_from_env, EmailConfig};

/// Blocking SMTP sender. Without SMTP settings in the environment every send
/// is only logged.
pub struct EmailClient {
    config: Option<EmailConfig>,
}

impl Default for EmailClient {
    fn default() -> Self {
        Self::new()
    }
}

impl EmailClient {
    pub fn new() -> Self {
        Self {
            config: get_email_config_from_env(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    pub fn send(&self, subject: &str, body: &str) {
        let Some(config) = &self.config else {
            log::info!("[ALERT] email not configured, skipped: {}", subject);
            return;
        };
        if let Err(e) = Self::deliver(config, subject, body) {
            log::error!("[ALERT] failed to send email '{}': {}", subject, e);
        }
    }

    fn deliver(config: &EmailConfig, subject: &str, body: &str) -> anyhow::Result<()> {
        let from: Mailbox = config.from.parse()?;
        let to: Mailbox = config.to.parse()?;
        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .body(body.to_string())?;

        let creds = Credentials::new(config.username.clone(), config.password.clone());
        let mailer = SmtpTransport::relay(&config.smtp_host)?
            .credentials(creds)
            .build();
        mailer.send(&email)?;
        log::info!("[ALERT] email sent: {}", subject);
        Ok(())
    }
}

/// Sends on the runtime's blocking pool so SMTP never stalls the caller.
/// Outside a runtime the mail goes out on the calling thread.
pub fn send_in_background(subject: String, body: String) -> Option<JoinHandle<()>> {
    match Handle::try_current() {
        Ok(handle) => Some(handle.spawn_blocking(move || {
            EmailClient::new().send(&subject, &body);
        })),
        Err(_) => {
            EmailClient::new().send(&subject, &body);
            None
        }
    }
}
