use crate::email_client::send_in_background;

/// Operator alerts. Implementations must return immediately.
pub trait Alerter: Send + Sync {
    fn alert(&self, subject: &str, body: &str);
}

pub fn prefixed_subject(agent_name: Option<&str>, subject: &str) -> String {
    match agent_name {
        Some(name) if !name.is_empty() => format!("[{}] {}", name, subject),
        _ => format!("[gridhedge] {}", subject),
    }
}

/// Sends each alert by mail on the blocking pool.
pub struct EmailAlerter {
    agent_name: Option<String>,
}

impl EmailAlerter {
    pub fn new(agent_name: Option<String>) -> Self {
        Self { agent_name }
    }
}

impl Alerter for EmailAlerter {
    fn alert(&self, subject: &str, body: &str) {
        let subject = prefixed_subject(self.agent_name.as_deref(), subject);
        let body = body.to_string();
        log::warn!("[ALERT] {}: {}", subject, body);
        send_in_background(subject, body);
    }
}
