use once_cell::sync::Lazy;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::alert::prefixed_subject;
use crate::email_client::send_in_background;

const MIN_NOTIFY_GAP: Duration = Duration::from_secs(60);

static RATE_LIMIT_NOTIFIER: Lazy<RateLimitNotifier> = Lazy::new(RateLimitNotifier::new);

pub fn notify_rate_limit(context: &str, detail: &str) {
    RATE_LIMIT_NOTIFIER.notify(context, detail);
}

struct RateLimitNotifier {
    agent_name: Option<String>,
    last_sent: Mutex<Option<Instant>>,
}

impl RateLimitNotifier {
    fn new() -> Self {
        let agent_name = std::env::var("AGENT_NAME").ok().filter(|v| !v.is_empty());
        Self {
            agent_name,
            last_sent: Mutex::new(None),
        }
    }

    fn should_send(&self, now: Instant) -> bool {
        let Ok(mut last) = self.last_sent.lock() else {
            return false;
        };
        match *last {
            Some(prev) if now.duration_since(prev) < MIN_NOTIFY_GAP => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    fn notify(&self, context: &str, detail: &str) {
        if !self.should_send(Instant::now()) {
            log::warn!("[ALERT] rate limit again while {} (muted): {}", context, detail);
            return;
        }
        let subject = prefixed_subject(
            self.agent_name.as_deref(),
            &format!("Rate limit - {}", context),
        );
        let body = format!(
            "HTTP 429 Too Many Requests detected while {}.\nDetail: {}",
            context, detail
        );

        send_in_background(subject, body);
        log::warn!(
            "[ALERT] rate limit notification sent for '{}' (detail: {})",
            context,
            detail
        );
    }
}
