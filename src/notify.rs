use std::sync::Arc;

use anyhow::{Context, Result};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use parking_lot::Mutex;

use crate::config::SmtpConfig;

/// Notification channels for consolidated alert reports.
pub enum Notifier {
    Email(EmailNotifier),
    Memory(MemoryNotifier),
}

impl Notifier {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Email(_) => "email",
            Self::Memory(_) => "memory",
        }
    }

    /// Delivers one notification. Failures are the caller's to log; the next
    /// evaluation cycle retries naturally.
    pub async fn send(&self, subject: &str, body: &str) -> Result<()> {
        match self {
            Self::Email(n) => n.send(subject, body).await,
            Self::Memory(n) => {
                n.push(subject, body);
                Ok(())
            }
        }
    }
}

/// Sends HTML mail over SMTP with STARTTLS and PLAIN authentication.
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailNotifier {
    pub fn new(cfg: &SmtpConfig) -> Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)
            .with_context(|| format!("building SMTP transport for {}", cfg.host))?
            .port(cfg.port)
            .credentials(Credentials::new(cfg.username.clone(), cfg.password.clone()))
            .build();

        let from: Mailbox = cfg
            .from
            .parse()
            .with_context(|| format!("parsing smtp.from address '{}'", cfg.from))?;

        let mut to = Vec::new();
        for recipient in cfg.to.split(',') {
            let recipient = recipient.trim();
            if recipient.is_empty() {
                continue;
            }
            to.push(
                recipient
                    .parse()
                    .with_context(|| format!("parsing smtp.to address '{recipient}'"))?,
            );
        }
        if to.is_empty() {
            anyhow::bail!("smtp.to lists no recipients");
        }

        Ok(Self {
            transport,
            from,
            to,
        })
    }

    async fn send(&self, subject: &str, body: &str) -> Result<()> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(subject)
            .header(ContentType::TEXT_HTML);
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }

        let message = builder.body(body.to_string()).context("building email")?;

        self.transport
            .send(message)
            .await
            .context("sending email")?;

        Ok(())
    }
}

/// In-memory notifier: captures (subject, body) pairs. Useful for dry runs
/// and tests.
#[derive(Default, Clone)]
pub struct MemoryNotifier {
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, subject: &str, body: &str) {
        self.sent.lock().push((subject.to_string(), body.to_string()));
    }

    /// All notifications captured so far.
    pub fn messages(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_notifier_parses_recipient_list() {
        let cfg = SmtpConfig {
            host: "smtp.example.com".to_string(),
            port: 587,
            username: "user".to_string(),
            password: "pass".to_string(),
            from: "alerts@example.com".to_string(),
            to: "a@example.com, b@example.com".to_string(),
        };
        let notifier = EmailNotifier::new(&cfg).expect("builds");
        assert_eq!(notifier.to.len(), 2);
    }

    #[test]
    fn test_email_notifier_rejects_empty_recipients() {
        let cfg = SmtpConfig {
            host: "smtp.example.com".to_string(),
            port: 587,
            from: "alerts@example.com".to_string(),
            to: " , ".to_string(),
            ..Default::default()
        };
        assert!(EmailNotifier::new(&cfg).is_err());
    }

    #[tokio::test]
    async fn test_memory_notifier_captures() {
        let memory = MemoryNotifier::new();
        let notifier = Notifier::Memory(memory.clone());
        notifier.send("subject", "<h1>body</h1>").await.expect("send");

        let messages = memory.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "subject");
    }
}
