// vigil: Email sink

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::SmtpSettings;
use crate::events::AlertEvent;
use crate::notify::router::ChannelTarget;
use crate::notify::template;
use crate::notify::{Sink, SinkError};

const SMTP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(20);

/// SMTP email sink with severity-styled HTML bodies
///
/// Each message is fanned out to every configured recipient.
pub struct EmailSink {
    settings: Option<SmtpSettings>,
}

impl EmailSink {
    pub fn new(settings: Option<SmtpSettings>) -> Self {
        Self { settings }
    }

    fn settings(&self) -> Result<&SmtpSettings, SinkError> {
        self.settings.as_ref().ok_or(SinkError::NotConfigured)
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, SinkError> {
        let settings = self.settings()?;
        let mut builder = if settings.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
                .map_err(|e| SinkError::Permanent(format!("smtp relay: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
        };
        builder = builder.port(settings.port).timeout(Some(SMTP_TIMEOUT));
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        Ok(builder.build())
    }

    async fn deliver(&self, subject: &str, html: &str) -> Result<(), SinkError> {
        let settings = self.settings()?;
        if settings.recipients.is_empty() {
            return Err(SinkError::NoRecipients);
        }
        let from: lettre::message::Mailbox = settings
            .from
            .parse()
            .map_err(|e| SinkError::Permanent(format!("bad from address: {}", e)))?;
        let transport = self.transport()?;

        for recipient in &settings.recipients {
            let to: lettre::message::Mailbox = recipient
                .parse()
                .map_err(|e| SinkError::Permanent(format!("bad recipient {}: {}", recipient, e)))?;
            let message = Message::builder()
                .from(from.clone())
                .to(to)
                .subject(subject)
                .header(ContentType::TEXT_HTML)
                .body(html.to_string())
                .map_err(|e| SinkError::Permanent(format!("message build: {}", e)))?;

            transport.send(message).await.map_err(|e| {
                if e.is_transient() || e.is_timeout() {
                    SinkError::Transient(format!("smtp send to {}: {}", recipient, e))
                } else {
                    SinkError::Permanent(format!("smtp send to {}: {}", recipient, e))
                }
            })?;
            debug!(recipient = %recipient, "Email delivered");
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for EmailSink {
    fn name(&self) -> &'static str {
        "email"
    }

    fn format(&self, event: &AlertEvent, _target: Option<&ChannelTarget>) -> Result<Value, SinkError> {
        let settings = self.settings()?;
        if settings.recipients.is_empty() {
            return Err(SinkError::NoRecipients);
        }
        Ok(json!({
            "subject": template::email_subject(event),
            "html": template::email_html(event),
        }))
    }

    async fn send(&self, _event: &AlertEvent, payload: &Value) -> Result<(), SinkError> {
        let subject = payload["subject"].as_str().unwrap_or("vigil alert");
        let html = payload["html"].as_str().unwrap_or_default();
        self.deliver(subject, html).await
    }

    async fn test(&self, message: &str) -> Result<(), SinkError> {
        self.deliver(
            "vigil test notification",
            &format!("<html><body><p>{}</p></body></html>", message),
        )
        .await
    }
}
