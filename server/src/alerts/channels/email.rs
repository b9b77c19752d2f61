//! SMTP email channel

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::NotificationChannel;
use crate::alerts::types::Alert;
use crate::config::EmailConfig;
use crate::error::NotificationError;

pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    recipients: Vec<Mailbox>,
}

impl EmailChannel {
    /// STARTTLS submission; the sender address is the SMTP username
    pub fn new(config: &EmailConfig, timeout: Duration) -> Result<Self, NotificationError> {
        let from: Mailbox = config.username.parse()
            .map_err(|e| NotificationError::Config(format!("email sender '{}': {}", config.username, e)))?;

        let recipients = config.recipients.iter()
            .map(|r| r.parse::<Mailbox>()
                .map_err(|e| NotificationError::Config(format!("email recipient '{}': {}", r, e))))
            .collect::<Result<Vec<_>, _>>()?;
        if recipients.is_empty() {
            return Err(NotificationError::Config("email enabled without recipients".to_string()));
        }

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_server)
            .map_err(|e| NotificationError::Config(format!("smtp relay '{}': {}", config.smtp_server, e)))?
            .port(config.smtp_port)
            .timeout(Some(timeout));
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(config.username.clone(), config.password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            recipients,
        })
    }

    fn message(&self, alert: &Alert) -> Result<Message, NotificationError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(subject(alert))
            .header(ContentType::TEXT_HTML);
        for recipient in &self.recipients {
            builder = builder.to(recipient.clone());
        }
        builder.body(html_body(alert))
            .map_err(|e| NotificationError::Smtp(e.to_string()))
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, alert: &Alert) -> Result<(), NotificationError> {
        let message = self.message(alert)?;
        self.transport.send(message).await
            .map_err(|e| NotificationError::Smtp(e.to_string()))?;
        Ok(())
    }
}

pub fn subject(alert: &Alert) -> String {
    format!("NetGuard Alert: {} (Severity: {})", alert.alert_type, alert.severity)
}

pub fn html_body(alert: &Alert) -> String {
    format!(
        r#"<html>
    <body>
        <h2>NetGuard Alert</h2>
        <p><strong>Type:</strong> {}</p>
        <p><strong>Severity:</strong> {}/10</p>
        <p><strong>Time:</strong> {}</p>
        <p><strong>Description:</strong> {}</p>
        <h3>Details:</h3>
        <pre>{}</pre>
    </body>
</html>
"#,
        escape(&alert.alert_type),
        alert.severity,
        alert.timestamp.to_rfc3339(),
        escape(&alert.description),
        escape(&alert.pretty_data()),
    )
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
