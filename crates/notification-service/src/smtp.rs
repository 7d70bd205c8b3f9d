use async_trait::async_trait;
use lettre::{
    message::{Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use crate::templates::EmailTemplate;
use crate::{Alert, NotificationChannel, NotificationConfig, NotificationError, SmtpTls};

const SUBJECT_PREFIX: &str = "Harvest Rebalancer";

/// Emails each alert as a plain-text transcript with an HTML alternative.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl SmtpNotifier {
    pub fn new(config: &NotificationConfig) -> Result<Self, NotificationError> {
        let host = config
            .smtp_host
            .as_deref()
            .ok_or_else(|| NotificationError::Config("SMTP_HOST not set".into()))?;
        let from: Mailbox = config
            .smtp_from
            .as_deref()
            .ok_or_else(|| NotificationError::Config("SMTP_FROM_ADDRESS not set".into()))?
            .parse()
            .map_err(|e| NotificationError::Config(format!("Invalid from address: {}", e)))?;

        let mut to = Vec::with_capacity(config.smtp_to.len());
        for addr in &config.smtp_to {
            match addr.parse::<Mailbox>() {
                Ok(mailbox) => to.push(mailbox),
                Err(e) => tracing::warn!("Skipping recipient {:?}: {}", addr, e),
            }
        }
        if to.is_empty() {
            return Err(NotificationError::Config(
                "No valid NOTIFICATION_EMAIL_TO addresses".into(),
            ));
        }

        let builder = match config.smtp_tls {
            SmtpTls::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(host),
            SmtpTls::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host),
            SmtpTls::None => Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(
                host,
            )),
        }
        .map_err(|e| NotificationError::Smtp(format!("SMTP transport error: {}", e)))?
        .port(config.smtp_port);

        let builder = match (&config.smtp_username, &config.smtp_password) {
            (Some(user), Some(pass)) => {
                builder.credentials(Credentials::new(user.clone(), pass.clone()))
            }
            _ => builder,
        };

        Ok(Self {
            transport: builder.build(),
            from,
            to,
        })
    }

    /// "Harvest Rebalancer <title> <date>", matching the report subjects
    fn subject(alert: &Alert) -> String {
        format!(
            "{} {} {}",
            SUBJECT_PREFIX,
            alert.title,
            alert.timestamp.format("%Y-%m-%d")
        )
    }

    fn build_email(
        &self,
        alert: &Alert,
        recipient: &Mailbox,
    ) -> Result<Message, NotificationError> {
        Message::builder()
            .from(self.from.clone())
            .to(recipient.clone())
            .subject(Self::subject(alert))
            .multipart(MultiPart::alternative_plain_html(
                alert.message.clone(),
                EmailTemplate::render(alert),
            ))
            .map_err(|e| NotificationError::Smtp(format!("Failed to build email: {}", e)))
    }
}

#[async_trait]
impl NotificationChannel for SmtpNotifier {
    async fn send(&self, alert: &Alert) -> Result<(), NotificationError> {
        for recipient in &self.to {
            let email = self.build_email(alert, recipient)?;
            self.transport
                .send(email)
                .await
                .map_err(|e| NotificationError::Smtp(format!("Failed to send email: {}", e)))?;
        }
        tracing::debug!("Emailed {:?} to {} recipients", alert.title, self.to.len());
        Ok(())
    }

    fn name(&self) -> &str {
        "smtp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AlertType;

    fn config(to: Vec<String>) -> NotificationConfig {
        NotificationConfig {
            smtp_host: Some("localhost".into()),
            smtp_port: 2525,
            smtp_username: None,
            smtp_password: None,
            smtp_from: Some("rebalancer@example.com".into()),
            smtp_to: to,
            smtp_tls: SmtpTls::None,
            discord_webhook_url: None,
        }
    }

    #[tokio::test]
    async fn test_email_carries_transcript_and_subject_prefix() {
        let notifier = SmtpNotifier::new(&config(vec![
            "me@example.com".into(),
            "not an address".into(),
        ]))
        .unwrap();
        assert_eq!(notifier.to.len(), 1);

        let alert = Alert::new(
            AlertType::RebalanceReport {
                mode: "live".into(),
                preview: false,
                sells: 1,
                buys: 0,
            },
            "Rebalance",
            "Sell A2 x10 (harvest loss)",
        );
        let email = notifier.build_email(&alert, &notifier.to[0]).unwrap();
        let raw = String::from_utf8_lossy(&email.formatted()).to_string();

        let expected_subject = format!(
            "Subject: Harvest Rebalancer Rebalance {}",
            alert.timestamp.format("%Y-%m-%d")
        );
        assert!(raw.contains(&expected_subject));
        assert!(raw.contains("text/plain"));
        assert!(raw.contains("text/html"));
        assert!(raw.contains("Sell A2 x10 (harvest loss)"));
    }

    #[test]
    fn test_requires_a_valid_recipient() {
        let result = SmtpNotifier::new(&config(vec!["nobody".into()]));
        assert!(matches!(result, Err(NotificationError::Config(_))));
    }
}
