use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::{authentication::Credentials, AsyncSmtpTransport};
use lettre::{AsyncTransport, Tokio1Executor};

use super::{ChangeKind, ChannelAdapter, ChannelError, NotificationPayload};
use crate::config::EmailConfig;

pub struct EmailChannel {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailChannel {
    pub fn from_config(cfg: &EmailConfig) -> Result<Self> {
        let host = cfg
            .smtp_host
            .as_deref()
            .ok_or_else(|| anyhow!("SMTP_HOST missing"))?;
        let from_addr = cfg.from.as_deref().ok_or_else(|| anyhow!("EMAIL_FROM missing"))?;
        if cfg.to.is_empty() {
            return Err(anyhow!("EMAIL_TO missing"));
        }

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .with_context(|| format!("invalid SMTP host {host}"))?
            .port(cfg.smtp_port);
        if let (Some(user), Some(pass)) = (&cfg.smtp_user, &cfg.smtp_pass) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        let from = from_addr
            .parse()
            .with_context(|| format!("invalid EMAIL_FROM {from_addr}"))?;
        let to = cfg
            .to
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>()
                    .with_context(|| format!("invalid EMAIL_TO entry {addr}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            mailer: builder.build(),
            from,
            to,
        })
    }

    fn build_message(&self, p: &NotificationPayload) -> std::result::Result<Message, ChannelError> {
        let subject = match p.change_kind {
            ChangeKind::New => format!("New audiobook: {}", p.headline()),
            ChangeKind::Updated => format!("Audiobook updated: {}", p.headline()),
        };
        let mut body = format!("{}\n\n{}\n", p.headline(), p.text_body());
        if let Some(summary) = &p.summary {
            body.push('\n');
            body.push_str(summary);
            body.push('\n');
        }

        let mut msg = Message::builder().from(self.from.clone()).subject(subject);
        for to in &self.to {
            msg = msg.to(to.clone());
        }
        msg.header(header::ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| ChannelError::Permanent(format!("build email: {e}")))
    }
}

#[async_trait]
impl ChannelAdapter for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, payload: &NotificationPayload) -> std::result::Result<(), ChannelError> {
        let msg = self.build_message(payload)?;
        self.mailer.send(msg).await.map(|_| ()).map_err(|e| {
            if e.is_permanent() {
                ChannelError::Permanent(format!("smtp: {e}"))
            } else {
                ChannelError::Transient(format!("smtp: {e}"))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_without_recipients_is_rejected() {
        let cfg = EmailConfig {
            enabled: true,
            smtp_host: Some("smtp.example.test".into()),
            from: Some("tracker@example.test".into()),
            ..EmailConfig::default()
        };
        assert!(EmailChannel::from_config(&cfg).is_err());
    }

    #[test]
    fn bad_recipient_is_rejected() {
        let cfg = EmailConfig {
            enabled: true,
            smtp_host: Some("smtp.example.test".into()),
            from: Some("tracker@example.test".into()),
            to: vec!["not an address".into()],
            ..EmailConfig::default()
        };
        let err = EmailChannel::from_config(&cfg).err().unwrap();
        assert!(format!("{err:#}").contains("EMAIL_TO"));
    }
}
