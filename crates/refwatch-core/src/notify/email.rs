use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use refwatch_store::ServiceRequestRecord;
use tracing::debug;

use super::{describe, Broadcaster, Delivery};
use crate::config::EmailConfig;
use crate::{Error, Result};

const CHANNEL: &str = "email";
pub const SUBJECT: &str = "New Referral";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// Something that can put one message on the wire
#[async_trait]
pub trait EmailTransport: Send + Sync {
    /// Returns the message id
    async fn send(&self, message: &EmailMessage) -> Result<String>;
}

/// Authenticated SMTP relay (STARTTLS/TLS via rustls)
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpTransport {
    pub fn new(host: &str, username: &str, password: &str, sender_name: &str) -> Result<Self> {
        let address: Address = username
            .parse()
            .map_err(|e| Error::Config(format!("invalid sender address {}: {}", username, e)))?;

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .map_err(|e| Error::notification(CHANNEL, e))?
            .credentials(Credentials::new(username.to_string(), password.to_string()))
            .build();

        Ok(Self {
            mailer,
            from: Mailbox::new(Some(sender_name.to_string()), address),
        })
    }

    pub fn from_config(config: &EmailConfig) -> Result<Self> {
        let username = config
            .smtp_username
            .as_deref()
            .ok_or_else(|| Error::Config("email.smtp_username is required".into()))?;
        let password = config
            .smtp_password
            .as_deref()
            .ok_or_else(|| Error::Config("email.smtp_password is required".into()))?;

        Self::new(&config.smtp_host, username, password, &config.sender_name)
    }

    /// Open a connection and authenticate without sending anything
    pub async fn verify(&self) -> Result<()> {
        match self.mailer.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::notification(CHANNEL, "SMTP server refused the connection")),
            Err(e) => Err(Error::notification(CHANNEL, e)),
        }
    }
}

#[async_trait]
impl EmailTransport for SmtpTransport {
    async fn send(&self, message: &EmailMessage) -> Result<String> {
        let to: Mailbox = message
            .to
            .parse()
            .map_err(|e| Error::notification(CHANNEL, format!("bad recipient: {}", e)))?;
        let message_id = format!("<{}@refwatch>", uuid::Uuid::new_v4());

        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.subject.clone())
            .message_id(Some(message_id.clone()))
            .multipart(MultiPart::alternative_plain_html(
                message.text.clone(),
                message.html.clone(),
            ))
            .map_err(|e| Error::notification(CHANNEL, e))?;

        self.mailer
            .send(email)
            .await
            .map_err(|e| Error::notification(CHANNEL, e))?;

        Ok(message_id)
    }
}

pub struct EmailBroadcaster {
    transport: Arc<dyn EmailTransport>,
    recipients: Vec<String>,
}

impl EmailBroadcaster {
    pub fn new(transport: Arc<dyn EmailTransport>, recipients: Vec<String>) -> Self {
        Self {
            transport,
            recipients,
        }
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }
}

#[async_trait]
impl Broadcaster for EmailBroadcaster {
    fn channel(&self) -> &'static str {
        CHANNEL
    }

    async fn broadcast(&self, records: &[ServiceRequestRecord]) -> Result<Delivery> {
        let (text, html) = compose(records);

        let sends = self.recipients.iter().map(|to| {
            let message = EmailMessage {
                to: to.clone(),
                subject: SUBJECT.to_string(),
                text: text.clone(),
                html: html.clone(),
            };
            async move { (message.to.clone(), self.transport.send(&message).await) }
        });

        let mut delivery = Delivery::default();
        for (to, result) in join_all(sends).await {
            match result {
                Ok(message_id) => {
                    debug!(recipient = %to, message_id = %message_id, "email sent");
                    delivery.sent.push(to);
                }
                Err(e) => delivery.failed.push((to, e.to_string())),
            }
        }

        delivery.into_result(CHANNEL)
    }

    /// Nothing to release: every send opens and drops its own SMTP connection
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Plain-text and HTML bodies listing each record
pub fn compose(records: &[ServiceRequestRecord]) -> (String, String) {
    let heading = match records.len() {
        1 => "1 new referral received:".to_string(),
        n => format!("{} new referrals received:", n),
    };

    let mut text = format!("{}\n\n", heading);
    let mut html = format!("<p>{}</p>\n<ul>\n", escape_html(&heading));
    for record in records {
        let line = describe(record);
        text.push_str(&format!("- {}\n", line));
        html.push_str(&format!("<li>{}</li>\n", escape_html(&line)));
    }
    html.push_str("</ul>\n");

    (text, html)
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
