use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use refwatch_api::{RetryConfig, RetryingHttpClient};
use refwatch_store::ServiceRequestRecord;
use reqwest::header::AUTHORIZATION;
use reqwest::Method;
use serde::Deserialize;
use tracing::debug;

use super::{Broadcaster, Delivery};
use crate::config::SmsConfig;
use crate::{Error, Result};

const CHANNEL: &str = "sms";
/// Two concatenated segments; longer bodies get cut
const MAX_BODY_CHARS: usize = 306;

#[async_trait]
pub trait SmsTransport: Send + Sync {
    /// Returns the gateway's message id
    async fn send(&self, to: &str, body: &str) -> Result<String>;
}

/// Twilio Messages API over the shared retrying client
pub struct TwilioTransport {
    http: RetryingHttpClient,
    api_base: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: String,
}

impl TwilioTransport {
    pub fn new(
        http: RetryingHttpClient,
        api_base: impl Into<String>,
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        from_number: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            from_number: from_number.into(),
        }
    }

    pub fn from_config(http: RetryingHttpClient, config: &SmsConfig) -> Result<Self> {
        let required = |name: &str, value: &Option<String>| {
            value
                .clone()
                .ok_or_else(|| Error::Config(format!("sms.{} is required", name)))
        };

        Ok(Self::new(
            http,
            config.api_base.clone(),
            required("account_sid", &config.account_sid)?,
            required("auth_token", &config.auth_token)?,
            required("from_number", &config.from_number)?,
        ))
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, self.account_sid
        )
    }

    fn basic_auth_header(&self) -> String {
        let credentials = format!("{}:{}", self.account_sid, self.auth_token);
        let encoded = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            credentials.as_bytes(),
        );
        format!("Basic {}", encoded)
    }
}

#[async_trait]
impl SmsTransport for TwilioTransport {
    async fn send(&self, to: &str, body: &str) -> Result<String> {
        let request = self
            .http
            .request(Method::POST, &self.messages_url())
            .header(AUTHORIZATION, self.basic_auth_header())
            .form(&[("To", to), ("From", self.from_number.as_str()), ("Body", body)]);

        // A resend after a lost reply would text the recipient twice
        let policy = RetryConfig {
            max_attempts: 1,
            ..self.http.config().clone()
        };
        let response = self.http.execute_with(request, &policy).await?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::notification(CHANNEL, e))?;

        if !status.is_success() {
            return Err(Error::notification(
                CHANNEL,
                format!("gateway returned {}: {}", status.as_u16(), text),
            ));
        }

        let resource: MessageResource = serde_json::from_str(&text)?;
        Ok(resource.sid)
    }
}

pub struct SmsBroadcaster {
    transport: Arc<dyn SmsTransport>,
    recipients: Vec<String>,
}

impl SmsBroadcaster {
    pub fn new(transport: Arc<dyn SmsTransport>, recipients: Vec<String>) -> Self {
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
impl Broadcaster for SmsBroadcaster {
    fn channel(&self) -> &'static str {
        CHANNEL
    }

    async fn broadcast(&self, records: &[ServiceRequestRecord]) -> Result<Delivery> {
        let body = compose(records);

        let sends = self.recipients.iter().map(|to| {
            let body = body.as_str();
            async move { (to.clone(), self.transport.send(to, body).await) }
        });

        let mut delivery = Delivery::default();
        for (to, result) in join_all(sends).await {
            match result {
                Ok(sid) => {
                    debug!(recipient = %to, sid = %sid, "sms sent");
                    delivery.sent.push(to);
                }
                Err(e) => delivery.failed.push((to, e.to_string())),
            }
        }

        delivery.into_result(CHANNEL)
    }

    /// Nothing to release: the HTTP pool belongs to the shared client
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// "New referral" plus the patients, cut to fit
pub fn compose(records: &[ServiceRequestRecord]) -> String {
    let names: Vec<&str> = records
        .iter()
        .map(|r| {
            if r.patient_name.is_empty() {
                "(unnamed patient)"
            } else {
                r.patient_name.as_str()
            }
        })
        .collect();

    let body = match records.len() {
        1 => format!("New referral: {}", names.join(", ")),
        n => format!("New referral ({}): {}", n, names.join(", ")),
    };

    if body.chars().count() <= MAX_BODY_CHARS {
        return body;
    }
    let mut cut: String = body.chars().take(MAX_BODY_CHARS - 3).collect();
    cut.push_str("...");
    cut
}
