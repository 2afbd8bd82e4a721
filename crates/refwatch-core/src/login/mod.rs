// Credential acquisition through an automated interactive sign-in
pub mod chrome;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use refwatch_store::TokenPair;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::AuthStep;
use crate::{Error, Result};

pub use chrome::ChromeLoginFactory;

/// Sign-in form field holding the account email
pub const EMAIL_FIELD_ID: &str = "signInName";
pub const PASSWORD_FIELD_ID: &str = "password";
pub const SUBMIT_BUTTON_ID: &str = "next";

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Assumed lifetime of a freshly read access token
pub const TOKEN_VALIDITY_SECS: i64 = 60 * 60;

/// Failure reported by a login driver, before it is tied to a step
#[derive(Debug, Error)]
#[error("{0}")]
pub struct DriverError(pub String);

pub type DriverResult<T> = std::result::Result<T, DriverError>;

impl DriverError {
    pub fn new(message: impl fmt::Display) -> Self {
        DriverError(message.to_string())
    }
}

/// One automated browser session able to walk through the sign-in
#[async_trait]
pub trait LoginDriver: Send {
    async fn navigate_to_login(&mut self) -> DriverResult<()>;

    async fn wait_for_field(&mut self, id: &str, timeout: Duration) -> DriverResult<()>;

    async fn submit_credentials(&mut self, email: &str, password: &str) -> DriverResult<()>;

    async fn wait_for_redirect(&mut self, pattern: &Regex, timeout: Duration) -> DriverResult<()>;

    async fn read_session_storage(
        &mut self,
        keys: &[&str],
    ) -> DriverResult<HashMap<String, Option<String>>>;

    /// Release the session; called on every exit path
    async fn close(&mut self) -> DriverResult<()>;
}

/// Opens browser sessions on demand
#[async_trait]
pub trait LoginSessionFactory: Send + Sync {
    async fn open(&self) -> DriverResult<Box<dyn LoginDriver>>;
}

/// Anything that can produce a fresh token pair
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialAcquirer: Send + Sync {
    async fn acquire(&self) -> Result<TokenPair>;
}

/// Knobs of the sign-in walk
#[derive(Debug, Clone)]
pub struct LoginSettings {
    pub email: String,
    pub password: String,
    pub signin_url_pattern: Regex,
    pub authenticated_url_pattern: Regex,
    pub wait_timeout: Duration,
    pub attempts: u32,
    pub retry_pause: Duration,
}

impl LoginSettings {
    pub fn from_config(config: &crate::Config) -> Result<Self> {
        let (email, password) = config.credentials()?;
        let compile = |name: &str, raw: &str| {
            Regex::new(raw).map_err(|e| Error::Config(format!("invalid {} pattern: {}", name, e)))
        };

        Ok(Self {
            email,
            password,
            signin_url_pattern: compile("sign-in URL", &config.upstream.signin_url_pattern)?,
            authenticated_url_pattern: compile(
                "authenticated URL",
                &config.upstream.authenticated_url_pattern,
            )?,
            wait_timeout: Duration::from_secs(config.browser.wait_timeout_secs),
            attempts: config.browser.login_attempts.max(1),
            retry_pause: Duration::from_secs(config.browser.login_retry_pause_secs),
        })
    }
}

/// Acquires tokens by driving a browser through the sign-in form
pub struct BrowserCredentialAcquirer {
    factory: Arc<dyn LoginSessionFactory>,
    settings: LoginSettings,
    // At most one browser session is open at any time
    session_slot: Mutex<()>,
}

impl BrowserCredentialAcquirer {
    pub fn new(factory: Arc<dyn LoginSessionFactory>, settings: LoginSettings) -> Self {
        Self {
            factory,
            settings,
            session_slot: Mutex::new(()),
        }
    }

    async fn acquire_once(&self) -> Result<TokenPair> {
        let _slot = self.session_slot.lock().await;

        let mut session = self
            .factory
            .open()
            .await
            .map_err(|e| Error::auth(AuthStep::OpenSession, e.0))?;

        let result = self.sign_in(session.as_mut()).await;

        if let Err(e) = session.close().await {
            warn!(error = %e, "failed to close browser session");
        }

        result
    }

    async fn sign_in(&self, driver: &mut dyn LoginDriver) -> Result<TokenPair> {
        let s = &self.settings;
        let at = |step: AuthStep| move |e: DriverError| Error::auth(step, e.0);

        driver
            .navigate_to_login()
            .await
            .map_err(at(AuthStep::NavigateToLogin))?;
        driver
            .wait_for_redirect(&s.signin_url_pattern, s.wait_timeout)
            .await
            .map_err(at(AuthStep::NavigateToLogin))?;
        driver
            .wait_for_field(EMAIL_FIELD_ID, s.wait_timeout)
            .await
            .map_err(at(AuthStep::WaitForField))?;
        driver
            .submit_credentials(&s.email, &s.password)
            .await
            .map_err(at(AuthStep::SubmitCredentials))?;
        driver
            .wait_for_redirect(&s.authenticated_url_pattern, s.wait_timeout)
            .await
            .map_err(at(AuthStep::WaitForRedirect))?;

        let mut storage = driver
            .read_session_storage(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY])
            .await
            .map_err(at(AuthStep::ReadSessionStorage))?;

        let access_token = storage
            .remove(ACCESS_TOKEN_KEY)
            .flatten()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::auth(AuthStep::ReadSessionStorage, "no access token in session storage")
            })?;
        let refresh_token = storage.remove(REFRESH_TOKEN_KEY).flatten().unwrap_or_else(|| {
            debug!("session storage had no refresh token");
            String::new()
        });

        let expires_at = Utc::now() + chrono::Duration::seconds(TOKEN_VALIDITY_SECS);
        Ok(TokenPair::new(access_token, refresh_token, expires_at))
    }
}

#[async_trait]
impl CredentialAcquirer for BrowserCredentialAcquirer {
    async fn acquire(&self) -> Result<TokenPair> {
        let attempts = self.settings.attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.acquire_once().await {
                Ok(pair) => {
                    info!(attempt, expires_at = %pair.expires_at, "acquired session token");
                    return Ok(pair);
                }
                Err(e) => {
                    let step = e.auth_step().map(|s| s.to_string()).unwrap_or_default();
                    warn!(attempt, attempts, step = %step, error = %e, "sign-in attempt failed");

                    if attempt >= attempts {
                        return Err(e);
                    }
                    tokio::time::sleep(self.settings.retry_pause).await;
                }
            }
        }
    }
}
