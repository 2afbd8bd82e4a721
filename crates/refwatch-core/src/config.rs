use refwatch_api::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::notify::MarkPolicy;
use crate::{Error, Result};

/// Main configuration structure
///
/// Loaded from a TOML file, then secrets are overlaid from the environment.
/// Priority: Env > File > Defaults
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub poll: PollConfig,
    pub upstream: UpstreamConfig,
    pub browser: BrowserConfig,
    pub http: RetryConfig,
    pub store: StoreConfig,
    pub notify: NotifyConfig,
    pub email: EmailConfig,
    pub sms: SmsConfig,
    pub archive: ArchiveConfig,
}

impl Config {
    /// Load config from `path`, or the default location when none is given.
    /// A missing file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Save config to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Default config file path (XDG on Linux/macOS, AppData on Windows)
    pub fn default_path() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".into()))?
            .join("refwatch")
            .join("config.toml"))
    }

    /// Overlay secrets and recipient lists from environment variables
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("SIGNIN_EMAIL") {
            self.upstream.email = Some(v);
        }
        if let Some(v) = non_empty("SIGNIN_PASSWORD") {
            self.upstream.password = Some(v);
        }
        if let Some(v) = non_empty("SMTP_AUTH_EMAIL") {
            self.email.smtp_username = Some(v);
        }
        if let Some(v) = non_empty("SMTP_AUTH_PASSWORD") {
            self.email.smtp_password = Some(v);
        }
        if let Some(v) = non_empty("EMAILS_TO_NOTIFY") {
            self.email.recipients = split_list(&v);
        }
        if let Some(v) = non_empty("PHONE_NUMBERS_TO_NOTIFY") {
            self.sms.recipients = split_list(&v);
        }
        if let Some(v) = non_empty("TWILIO_ACCOUNT_SID") {
            self.sms.account_sid = Some(v);
        }
        if let Some(v) = non_empty("TWILIO_AUTH_TOKEN") {
            self.sms.auth_token = Some(v);
        }
        if let Some(v) = non_empty("TWILIO_FROM_NUMBER") {
            self.sms.from_number = Some(v);
        }
        if let Some(v) = non_empty("DATABASE_PATH") {
            self.store.path = Some(PathBuf::from(v));
        }
        if let Some(v) = non_empty("CHROME_PATH") {
            self.browser.chrome_path = Some(PathBuf::from(v));
        }
    }

    /// Checks that do not depend on which command is running
    pub fn validate(&self) -> Result<()> {
        if self.poll.interval_secs == 0 {
            return Err(Error::Config("poll.interval_secs must be positive".into()));
        }
        if self.browser.login_attempts == 0 {
            return Err(Error::Config("browser.login_attempts must be positive".into()));
        }

        if !self.email.recipients.is_empty() {
            if let Some(bad) = self.email.recipients.iter().find(|r| !looks_like_email(r)) {
                return Err(Error::Config(format!("invalid email recipient: {}", bad)));
            }
            match &self.email.smtp_username {
                Some(user) if looks_like_email(user) => {}
                _ => {
                    return Err(Error::Config(
                        "email.smtp_username must be an email address".into(),
                    ))
                }
            }
            require_min_len("email.smtp_password", &self.email.smtp_password, 3)?;
        }

        if !self.sms.recipients.is_empty() {
            require_min_len("sms.account_sid", &self.sms.account_sid, 3)?;
            require_min_len("sms.auth_token", &self.sms.auth_token, 3)?;
            require_min_len("sms.from_number", &self.sms.from_number, 3)?;
        }

        Ok(())
    }

    /// Sign-in credentials, required only by commands that talk to upstream
    pub fn credentials(&self) -> Result<(String, String)> {
        match (&self.upstream.email, &self.upstream.password) {
            (Some(email), Some(password)) if !email.is_empty() && !password.is_empty() => {
                Ok((email.clone(), password.clone()))
            }
            _ => Err(Error::Config(
                "upstream sign-in email and password are required (SIGNIN_EMAIL / SIGNIN_PASSWORD)"
                    .into(),
            )),
        }
    }

    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.store.path {
            Some(p) => Ok(p.clone()),
            None => Ok(dirs::data_dir()
                .ok_or_else(|| Error::Config("Could not find data directory".into()))?
                .join("refwatch")
                .join("refwatch.db")),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn looks_like_email(value: &str) -> bool {
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !value.contains(char::is_whitespace)
        }
        None => false,
    }
}

fn require_min_len(name: &str, value: &Option<String>, min: usize) -> Result<()> {
    match value {
        Some(v) if v.chars().count() >= min => Ok(()),
        _ => Err(Error::Config(format!(
            "{} must be at least {} characters",
            name, min
        ))),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

fn default_interval() -> u64 {
    60
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Referral search endpoint
    pub endpoint: String,
    /// Web app entry point; unauthenticated visits bounce to sign-in
    pub app_url: String,
    /// Regex the sign-in page URL matches
    pub signin_url_pattern: String,
    /// Regex the URL matches once sign-in succeeded
    pub authenticated_url_pattern: String,
    pub email: Option<String>,
    pub password: Option<String>,
    pub business_unit_id: String,
    pub page_size: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: refwatch_api::referrals::REFERRALS_ENDPOINT.to_string(),
            app_url: "https://app.rovicare.com".to_string(),
            signin_url_pattern: r"b2clogin\.com".to_string(),
            authenticated_url_pattern: r"/referral/incoming".to_string(),
            email: None,
            password: None,
            business_unit_id: refwatch_api::referrals::DEFAULT_BUSINESS_UNIT_ID.to_string(),
            page_size: refwatch_api::referrals::DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Chrome/Chromium binary; auto-detected when unset
    pub chrome_path: Option<PathBuf>,
    pub headless: bool,
    /// Bound for each wait step of the sign-in
    pub wait_timeout_secs: u64,
    pub login_attempts: u32,
    pub login_retry_pause_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: true,
            wait_timeout_secs: 10,
            login_attempts: 3,
            login_retry_pause_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite file; defaults to the platform data dir
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NotifyConfig {
    pub mark_policy: MarkPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub sender_name: String,
    pub recipients: Vec<String>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: "smtp.gmail.com".to_string(),
            smtp_username: None,
            smtp_password: None,
            sender_name: "Referral Watch".to_string(),
            recipients: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub from_number: Option<String>,
    pub recipients: Vec<String>,
    pub api_base: String,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            account_sid: None,
            auth_token: None,
            from_number: None,
            recipients: Vec::new(),
            api_base: "https://api.twilio.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Where raw upstream pages are kept; archiving is off when unset
    pub dir: Option<PathBuf>,
}
