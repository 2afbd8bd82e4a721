// Builds the long-lived pieces from a loaded config
use std::sync::Arc;

use chrono::{DateTime, Utc};
use refwatch_api::{ReferralApiClient, RetryingHttpClient};
use refwatch_store::{AggregateMetadata, RecordStore, ServiceRequestRecord, SqliteStore};
use tracing::info;

use crate::archive::ResponseArchive;
use crate::fetcher::ReferralFetcher;
use crate::ingest::DedupIngestor;
use crate::login::{BrowserCredentialAcquirer, ChromeLoginFactory, LoginSettings};
use crate::notify::{
    EmailBroadcaster, NotificationCoordinator, SmsBroadcaster, SmtpTransport, TwilioTransport,
};
use crate::poll::PollLoop;
use crate::token_store::TokenStore;
use crate::{Config, Error, Result};

/// Snapshot for `refwatch status`
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub records: u64,
    pub metadata: Option<AggregateMetadata>,
    pub last_notified: Option<ServiceRequestRecord>,
    pub session_expires_at: Option<DateTime<Utc>>,
}

pub struct Services {
    config: Config,
    store: Arc<SqliteStore>,
    http: RetryingHttpClient,
}

impl Services {
    /// Validate `config` and open the store
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let path = config.store_path()?;
        let store = Arc::new(SqliteStore::open(&path)?);
        info!(path = %path.display(), "opened store");

        let http = RetryingHttpClient::new(config.http.clone())
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            store,
            http,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<SqliteStore> {
        self.store.clone()
    }

    /// One broadcaster per channel that has recipients
    pub fn coordinator(&self) -> Result<NotificationCoordinator> {
        let mut coordinator =
            NotificationCoordinator::new(self.store.clone(), self.config.notify.mark_policy);

        if !self.config.email.recipients.is_empty() {
            let transport = SmtpTransport::from_config(&self.config.email)?;
            coordinator = coordinator.with_broadcaster(Arc::new(EmailBroadcaster::new(
                Arc::new(transport),
                self.config.email.recipients.clone(),
            )));
        }

        if !self.config.sms.recipients.is_empty() {
            let transport = TwilioTransport::from_config(self.http.clone(), &self.config.sms)?;
            coordinator = coordinator.with_broadcaster(Arc::new(SmsBroadcaster::new(
                Arc::new(transport),
                self.config.sms.recipients.clone(),
            )));
        }

        for channel in ["email", "sms"] {
            if !coordinator.channels().contains(&channel) {
                info!(channel, "no recipients configured, channel disabled");
            }
        }

        Ok(coordinator)
    }

    /// SMTP transport on its own, for a connectivity check
    pub fn smtp_transport(&self) -> Result<Option<SmtpTransport>> {
        if self.config.email.recipients.is_empty() {
            return Ok(None);
        }
        SmtpTransport::from_config(&self.config.email).map(Some)
    }

    pub fn poll_loop(&self) -> Result<PollLoop> {
        let settings = LoginSettings::from_config(&self.config)?;
        let acquirer = BrowserCredentialAcquirer::new(
            Arc::new(ChromeLoginFactory::from_config(&self.config)),
            settings,
        );

        let upstream = &self.config.upstream;
        let source = ReferralApiClient::with_endpoint(
            self.http.clone(),
            upstream.endpoint.clone(),
            &upstream.business_unit_id,
            upstream.page_size,
        );

        let mut fetcher = ReferralFetcher::new(
            TokenStore::new(self.store.clone()),
            Arc::new(acquirer),
            Arc::new(source),
        );
        if let Some(dir) = &self.config.archive.dir {
            fetcher = fetcher.with_archive(ResponseArchive::new(dir.clone()));
        }

        Ok(PollLoop::new(
            fetcher,
            DedupIngestor::new(self.store.clone()),
            self.coordinator()?,
            self.config.poll.interval(),
        ))
    }

    pub fn status(&self) -> Result<StatusReport> {
        let session = TokenStore::new(self.store.clone()).current_valid()?;

        Ok(StatusReport {
            records: self.store.count()?,
            metadata: self.store.metadata()?,
            last_notified: self.store.find_last_notified()?,
            session_expires_at: session.map(|pair| pair.expires_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.store.path = Some(dir.path().join("refwatch.db"));
        config
    }

    #[test]
    fn test_channels_follow_recipients() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);

        let services = Services::open(config.clone()).unwrap();
        assert!(services.coordinator().unwrap().channels().is_empty());
        assert!(services.smtp_transport().unwrap().is_none());

        config.sms.recipients = vec!["+15550001".into()];
        config.sms.account_sid = Some("AC123".into());
        config.sms.auth_token = Some("secret".into());
        config.sms.from_number = Some("+15550000".into());
        let services = Services::open(config).unwrap();
        assert_eq!(services.coordinator().unwrap().channels(), vec!["sms"]);
    }

    #[test]
    fn test_invalid_config_is_rejected_before_opening() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.poll.interval_secs = 0;

        assert!(matches!(Services::open(config), Err(Error::Config(_))));
        assert!(!dir.path().join("refwatch.db").exists());
    }

    #[test]
    fn test_poll_loop_requires_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let services = Services::open(config(&dir)).unwrap();

        assert!(matches!(services.poll_loop(), Err(Error::Config(_))));
    }

    #[test]
    fn test_status_of_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let services = Services::open(config(&dir)).unwrap();

        let status = services.status().unwrap();
        assert_eq!(status.records, 0);
        assert!(status.metadata.is_none());
        assert!(status.last_notified.is_none());
        assert!(status.session_expires_at.is_none());
    }
}
