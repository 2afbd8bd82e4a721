// Fan-out of new referrals to every configured channel
pub mod email;
pub mod sms;

pub use email::{EmailBroadcaster, EmailTransport, SmtpTransport};
pub use sms::{SmsBroadcaster, SmsTransport, TwilioTransport};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use refwatch_store::{RecordStore, ServiceRequestRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::Result;

/// When a batch counts as notified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkPolicy {
    /// Mark after the attempt, whatever the channels reported
    #[default]
    Always,
    /// Mark only if at least one recipient on some channel got the message
    RequireDelivery,
}

/// Per-recipient result of one broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub sent: Vec<String>,
    /// (recipient, reason)
    pub failed: Vec<(String, String)>,
}

impl Delivery {
    pub fn delivered(&self) -> bool {
        !self.sent.is_empty()
    }

    /// Turn a delivery with no successes into the channel's error
    pub fn into_result(self, channel: &str) -> Result<Delivery> {
        if self.sent.is_empty() && !self.failed.is_empty() {
            let reasons: Vec<String> = self
                .failed
                .iter()
                .map(|(to, reason)| format!("{}: {}", to, reason))
                .collect();
            return Err(crate::Error::notification(channel, reasons.join("; ")));
        }
        Ok(self)
    }
}

/// A notification channel (email, SMS, ...)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broadcaster: Send + Sync {
    fn channel(&self) -> &'static str;

    async fn broadcast(&self, records: &[ServiceRequestRecord]) -> Result<Delivery>;

    /// Release connections held by the channel
    async fn close(&self) -> Result<()>;
}

#[derive(Debug)]
pub struct ChannelOutcome {
    pub channel: &'static str,
    pub result: Result<Delivery>,
}

impl ChannelOutcome {
    pub fn delivered(&self) -> bool {
        matches!(&self.result, Ok(delivery) if delivery.delivered())
    }
}

#[derive(Debug, Default)]
pub struct NotifySummary {
    pub outcomes: Vec<ChannelOutcome>,
    /// Records whose `notified_at` this call set
    pub marked: usize,
}

pub struct NotificationCoordinator {
    broadcasters: Vec<Arc<dyn Broadcaster>>,
    store: Arc<dyn RecordStore>,
    policy: MarkPolicy,
}

impl NotificationCoordinator {
    pub fn new(store: Arc<dyn RecordStore>, policy: MarkPolicy) -> Self {
        Self {
            broadcasters: Vec::new(),
            store,
            policy,
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcasters.push(broadcaster);
        self
    }

    pub fn channels(&self) -> Vec<&'static str> {
        self.broadcasters.iter().map(|b| b.channel()).collect()
    }

    /// Broadcast `records` on every channel, then mark them notified.
    ///
    /// One channel failing never stops the others; failures are logged and
    /// reported in the summary.
    pub async fn notify(&self, records: &[ServiceRequestRecord]) -> Result<NotifySummary> {
        if records.is_empty() {
            debug!("nothing to notify");
            return Ok(NotifySummary::default());
        }

        let outcomes = self.broadcast(records).await;

        let should_mark = match self.policy {
            MarkPolicy::Always => true,
            MarkPolicy::RequireDelivery => outcomes.iter().any(ChannelOutcome::delivered),
        };

        let marked = if should_mark {
            let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
            self.store.update_notified(&ids, Utc::now())?
        } else {
            warn!(
                records = records.len(),
                "no channel delivered, leaving records unmarked"
            );
            0
        };

        info!(records = records.len(), marked, "notification round finished");
        Ok(NotifySummary { outcomes, marked })
    }

    /// Broadcast without touching the store
    pub async fn broadcast(&self, records: &[ServiceRequestRecord]) -> Vec<ChannelOutcome> {
        if self.broadcasters.is_empty() {
            warn!("no notification channels configured");
        }

        let sends = self.broadcasters.iter().map(|b| async move {
            ChannelOutcome {
                channel: b.channel(),
                result: b.broadcast(records).await,
            }
        });
        let outcomes = join_all(sends).await;

        for outcome in &outcomes {
            match &outcome.result {
                Ok(delivery) => {
                    info!(
                        channel = outcome.channel,
                        sent = delivery.sent.len(),
                        failed = delivery.failed.len(),
                        "channel delivered"
                    );
                    for (recipient, reason) in &delivery.failed {
                        warn!(
                            channel = outcome.channel,
                            recipient = %recipient,
                            reason = %reason,
                            "recipient not reached"
                        );
                    }
                }
                Err(e) => error!(channel = outcome.channel, error = %e, "channel failed"),
            }
        }

        outcomes
    }

    /// Close every channel, logging failures
    pub async fn close(&self) {
        for broadcaster in &self.broadcasters {
            if let Err(e) = broadcaster.close().await {
                warn!(channel = broadcaster.channel(), error = %e, "failed to close channel");
            }
        }
    }
}

/// One-line description of a record for message bodies
pub(crate) fn describe(record: &ServiceRequestRecord) -> String {
    let name = if record.patient_name.is_empty() {
        "(unnamed patient)"
    } else {
        record.patient_name.as_str()
    };

    let mut line = name.to_string();
    if let Some(from) = &record.referred_by_unit {
        line.push_str(&format!(" from {}", from));
    }
    if let Some(kind) = &record.provider_type {
        line.push_str(&format!(" ({})", kind));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use refwatch_store::SqliteStore;

    fn seeded_store(ids: &[&str]) -> (Arc<SqliteStore>, Vec<ServiceRequestRecord>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let records: Vec<_> = ids
            .iter()
            .map(|id| ServiceRequestRecord::new(*id, format!("Patient {}", id)))
            .collect();
        store.bulk_create(&records).unwrap();
        (store, records)
    }

    fn broadcaster(
        channel: &'static str,
        result: fn() -> Result<Delivery>,
    ) -> Arc<MockBroadcaster> {
        let mut mock = MockBroadcaster::new();
        mock.expect_channel().return_const(channel);
        mock.expect_broadcast().times(1).returning(move |_| result());
        Arc::new(mock)
    }

    fn sent() -> Result<Delivery> {
        Ok(Delivery {
            sent: vec!["ops@example.com".into()],
            failed: vec![],
        })
    }

    fn failed() -> Result<Delivery> {
        Err(Error::notification("sms", "gateway down"))
    }

    #[tokio::test]
    async fn test_one_failing_channel_does_not_stop_others() {
        let (store, records) = seeded_store(&["A"]);
        let coordinator = NotificationCoordinator::new(store.clone(), MarkPolicy::Always)
            .with_broadcaster(broadcaster("email", sent))
            .with_broadcaster(broadcaster("sms", failed));

        let summary = coordinator.notify(&records).await.unwrap();

        assert_eq!(summary.outcomes.len(), 2);
        assert!(summary.outcomes[0].delivered());
        assert!(summary.outcomes[1].result.is_err());
        assert_eq!(summary.marked, 1);
        assert!(store.find_by_id("A").unwrap().unwrap().is_notified());
    }

    #[tokio::test]
    async fn test_always_marks_even_when_everything_fails() {
        let (store, records) = seeded_store(&["A", "B"]);
        let coordinator = NotificationCoordinator::new(store.clone(), MarkPolicy::Always)
            .with_broadcaster(broadcaster("sms", failed));

        let summary = coordinator.notify(&records).await.unwrap();

        assert_eq!(summary.marked, 2);
        assert!(store.find_by_id("B").unwrap().unwrap().is_notified());
    }

    #[tokio::test]
    async fn test_require_delivery_leaves_undelivered_unmarked() {
        let (store, records) = seeded_store(&["A"]);
        let coordinator = NotificationCoordinator::new(store.clone(), MarkPolicy::RequireDelivery)
            .with_broadcaster(broadcaster("sms", failed));

        let summary = coordinator.notify(&records).await.unwrap();

        assert_eq!(summary.marked, 0);
        assert!(!store.find_by_id("A").unwrap().unwrap().is_notified());
    }

    #[tokio::test]
    async fn test_require_delivery_marks_on_any_success() {
        let (store, records) = seeded_store(&["A"]);
        let coordinator = NotificationCoordinator::new(store.clone(), MarkPolicy::RequireDelivery)
            .with_broadcaster(broadcaster("email", sent))
            .with_broadcaster(broadcaster("sms", failed));

        assert_eq!(coordinator.notify(&records).await.unwrap().marked, 1);
    }

    #[tokio::test]
    async fn test_empty_batch_skips_channels() {
        let (store, _) = seeded_store(&[]);
        let mut mock = MockBroadcaster::new();
        mock.expect_broadcast().never();

        let coordinator = NotificationCoordinator::new(store, MarkPolicy::Always)
            .with_broadcaster(Arc::new(mock));

        let summary = coordinator.notify(&[]).await.unwrap();
        assert!(summary.outcomes.is_empty());
        assert_eq!(summary.marked, 0);
    }

    #[tokio::test]
    async fn test_already_notified_records_keep_first_timestamp() {
        let (store, records) = seeded_store(&["A"]);
        let first = Utc::now() - chrono::Duration::hours(1);
        store.update_notified(&["A".to_string()], first).unwrap();

        let coordinator = NotificationCoordinator::new(store.clone(), MarkPolicy::Always)
            .with_broadcaster(broadcaster("email", sent));
        let summary = coordinator.notify(&records).await.unwrap();

        assert_eq!(summary.marked, 0);
        let stored = store.find_by_id("A").unwrap().unwrap();
        assert_eq!(
            stored.notified_at.map(|t| t.timestamp()),
            Some(first.timestamp())
        );
    }

    #[tokio::test]
    async fn test_close_reaches_every_channel() {
        let (store, _) = seeded_store(&[]);
        let mut failing = MockBroadcaster::new();
        failing.expect_channel().return_const("email");
        failing
            .expect_close()
            .times(1)
            .returning(|| Err(Error::notification("email", "already closed")));
        let mut ok = MockBroadcaster::new();
        ok.expect_channel().return_const("sms");
        ok.expect_close().times(1).returning(|| Ok(()));

        let coordinator = NotificationCoordinator::new(store, MarkPolicy::Always)
            .with_broadcaster(Arc::new(failing))
            .with_broadcaster(Arc::new(ok));
        coordinator.close().await;
    }

    #[test]
    fn test_delivery_without_successes_is_an_error() {
        let delivery = Delivery {
            sent: vec![],
            failed: vec![("+15550100".into(), "invalid number".into())],
        };
        let err = delivery.into_result("sms").unwrap_err();
        assert!(err.to_string().contains("invalid number"));

        assert!(Delivery::default().into_result("sms").is_ok());
    }

    #[test]
    fn test_describe_record() {
        let mut record = ServiceRequestRecord::new("A", "Jane Doe");
        record.referred_by_unit = Some("General Hospital".into());
        record.provider_type = Some("Home Health".into());
        assert_eq!(describe(&record), "Jane Doe from General Hospital (Home Health)");

        assert_eq!(describe(&ServiceRequestRecord::new("B", "")), "(unnamed patient)");
    }
}
