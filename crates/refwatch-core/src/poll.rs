use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info};

use crate::fetcher::ReferralFetcher;
use crate::ingest::DedupIngestor;
use crate::notify::NotificationCoordinator;
use crate::Result;

/// What a single fetch/ingest/notify pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub total_upstream: u64,
    pub new_records: usize,
    pub marked: usize,
}

pub struct PollLoop {
    fetcher: ReferralFetcher,
    ingestor: DedupIngestor,
    coordinator: NotificationCoordinator,
    interval: Duration,
}

impl PollLoop {
    pub fn new(
        fetcher: ReferralFetcher,
        ingestor: DedupIngestor,
        coordinator: NotificationCoordinator,
        interval: Duration,
    ) -> Self {
        Self {
            fetcher,
            ingestor,
            coordinator,
            interval,
        }
    }

    pub fn coordinator(&self) -> &NotificationCoordinator {
        &self.coordinator
    }

    /// One pass; errors end the pass but are left to the caller
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let page = self.fetcher.fetch().await?;
        let fresh = self.ingestor.ingest(&page)?;

        let marked = if fresh.is_empty() {
            0
        } else {
            self.coordinator.notify(&fresh).await?.marked
        };

        Ok(CycleReport {
            fetched: page.data_length,
            total_upstream: page.total_records,
            new_records: fresh.len(),
            marked,
        })
    }

    /// Run cycles until `shutdown` flips to true or its sender goes away.
    ///
    /// A failed cycle is logged and the loop carries on at the next tick.
    /// Shutdown is only observed between cycles.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "poll loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            match self.run_cycle().await {
                Ok(report) => info!(
                    fetched = report.fetched,
                    total_upstream = report.total_upstream,
                    new = report.new_records,
                    marked = report.marked,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "poll cycle finished"
                ),
                Err(e) => match e.auth_step() {
                    Some(step) => error!(step = %step, error = %e, "poll cycle failed"),
                    None => error!(error = %e, "poll cycle failed"),
                },
            }

            debug!(next_in_secs = self.interval.as_secs(), "waiting for next cycle");
            tokio::select! {
                _ = sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    // Sender dropped
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("poll loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthStep;
    use crate::fetcher::MockReferralSource;
    use crate::login::MockCredentialAcquirer;
    use crate::notify::{Delivery, MarkPolicy, MockBroadcaster};
    use crate::token_store::TokenStore;
    use crate::Error;
    use chrono::Utc;
    use refwatch_api::{ReferralOutcome, ReferralPage};
    use refwatch_store::{RecordStore, SqliteStore, TokenPair};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn outcome(ids: &[&str], total: u64) -> ReferralOutcome {
        let data: Vec<serde_json::Value> = ids
            .iter()
            .map(|id| serde_json::json!({ "ServiceRequestId": id }))
            .collect();
        let raw = serde_json::json!({ "Data": data, "TotalRecords": total }).to_string();
        ReferralOutcome::Page(ReferralPage::parse(raw.as_bytes()).unwrap())
    }

    fn poll_loop(
        store: Arc<SqliteStore>,
        source: MockReferralSource,
        broadcaster: MockBroadcaster,
    ) -> PollLoop {
        poll_loop_every(store, source, broadcaster, Duration::from_secs(3600))
    }

    fn poll_loop_every(
        store: Arc<SqliteStore>,
        source: MockReferralSource,
        broadcaster: MockBroadcaster,
        interval: Duration,
    ) -> PollLoop {
        let tokens = TokenStore::new(store.clone());
        tokens
            .store(TokenPair::new(
                "cached",
                "refresh",
                Utc::now() + chrono::Duration::hours(1),
            ))
            .unwrap();

        let fetcher = ReferralFetcher::new(
            tokens,
            Arc::new(MockCredentialAcquirer::new()),
            Arc::new(source),
        );
        let coordinator = NotificationCoordinator::new(store.clone(), MarkPolicy::Always)
            .with_broadcaster(Arc::new(broadcaster));

        PollLoop::new(fetcher, DedupIngestor::new(store), coordinator, interval)
    }

    #[tokio::test]
    async fn test_new_record_is_stored_notified_and_marked_once() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let mut source = MockReferralSource::new();
        source.expect_fetch_page().times(2).returning(|_| Ok(outcome(&["A"], 1)));

        let mut broadcaster = MockBroadcaster::new();
        broadcaster.expect_channel().return_const("email");
        broadcaster
            .expect_broadcast()
            .withf(|records| records.len() == 1 && records[0].id == "A")
            .times(1)
            .returning(|_| {
                Ok(Delivery {
                    sent: vec!["ops@example.com".into()],
                    failed: vec![],
                })
            });

        let poll = poll_loop(store.clone(), source, broadcaster);

        let first = poll.run_cycle().await.unwrap();
        assert_eq!(
            first,
            CycleReport {
                fetched: 1,
                total_upstream: 1,
                new_records: 1,
                marked: 1,
            }
        );
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.metadata().unwrap().unwrap().total_records_seen_upstream, 1);
        assert!(store.find_by_id("A").unwrap().unwrap().is_notified());

        let second = poll.run_cycle().await.unwrap();
        assert_eq!(second.new_records, 0);
        assert_eq!(second.marked, 0);
    }

    #[tokio::test]
    async fn test_empty_page_skips_notification() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let mut source = MockReferralSource::new();
        source.expect_fetch_page().returning(|_| Ok(outcome(&[], 0)));
        let mut broadcaster = MockBroadcaster::new();
        broadcaster.expect_broadcast().never();

        let poll = poll_loop(store.clone(), source, broadcaster);
        let report = poll.run_cycle().await.unwrap();

        assert_eq!(report, CycleReport::default());
        assert_eq!(store.metadata().unwrap().unwrap().total_records_seen_upstream, 0);
    }

    #[tokio::test]
    async fn test_failed_cycle_surfaces_error() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let mut source = MockReferralSource::new();
        source
            .expect_fetch_page()
            .returning(|_| Err(Error::Upstream { status: 500, body: "boom".into() }));
        let broadcaster = MockBroadcaster::new();

        let poll = poll_loop(store.clone(), source, broadcaster);
        let err = poll.run_cycle().await.unwrap_err();

        assert!(matches!(err, Error::Upstream { status: 500, .. }));
        assert_eq!(err.auth_step(), None::<AuthStep>);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_after_failed_cycle() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let mut source = MockReferralSource::new();
        source
            .expect_fetch_page()
            .times(1)
            .returning(|_| Err(Error::Upstream { status: 502, body: String::new() }));
        let broadcaster = MockBroadcaster::new();

        let poll = poll_loop(store, source, broadcaster);
        let (tx, rx) = watch::channel(false);

        let stop = async {
            sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(poll.run(rx), stop);
        })
        .await
        .expect("poll loop did not stop");
    }

    #[tokio::test]
    async fn test_run_keeps_polling_after_failed_cycle() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut source = MockReferralSource::new();
        let counter = calls.clone();
        source.expect_fetch_page().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Upstream { status: 503, body: String::new() })
            } else {
                Ok(outcome(&["A"], 1))
            }
        });

        let mut broadcaster = MockBroadcaster::new();
        broadcaster.expect_channel().return_const("email");
        broadcaster.expect_broadcast().times(1).returning(|_| {
            Ok(Delivery {
                sent: vec!["ops@example.com".into()],
                failed: vec![],
            })
        });

        let poll = poll_loop_every(store.clone(), source, broadcaster, Duration::from_millis(10));
        let (tx, rx) = watch::channel(false);

        let stop = async {
            while !store
                .find_by_id("A")
                .unwrap()
                .is_some_and(|record| record.is_notified())
            {
                sleep(Duration::from_millis(5)).await;
            }
            tx.send(true).unwrap();
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(poll.run(rx), stop);
        })
        .await
        .expect("poll loop never recovered");

        assert!(calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_exits_immediately_when_already_shut_down() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let mut source = MockReferralSource::new();
        source.expect_fetch_page().never();

        let poll = poll_loop(store, source, MockBroadcaster::new());
        let (_tx, rx) = watch::channel(true);

        tokio::time::timeout(Duration::from_secs(1), poll.run(rx))
            .await
            .expect("poll loop did not stop");
    }
}
