//! Periodic sweep that closes active polls whose expiry has passed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use evlog::meta;
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::db::schema::PollStatus;
use crate::db::{LockMode, PollStore, PollTx};
use crate::error::StoreError;
use crate::runtime::get_logger;
use crate::support::clock::Clock;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Polls the listing returned as active and expired.
    pub expired: usize,
    /// Polls this sweep actually flipped to closed.
    pub closed: usize,
    pub failed: usize,
}

pub struct Scheduler<S: PollStore> {
    store: Arc<S>,
    clock: Clock,
    period: Duration,
    concurrency: usize,
}

impl<S: PollStore> Scheduler<S> {
    pub fn new(store: Arc<S>, clock: Clock, period: Duration, concurrency: usize) -> Self {
        Self {
            store,
            clock,
            period,
            concurrency: concurrency.max(1),
        }
    }

    /// One pass. A poll that fails to close is counted and left for the next pass.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let now = self.clock.now();
        let expired = self.store.list_active_expired_before(now).await?;

        let ids = expired.iter().map(|v| v.id).collect_vec();

        let results = stream::iter(ids)
            .map(|id_poll| async move { (id_poll, self.close_expired(id_poll, now).await) })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut report = SweepReport {
            expired: expired.len(),
            ..SweepReport::default()
        };

        for (id_poll, result) in results {
            match result {
                Ok(true) => {
                    report.closed += 1;
                    get_logger().info("Closed expired poll.", meta![
                        "PollID" => id_poll,
                    ]);
                }
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    get_logger().error_with_err("Failed to close expired poll.", &e, meta![
                        "PollID" => id_poll,
                    ]);
                }
            }
        }

        Ok(report)
    }

    async fn close_expired(&self, id_poll: i64, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tx = self.store.begin(id_poll, LockMode::Exclusive).await?;

        let poll = match tx.poll().await? {
            None => return Ok(false),
            Some(v) => v,
        };

        // Another sweep or an explicit close may have got here first.
        if poll.status != PollStatus::Active || !poll.is_expired(now) {
            return Ok(false);
        }

        let changed = tx.set_status(PollStatus::Closed).await?;
        tx.commit().await?;

        Ok(changed)
    }

    async fn run_once(&self) {
        match self.sweep().await {
            Ok(report) => {
                if report.expired > 0 {
                    get_logger().info("Sweep finished.", meta![
                        "Expired" => report.expired,
                        "Closed" => report.closed,
                        "Failed" => report.failed,
                    ]);
                }
            }
            Err(e) => {
                get_logger().error_with_err("Sweep could not list expired polls; retrying next period.", &e, None);
            }
        }
    }

    /// Sweeps immediately and then every period until `shutdown` changes or its sender is dropped.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            get_logger().info("Lifecycle scheduler started.", meta![
                "PeriodSecs" => self.period.as_secs_f64(),
            ]);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => self.run_once().await,
                }
            }

            get_logger().info("Lifecycle scheduler stopped.", None);
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone};

    use super::*;
    use crate::db::faulty::FaultyStore;
    use crate::db::memory::MemoryStore;
    use crate::db::schema::NewPoll;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 4, 8, 0, 0).unwrap()
    }

    async fn create<S: PollStore>(store: &S, title: &str, time_expires: Option<DateTime<Utc>>) -> i64 {
        store.create(NewPoll {
            time_created: t0() - ChronoDuration::days(1),
            id_created_by: "admin".to_owned(),
            title: title.to_owned(),
            time_expires,
            options: vec!["Yes".to_owned(), "No".to_owned()],
        }).await.unwrap().id
    }

    fn scheduler<S: PollStore>(store: Arc<S>) -> Scheduler<S> {
        Scheduler::new(store, Clock::manual(t0()), Duration::from_secs(60), 4)
    }

    #[tokio::test]
    async fn sweep_closes_only_expired_polls() {
        let store = Arc::new(MemoryStore::new());
        let expired = create(&*store, "expired", Some(t0() - ChronoDuration::seconds(1))).await;
        let at_boundary = create(&*store, "boundary", Some(t0())).await;
        let future = create(&*store, "future", Some(t0() + ChronoDuration::hours(1))).await;
        let open_ended = create(&*store, "open", None).await;

        let report = scheduler(store.clone()).sweep().await.unwrap();
        assert_eq!(report, SweepReport { expired: 1, closed: 1, failed: 0 });

        assert_eq!(store.get(expired).await.unwrap().unwrap().status, PollStatus::Closed);
        for id in [at_boundary, future, open_ended] {
            assert_eq!(store.get(id).await.unwrap().unwrap().status, PollStatus::Active);
        }
    }

    #[tokio::test]
    async fn repeated_sweeps_are_noops() {
        let store = Arc::new(MemoryStore::new());
        create(&*store, "expired", Some(t0() - ChronoDuration::minutes(5))).await;
        let scheduler = scheduler(store.clone());

        assert_eq!(scheduler.sweep().await.unwrap().closed, 1);
        assert_eq!(scheduler.sweep().await.unwrap(), SweepReport::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overlapping_sweeps_close_each_poll_once() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..20 {
            create(&*store, &format!("expired {}", i), Some(t0() - ChronoDuration::seconds(i + 1))).await;
        }

        let scheduler = Arc::new(scheduler(store.clone()));
        let runs = (0..3)
            .map(|_| {
                let scheduler = scheduler.clone();
                tokio::spawn(async move { scheduler.sweep().await.unwrap() })
            })
            .collect::<Vec<_>>();

        let mut closed = 0;
        for run in futures::future::join_all(runs).await {
            let report = run.unwrap();
            assert_eq!(report.failed, 0);
            closed += report.closed;
        }

        assert_eq!(closed, 20);
        assert!(store.list_active_expired_before(t0()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_failing_poll_does_not_block_the_rest() {
        let store = Arc::new(FaultyStore::new());
        let broken = create(&*store, "broken", Some(t0() - ChronoDuration::seconds(10))).await;
        let healthy = create(&*store, "healthy", Some(t0() - ChronoDuration::seconds(10))).await;
        store.break_poll(broken);

        let report = scheduler(store.clone()).sweep().await.unwrap();
        assert_eq!(report, SweepReport { expired: 2, closed: 1, failed: 1 });

        assert_eq!(store.get(healthy).await.unwrap().unwrap().status, PollStatus::Closed);
        assert_eq!(store.get(broken).await.unwrap().unwrap().status, PollStatus::Active);
    }

    #[tokio::test]
    async fn listing_failure_is_reported() {
        let store = Arc::new(FaultyStore::new());
        store.set_listing_down(true);

        let err = scheduler(store).sweep().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn spawned_scheduler_sweeps_and_stops() {
        let store = Arc::new(MemoryStore::new());
        let clock = Clock::manual(t0());
        let id = create(&*store, "soon", Some(t0() + ChronoDuration::seconds(30))).await;

        let scheduler = Arc::new(Scheduler::new(store.clone(), clock.clone(), Duration::from_millis(10), 2));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = scheduler.spawn(shutdown_rx);

        clock.advance(ChronoDuration::minutes(1));

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if store.get(id).await.unwrap().unwrap().status == PollStatus::Closed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await;
        assert!(closed.is_ok());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
