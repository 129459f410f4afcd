//! A [`MemoryStore`] wrapper that injects store failures, for tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;

use crate::db::memory::{MemoryStore, MemoryTx};
use crate::db::schema::{NewPoll, Page, Poll, PollStatus, Vote, VotedPoll};
use crate::db::{LockMode, PollStore, PollTx};
use crate::error::StoreError;

#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    conflicts: AtomicU32,
    unavailable: DashSet<i64>,
    listing_down: AtomicBool,
    delete_after_get: DashSet<i64>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` transactions fail to commit with a transient conflict.
    pub fn conflict_next(&self, n: u32) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    /// Transactions on this poll cannot be started.
    pub fn break_poll(&self, id_poll: i64) {
        self.unavailable.insert(id_poll);
    }

    /// The next read of this poll still sees it, then the poll is deleted.
    pub fn delete_after_next_get(&self, id_poll: i64) {
        self.delete_after_get.insert(id_poll);
    }

    pub fn set_listing_down(&self, down: bool) {
        self.listing_down.store(down, Ordering::SeqCst);
    }
}

pub struct FaultyTx {
    inner: MemoryTx,
    conflict: bool,
}

#[async_trait]
impl PollStore for FaultyStore {
    type Tx = FaultyTx;

    async fn begin(&self, id_poll: i64, mode: LockMode) -> Result<FaultyTx, StoreError> {
        if self.unavailable.contains(&id_poll) {
            return Err(StoreError::Unavailable(format!("poll {} is on a broken shard", id_poll)));
        }

        let conflict = self.conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        Ok(FaultyTx {
            inner: self.inner.begin(id_poll, mode).await?,
            conflict,
        })
    }

    async fn create(&self, poll: NewPoll) -> Result<Poll, StoreError> {
        self.inner.create(poll).await
    }

    async fn get(&self, id_poll: i64) -> Result<Option<Poll>, StoreError> {
        let poll = self.inner.get(id_poll).await?;

        if self.delete_after_get.remove(&id_poll).is_some() {
            let mut tx = self.inner.begin(id_poll, LockMode::Exclusive).await?;
            tx.delete().await?;
            tx.commit().await?;
        }

        Ok(poll)
    }

    async fn list_active_expired_before(&self, time: DateTime<Utc>) -> Result<Vec<Poll>, StoreError> {
        if self.listing_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("listing is down".to_owned()));
        }
        self.inner.list_active_expired_before(time).await
    }

    async fn search(&self, title: Option<&str>, page: u32, page_size: u32) -> Result<Page<Poll>, StoreError> {
        self.inner.search(title, page, page_size).await
    }

    async fn list_created_by(&self, id_created_by: &str) -> Result<Vec<Poll>, StoreError> {
        self.inner.list_created_by(id_created_by).await
    }

    async fn list_votes_by(&self, id_voter: &str) -> Result<Vec<VotedPoll>, StoreError> {
        self.inner.list_votes_by(id_voter).await
    }
}

#[async_trait]
impl PollTx for FaultyTx {
    async fn poll(&mut self) -> Result<Option<Poll>, StoreError> {
        self.inner.poll().await
    }

    async fn has_voted(&mut self, id_voter: &str) -> Result<bool, StoreError> {
        self.inner.has_voted(id_voter).await
    }

    async fn option_poll(&mut self, id_option: i64) -> Result<Option<i64>, StoreError> {
        self.inner.option_poll(id_option).await
    }

    async fn insert_vote(&mut self, id_voter: &str, id_option: i64, time: DateTime<Utc>) -> Result<Vote, StoreError> {
        self.inner.insert_vote(id_voter, id_option, time).await
    }

    async fn increment_option_tally(&mut self, id_option: i64) -> Result<i64, StoreError> {
        self.inner.increment_option_tally(id_option).await
    }

    async fn set_status(&mut self, status: PollStatus) -> Result<bool, StoreError> {
        self.inner.set_status(status).await
    }

    async fn delete(&mut self) -> Result<bool, StoreError> {
        self.inner.delete().await
    }

    async fn commit(self) -> Result<(), StoreError> {
        if self.conflict {
            // The inner transaction is dropped here and rolls back.
            return Err(StoreError::Conflict("could not serialize access".to_owned()));
        }
        self.inner.commit().await
    }
}
