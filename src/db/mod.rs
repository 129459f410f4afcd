//! Durable storage for polls, their options, and per-voter vote records.
//!
//! Every mutation goes through a [`PollTx`]: a unit of work scoped to one poll
//! that is either committed as a whole or rolled back when dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::schema::{NewPoll, Page, Poll, PollStatus, Vote, VotedPoll};
use crate::error::StoreError;

pub mod dbclient;
#[cfg(test)]
pub mod faulty;
pub mod memory;
pub mod model;
pub mod schema;

/// How strongly a unit of work holds its poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Vote casting. Excludes status changes and deletion, not other votes.
    Shared,
    /// Status changes and deletion.
    Exclusive,
}

#[async_trait]
pub trait PollStore: Send + Sync + 'static {
    type Tx: PollTx + 'static;

    /// Starts a unit of work on one poll. Unrelated polls are never blocked by it.
    async fn begin(&self, id_poll: i64, mode: LockMode) -> Result<Self::Tx, StoreError>;

    /// Stores a poll and all of its options atomically, status ACTIVE.
    async fn create(&self, poll: NewPoll) -> Result<Poll, StoreError>;

    async fn get(&self, id_poll: i64) -> Result<Option<Poll>, StoreError>;

    async fn list_active_expired_before(&self, time: DateTime<Utc>) -> Result<Vec<Poll>, StoreError>;

    /// Case-insensitive title search ordered by id descending. `None` matches everything.
    async fn search(&self, title: Option<&str>, page: u32, page_size: u32) -> Result<Page<Poll>, StoreError>;

    async fn list_created_by(&self, id_created_by: &str) -> Result<Vec<Poll>, StoreError>;

    /// Most recent vote first.
    async fn list_votes_by(&self, id_voter: &str) -> Result<Vec<VotedPoll>, StoreError>;
}

#[async_trait]
pub trait PollTx: Send + Sized {
    /// Reads the poll with its current tallies. Call first: this is where the poll is locked.
    async fn poll(&mut self) -> Result<Option<Poll>, StoreError>;

    async fn has_voted(&mut self, id_voter: &str) -> Result<bool, StoreError>;

    /// Owning poll of any option in the store, so cross-poll references can be told
    /// apart from unknown options.
    async fn option_poll(&mut self, id_option: i64) -> Result<Option<i64>, StoreError>;

    /// Fails with [`StoreError::DuplicateVote`] when the voter already has a vote on this poll.
    async fn insert_vote(&mut self, id_voter: &str, id_option: i64, time: DateTime<Utc>) -> Result<Vote, StoreError>;

    /// Adds one to the option's tally and returns the new value.
    async fn increment_option_tally(&mut self, id_option: i64) -> Result<i64, StoreError>;

    /// Returns whether the status changed. A closed poll is never reopened.
    async fn set_status(&mut self, status: PollStatus) -> Result<bool, StoreError>;

    /// Removes the poll, its options and its votes. Returns false if it was already gone.
    async fn delete(&mut self) -> Result<bool, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
}
