use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use evlog::meta;

use crate::broadcaster::{Broadcaster, Subscription};
use crate::db::schema::{NewPoll, Page, Poll, PollStatus, VotedPoll};
use crate::db::{LockMode, PollStore, PollTx};
use crate::engine::{CastVote, VoteEngine};
use crate::error::PollError;
use crate::runtime::get_logger;
use crate::scheduler::Scheduler;
use crate::support::clock::Clock;
use crate::support::validate;

#[derive(Clone, Debug)]
pub struct ServiceOptions {
    pub channel_capacity: usize,
    pub vote_attempts: u32,
    pub sweep_interval: Duration,
    pub sweep_concurrency: usize,
    pub clock: Clock,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            vote_attempts: 3,
            sweep_interval: Duration::from_secs(60),
            sweep_concurrency: 8,
            clock: Clock::System,
        }
    }
}

/// Polls created by someone and the votes they cast.
#[derive(Clone, Debug)]
pub struct Profile {
    pub created: Vec<Poll>,
    pub voted: Vec<VotedPoll>,
}

/// Entry point for the presentation layer. Callers are already authenticated and
/// authorized; identifiers passed in are taken as given.
pub struct PollService<S: PollStore> {
    store: Arc<S>,
    engine: VoteEngine<S>,
    broadcaster: Arc<Broadcaster>,
    options: ServiceOptions,
}

impl<S: PollStore> PollService<S> {
    pub fn new(store: Arc<S>, options: ServiceOptions) -> Self {
        let broadcaster = Arc::new(Broadcaster::new(options.channel_capacity));
        let engine = VoteEngine::new(store.clone(), broadcaster.clone(), options.clock.clone(), options.vote_attempts);

        Self {
            store,
            engine,
            broadcaster,
            options,
        }
    }

    /// The sweep that goes with this service, sharing its store and clock.
    pub fn scheduler(&self) -> Arc<Scheduler<S>> {
        Arc::new(Scheduler::new(
            self.store.clone(),
            self.options.clock.clone(),
            self.options.sweep_interval,
            self.options.sweep_concurrency,
        ))
    }

    pub async fn create_poll(
        &self,
        title: &str,
        options: &[String],
        time_expires: Option<DateTime<Utc>>,
        id_created_by: &str,
    ) -> Result<Poll, PollError> {
        let (title, options) = validate::poll_fields(title, options)?;

        let poll = self.store.create(NewPoll {
            time_created: self.options.clock.now(),
            id_created_by: id_created_by.to_owned(),
            title,
            time_expires,
            options,
        }).await?;

        get_logger().info("Created poll.", meta![
            "PollID" => poll.id,
            "CreatedBy" => poll.id_created_by,
            "Options" => poll.options.len(),
        ]);

        Ok(poll)
    }

    pub async fn get_poll(&self, id_poll: i64) -> Result<Poll, PollError> {
        self.store.get(id_poll).await?.ok_or(PollError::PollNotFound(id_poll))
    }

    /// Newest first. A missing or blank search lists every poll.
    pub async fn list_polls(&self, search: Option<&str>, page: u32, page_size: u32) -> Result<Page<Poll>, PollError> {
        if page_size == 0 {
            return Err(PollError::Validation("page size must be greater than zero".to_owned()));
        }

        Ok(self.store.search(search, page, page_size).await?)
    }

    pub async fn cast_vote(&self, id_poll: i64, id_voter: &str, id_option: i64) -> Result<CastVote, PollError> {
        self.engine.cast_vote(id_poll, id_voter, id_option).await
    }

    /// Closing an already closed poll succeeds without changing anything.
    pub async fn close_poll(&self, id_poll: i64) -> Result<(), PollError> {
        let mut tx = self.store.begin(id_poll, LockMode::Exclusive).await?;

        if tx.poll().await?.is_none() {
            return Err(PollError::PollNotFound(id_poll));
        }

        let changed = tx.set_status(PollStatus::Closed).await?;
        tx.commit().await?;

        if changed {
            get_logger().info("Closed poll.", meta![
                "PollID" => id_poll,
            ]);
        }

        Ok(())
    }

    /// Removes the poll with its options and votes, and ends its live feed.
    pub async fn delete_poll(&self, id_poll: i64) -> Result<(), PollError> {
        let mut tx = self.store.begin(id_poll, LockMode::Exclusive).await?;

        if !tx.delete().await? {
            return Err(PollError::PollNotFound(id_poll));
        }
        tx.commit().await?;

        self.broadcaster.close(id_poll);

        get_logger().info("Deleted poll.", meta![
            "PollID" => id_poll,
        ]);

        Ok(())
    }

    /// Live tally updates for a poll. Nothing published before this call is replayed.
    pub async fn subscribe(&self, id_poll: i64) -> Result<Subscription, PollError> {
        if self.store.get(id_poll).await?.is_none() {
            return Err(PollError::PollNotFound(id_poll));
        }

        let sub = self.broadcaster.subscribe(id_poll);

        // A delete that committed in between has already closed the channel, so the
        // one just joined would never end. A delete committing after this check
        // closes it itself.
        if self.store.get(id_poll).await?.is_none() {
            drop(sub);
            self.broadcaster.close(id_poll);
            return Err(PollError::PollNotFound(id_poll));
        }

        Ok(sub)
    }

    pub async fn profile(&self, id_user: &str) -> Result<Profile, PollError> {
        Ok(Profile {
            created: self.store.list_created_by(id_user).await?,
            voted: self.store.list_votes_by(id_user).await?,
        })
    }
}
