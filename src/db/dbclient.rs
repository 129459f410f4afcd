use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

use crate::db::model;
use crate::db::schema::{NewPoll, Page, Poll, PollStatus, Vote, VotedPoll};
use crate::db::{LockMode, PollStore, PollTx};
use crate::error::StoreError;

/// PostgreSQL-backed [`PollStore`].
///
/// Voting holds the poll row `FOR SHARE`, so concurrent votes proceed together while
/// closing or deleting (`FOR UPDATE`) waits for them, and vice versa. The
/// `(id_poll, id_voter)` unique index settles racing votes from one voter, and
/// tallies are bumped with a single `UPDATE … + 1`.
pub struct DBClient {
    pool: PgPool,
}

impl DBClient {
    pub async fn new(db_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await?;

        Ok(Self {
            pool,
        })
    }

    pub fn conn(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

#[async_trait]
impl PollStore for DBClient {
    type Tx = PgPollTx;

    async fn begin(&self, id_poll: i64, mode: LockMode) -> Result<PgPollTx, StoreError> {
        let tx = self.pool.begin().await?;

        Ok(PgPollTx {
            tx,
            id_poll,
            mode,
        })
    }

    async fn create(&self, poll: NewPoll) -> Result<Poll, StoreError> {
        Ok(model::add_poll(&self.pool, &poll).await?)
    }

    async fn get(&self, id_poll: i64) -> Result<Option<Poll>, StoreError> {
        Ok(model::get_poll(&self.pool, id_poll).await?)
    }

    async fn list_active_expired_before(&self, time: DateTime<Utc>) -> Result<Vec<Poll>, StoreError> {
        Ok(model::list_active_expired_before(&self.pool, time).await?)
    }

    async fn search(&self, title: Option<&str>, page: u32, page_size: u32) -> Result<Page<Poll>, StoreError> {
        Ok(model::search_polls(&self.pool, title, page, page_size).await?)
    }

    async fn list_created_by(&self, id_created_by: &str) -> Result<Vec<Poll>, StoreError> {
        Ok(model::list_polls_created_by(&self.pool, id_created_by).await?)
    }

    async fn list_votes_by(&self, id_voter: &str) -> Result<Vec<VotedPoll>, StoreError> {
        Ok(model::list_votes_by(&self.pool, id_voter).await?)
    }
}

/// Rolled back by sqlx when dropped without [`PollTx::commit`].
pub struct PgPollTx {
    tx: Transaction<'static, Postgres>,
    id_poll: i64,
    mode: LockMode,
}

#[async_trait]
impl PollTx for PgPollTx {
    async fn poll(&mut self) -> Result<Option<Poll>, StoreError> {
        Ok(model::lock_poll(&mut self.tx, self.id_poll, self.mode).await?)
    }

    async fn has_voted(&mut self, id_voter: &str) -> Result<bool, StoreError> {
        Ok(model::check_voter_has_vote(&mut self.tx, self.id_poll, id_voter).await?)
    }

    async fn option_poll(&mut self, id_option: i64) -> Result<Option<i64>, StoreError> {
        Ok(model::get_option_poll(&mut self.tx, id_option).await?)
    }

    async fn insert_vote(&mut self, id_voter: &str, id_option: i64, time: DateTime<Utc>) -> Result<Vote, StoreError> {
        model::add_vote(&mut self.tx, self.id_poll, id_voter, id_option, time).await?
            .ok_or(StoreError::DuplicateVote { id_poll: self.id_poll })
    }

    async fn increment_option_tally(&mut self, id_option: i64) -> Result<i64, StoreError> {
        model::increment_option_tally(&mut self.tx, self.id_poll, id_option).await?
            .ok_or(StoreError::OptionNotFound(id_option))
    }

    async fn set_status(&mut self, status: PollStatus) -> Result<bool, StoreError> {
        match status {
            PollStatus::Closed => Ok(model::close_poll(&mut self.tx, self.id_poll).await?),
            PollStatus::Active => match model::get_poll_status(&mut self.tx, self.id_poll).await? {
                None => Err(StoreError::NotFound(self.id_poll)),
                Some(PollStatus::Active) => Ok(false),
                Some(PollStatus::Closed) => Err(StoreError::InvalidTransition { id_poll: self.id_poll }),
            },
        }
    }

    async fn delete(&mut self) -> Result<bool, StoreError> {
        Ok(model::delete_poll(&mut self.tx, self.id_poll).await?)
    }

    async fn commit(self) -> Result<(), StoreError> {
        Ok(self.tx.commit().await?)
    }
}
