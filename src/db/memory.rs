//! In-process [`PollStore`].
//!
//! Each poll is an aggregate behind its own async mutex, so a unit of work on one
//! poll never waits on another. Writes are applied in place under the lock and
//! recorded in an undo log; dropping an uncommitted transaction replays the log
//! backwards. Deletion is deferred to commit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use itertools::Itertools;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::db::schema::{NewPoll, Page, Poll, PollOption, PollStatus, Vote, VotedPoll};
use crate::db::{LockMode, PollStore, PollTx};
use crate::error::StoreError;

struct PollRecord {
    poll: Poll,
    votes: HashMap<String, Vote>,
    deleted: bool,
}

#[derive(Default)]
struct Inner {
    polls: DashMap<i64, Arc<Mutex<PollRecord>>>,
    // option id -> poll id
    options: DashMap<i64, i64>,
    next_poll: AtomicI64,
    next_option: AtomicI64,
    next_vote: AtomicI64,
}

impl Inner {
    fn next_id(counter: &AtomicI64) -> i64 {
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn cell(&self, id_poll: i64) -> Option<Arc<Mutex<PollRecord>>> {
        self.polls.get(&id_poll).map(|v| v.value().clone())
    }

    fn cells(&self) -> Vec<Arc<Mutex<PollRecord>>> {
        self.polls.iter().map(|v| v.value().clone()).collect_vec()
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks polls one at a time; holding several locks at once could deadlock
    /// against a concurrent snapshot taken in a different order.
    async fn polls(&self) -> Vec<Poll> {
        let mut polls = Vec::new();
        for cell in self.inner.cells() {
            let record = cell.lock().await;
            if !record.deleted {
                polls.push(record.poll.clone());
            }
        }
        polls
    }
}

#[async_trait]
impl PollStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self, id_poll: i64, _mode: LockMode) -> Result<MemoryTx, StoreError> {
        let record = match self.inner.cell(id_poll) {
            None => None,
            Some(cell) => {
                let record = cell.lock_owned().await;
                // Deleted while we were waiting for the lock.
                if record.deleted {
                    None
                } else {
                    Some(record)
                }
            }
        };

        Ok(MemoryTx {
            inner: self.inner.clone(),
            id_poll,
            record,
            undo: Vec::new(),
            delete: false,
            committed: false,
        })
    }

    async fn create(&self, poll: NewPoll) -> Result<Poll, StoreError> {
        let id = Inner::next_id(&self.inner.next_poll);

        let options = poll.options.into_iter()
            .map(|option| PollOption {
                id_poll: id,
                id: Inner::next_id(&self.inner.next_option),
                option,
                vote_count: 0,
            })
            .collect_vec();

        for opt in &options {
            self.inner.options.insert(opt.id, id);
        }

        let poll = Poll {
            id,
            time_created: poll.time_created,
            id_created_by: poll.id_created_by,
            status: PollStatus::Active,
            title: poll.title,
            time_expires: poll.time_expires,
            options,
        };

        self.inner.polls.insert(id, Arc::new(Mutex::new(PollRecord {
            poll: poll.clone(),
            votes: HashMap::new(),
            deleted: false,
        })));

        Ok(poll)
    }

    async fn get(&self, id_poll: i64) -> Result<Option<Poll>, StoreError> {
        let cell = match self.inner.cell(id_poll) {
            None => return Ok(None),
            Some(v) => v,
        };

        let record = cell.lock().await;
        if record.deleted {
            return Ok(None);
        }

        Ok(Some(record.poll.clone()))
    }

    async fn list_active_expired_before(&self, time: DateTime<Utc>) -> Result<Vec<Poll>, StoreError> {
        Ok(self.polls().await.into_iter()
            .filter(|v| v.status == PollStatus::Active && v.is_expired(time))
            .sorted_by_key(|v| v.id)
            .collect())
    }

    async fn search(&self, title: Option<&str>, page: u32, page_size: u32) -> Result<Page<Poll>, StoreError> {
        let needle = title
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty());

        let matching = self.polls().await.into_iter()
            .filter(|v| match &needle {
                None => true,
                Some(needle) => v.title.to_lowercase().contains(needle.as_str()),
            })
            .sorted_by(|a, b| b.id.cmp(&a.id))
            .collect_vec();

        let total = matching.len() as u64;
        let offset = usize::try_from(Page::<Poll>::offset(page, page_size)).unwrap_or(usize::MAX);

        Ok(Page {
            items: matching.into_iter().skip(offset).take(page_size as usize).collect(),
            page,
            page_size,
            total,
        })
    }

    async fn list_created_by(&self, id_created_by: &str) -> Result<Vec<Poll>, StoreError> {
        Ok(self.polls().await.into_iter()
            .filter(|v| v.id_created_by == id_created_by)
            .sorted_by(|a, b| b.id.cmp(&a.id))
            .collect())
    }

    async fn list_votes_by(&self, id_voter: &str) -> Result<Vec<VotedPoll>, StoreError> {
        let mut result = Vec::new();

        for cell in self.inner.cells() {
            let record = cell.lock().await;
            if record.deleted {
                continue;
            }

            let vote = match record.votes.get(id_voter) {
                None => continue,
                Some(v) => v,
            };

            let option = record.poll.option(vote.id_option)
                .map(|v| v.option.clone())
                .unwrap_or_default();

            result.push(VotedPoll {
                id_vote: vote.id,
                poll: record.poll.clone(),
                id_option: vote.id_option,
                option,
            });
        }

        result.sort_by(|a, b| b.id_vote.cmp(&a.id_vote));

        Ok(result)
    }
}

enum Undo {
    Vote(String),
    Tally(i64),
    Status(PollStatus),
}

pub struct MemoryTx {
    inner: Arc<Inner>,
    id_poll: i64,
    // None if the poll did not exist when the transaction began.
    record: Option<OwnedMutexGuard<PollRecord>>,
    undo: Vec<Undo>,
    delete: bool,
    committed: bool,
}

impl MemoryTx {
    fn record(&self) -> Option<&PollRecord> {
        if self.delete {
            return None;
        }
        self.record.as_deref()
    }

    fn record_mut(&mut self) -> Result<&mut PollRecord, StoreError> {
        if self.delete {
            return Err(StoreError::NotFound(self.id_poll));
        }
        self.record.as_deref_mut().ok_or(StoreError::NotFound(self.id_poll))
    }
}

#[async_trait]
impl PollTx for MemoryTx {
    async fn poll(&mut self) -> Result<Option<Poll>, StoreError> {
        Ok(self.record().map(|v| v.poll.clone()))
    }

    async fn has_voted(&mut self, id_voter: &str) -> Result<bool, StoreError> {
        Ok(self.record_mut()?.votes.contains_key(id_voter))
    }

    async fn option_poll(&mut self, id_option: i64) -> Result<Option<i64>, StoreError> {
        Ok(self.inner.options.get(&id_option).map(|v| *v.value()))
    }

    async fn insert_vote(&mut self, id_voter: &str, id_option: i64, time: DateTime<Utc>) -> Result<Vote, StoreError> {
        let id_poll = self.id_poll;
        let id = Inner::next_id(&self.inner.next_vote);

        let record = self.record_mut()?;
        if record.votes.contains_key(id_voter) {
            return Err(StoreError::DuplicateVote { id_poll });
        }
        if record.poll.option(id_option).is_none() {
            return Err(StoreError::OptionNotFound(id_option));
        }

        let vote = Vote {
            id,
            time_created: time,
            id_poll,
            id_voter: id_voter.to_owned(),
            id_option,
        };
        record.votes.insert(id_voter.to_owned(), vote.clone());

        self.undo.push(Undo::Vote(id_voter.to_owned()));

        Ok(vote)
    }

    async fn increment_option_tally(&mut self, id_option: i64) -> Result<i64, StoreError> {
        let record = self.record_mut()?;

        let opt = record.poll.options.iter_mut()
            .find(|v| v.id == id_option)
            .ok_or(StoreError::OptionNotFound(id_option))?;
        opt.vote_count += 1;
        let vote_count = opt.vote_count;

        self.undo.push(Undo::Tally(id_option));

        Ok(vote_count)
    }

    async fn set_status(&mut self, status: PollStatus) -> Result<bool, StoreError> {
        let id_poll = self.id_poll;
        let record = self.record_mut()?;

        let previous = record.poll.status;
        if previous == status {
            return Ok(false);
        }
        if previous == PollStatus::Closed {
            return Err(StoreError::InvalidTransition { id_poll });
        }
        record.poll.status = status;

        self.undo.push(Undo::Status(previous));

        Ok(true)
    }

    async fn delete(&mut self) -> Result<bool, StoreError> {
        if self.record().is_none() {
            return Ok(false);
        }

        self.delete = true;

        Ok(true)
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        if self.delete {
            if let Some(record) = self.record.as_deref_mut() {
                record.deleted = true;
                for opt in &record.poll.options {
                    self.inner.options.remove(&opt.id);
                }
            }
            self.inner.polls.remove(&self.id_poll);
        }

        self.committed = true;

        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        let record = match self.record.as_deref_mut() {
            None => return,
            Some(v) => v,
        };

        for undo in self.undo.drain(..).rev() {
            match undo {
                Undo::Vote(id_voter) => {
                    record.votes.remove(&id_voter);
                }
                Undo::Tally(id_option) => {
                    if let Some(opt) = record.poll.options.iter_mut().find(|v| v.id == id_option) {
                        opt.vote_count -= 1;
                    }
                }
                Undo::Status(status) => {
                    record.poll.status = status;
                }
            }
        }
    }
}
