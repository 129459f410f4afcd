//! Vote casting.
//!
//! One vote is one unit of work on its poll: read the poll, check it is open,
//! check the voter, check the option, then insert the vote and bump the tally.
//! The store's (poll, voter) uniqueness and atomic increment do the real
//! guarding; the pre-checks only produce a precise error.

use std::sync::Arc;

use evlog::meta;

use crate::broadcaster::Broadcaster;
use crate::db::schema::Vote;
use crate::db::{LockMode, PollStore, PollTx};
use crate::error::PollError;
use crate::runtime::get_logger;
use crate::support::clock::Clock;

#[derive(Clone, Debug, PartialEq)]
pub struct CastVote {
    pub vote: Vote,
    /// Tally of the chosen option right after this vote committed.
    pub vote_count: i64,
}

pub struct VoteEngine<S: PollStore> {
    store: Arc<S>,
    broadcaster: Arc<Broadcaster>,
    clock: Clock,
    max_attempts: u32,
}

impl<S: PollStore> VoteEngine<S> {
    pub fn new(store: Arc<S>, broadcaster: Arc<Broadcaster>, clock: Clock, max_attempts: u32) -> Self {
        Self {
            store,
            broadcaster,
            clock,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn cast_vote(&self, id_poll: i64, id_voter: &str, id_option: i64) -> Result<CastVote, PollError> {
        let mut attempt = 1;

        let cast = loop {
            match self.try_cast_vote(id_poll, id_voter, id_option).await {
                Err(PollError::StoreUnavailable(e)) if e.is_transient() && attempt < self.max_attempts => {
                    get_logger().warn_with_err("Vote conflicted with another transaction; retrying.", &e, meta![
                        "PollID" => id_poll,
                        "OptionID" => id_option,
                        "Attempt" => attempt,
                    ]);
                    attempt += 1;
                }
                r => break r?,
            }
        };

        get_logger().debug("Vote recorded.", meta![
            "PollID" => id_poll,
            "OptionID" => id_option,
            "VoteID" => cast.vote.id,
            "VoteCount" => cast.vote_count,
        ]);

        // After commit and outside the unit of work; nothing here can undo the vote.
        // Racing votes may get here out of commit order, and the broadcaster drops
        // whichever tally is older than one it already sent.
        self.broadcaster.publish(id_poll, id_option, cast.vote_count);

        Ok(cast)
    }

    async fn try_cast_vote(&self, id_poll: i64, id_voter: &str, id_option: i64) -> Result<CastVote, PollError> {
        let mut tx = self.store.begin(id_poll, LockMode::Shared).await?;

        let poll = tx.poll().await?.ok_or(PollError::PollNotFound(id_poll))?;

        // Read once the poll is held, not when the request arrived.
        let now = self.clock.now();
        if !poll.accepts_votes(now) {
            return Err(PollError::PollClosed(id_poll));
        }

        if tx.has_voted(id_voter).await? {
            return Err(PollError::AlreadyVoted(id_poll));
        }

        match tx.option_poll(id_option).await? {
            None => return Err(PollError::OptionNotFound(id_option)),
            Some(owner) if owner != id_poll => return Err(PollError::OptionPollMismatch { id_poll, id_option }),
            Some(_) => {}
        }

        // A racing vote from the same voter surfaces here as AlreadyVoted.
        let vote = tx.insert_vote(id_voter, id_option, now).await?;
        let vote_count = tx.increment_option_tally(id_option).await?;

        tx.commit().await?;

        Ok(CastVote {
            vote,
            vote_count,
        })
    }
}
