use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PollStatus {
    Active,
    Closed,
}

impl PollStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollStatus::Active => "ACTIVE",
            PollStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(PollStatus::Active),
            "CLOSED" => Some(PollStatus::Closed),
            _ => None,
        }
    }
}

impl Display for PollStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Poll {
    pub id: i64,
    pub time_created: DateTime<Utc>,
    pub id_created_by: String,
    pub status: PollStatus,
    pub title: String,
    pub time_expires: Option<DateTime<Utc>>,
    pub options: Vec<PollOption>,
}

impl Poll {
    /// True when `now` is past the poll's expiry. The expiry instant itself still counts as open.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.time_expires {
            None => false,
            Some(t) => t < now,
        }
    }

    /// Status is only a cached projection; expiry is checked directly.
    pub fn accepts_votes(&self, now: DateTime<Utc>) -> bool {
        self.status == PollStatus::Active && !self.is_expired(now)
    }

    pub fn option(&self, id_option: i64) -> Option<&PollOption> {
        self.options.iter().find(|v| v.id == id_option)
    }

    pub fn total_votes(&self) -> i64 {
        self.options.iter().map(|v| v.vote_count).sum()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PollOption {
    pub id_poll: i64,
    pub id: i64,
    pub option: String,
    pub vote_count: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Vote {
    pub id: i64,
    pub time_created: DateTime<Utc>,
    pub id_poll: i64,
    pub id_voter: String,
    pub id_option: i64,
}

/// A validated poll ready to be stored; options keep their given order.
#[derive(Clone, Debug)]
pub struct NewPoll {
    pub time_created: DateTime<Utc>,
    pub id_created_by: String,
    pub title: String,
    pub time_expires: Option<DateTime<Utc>>,
    pub options: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn offset(page: u32, page_size: u32) -> u64 {
        page as u64 * page_size as u64
    }
}

/// A poll the voter took part in, with the option they picked.
#[derive(Clone, Debug)]
pub struct VotedPoll {
    pub id_vote: i64,
    pub poll: Poll,
    pub id_option: i64,
    pub option: String,
}
