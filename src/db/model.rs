use std::collections::HashMap;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use sqlx::postgres::PgRow;
use sqlx::{query, Executor, PgConnection, PgPool, Postgres, Row, Transaction};

use crate::db::schema::{NewPoll, Page, Poll, PollOption, PollStatus, Vote, VotedPoll};
use crate::db::LockMode;

const POLL_COLUMNS: &str = "p.id, p.time_created, p.id_created_by, p.status, p.title, p.time_expires";

fn poll_from_row(r: &PgRow) -> Result<Poll, sqlx::Error> {
    let status: String = r.try_get("status")?;
    let status = PollStatus::parse(&status)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown poll status '{}'", status).into()))?;

    Ok(Poll {
        id: r.try_get("id")?,
        time_created: r.try_get("time_created")?,
        id_created_by: r.try_get("id_created_by")?,
        status,
        title: r.try_get("title")?,
        time_expires: r.try_get("time_expires")?,
        options: Vec::new(),
    })
}

async fn fetch_options<'e, E>(conn: E, ids: Vec<i64>) -> Result<Vec<PollOption>, sqlx::Error>
    where E: Executor<'e, Database=Postgres>
{
    query("SELECT id_poll, id, option, vote_count FROM poll_option WHERE id_poll = ANY($1) ORDER BY id_poll, position;")
        .bind(ids)
        .try_map(|r: PgRow| Ok(PollOption {
            id_poll: r.try_get("id_poll")?,
            id: r.try_get("id")?,
            option: r.try_get("option")?,
            vote_count: r.try_get("vote_count")?,
        }))
        .fetch_all(conn)
        .await
}

async fn with_options(conn: &mut PgConnection, mut polls: Vec<Poll>) -> Result<Vec<Poll>, sqlx::Error> {
    if polls.is_empty() {
        return Ok(polls);
    }

    let ids = polls.iter().map(|v| v.id).collect_vec();
    let mut options: HashMap<i64, Vec<PollOption>> = fetch_options(conn, ids).await?
        .into_iter()
        .into_group_map_by(|v| v.id_poll);

    for poll in &mut polls {
        if let Some(opts) = options.remove(&poll.id) {
            poll.options = opts;
        }
    }

    Ok(polls)
}

/// Read-only transaction so polls and their options come from one snapshot.
async fn snapshot(conn: &PgPool) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
    let mut tx = conn.begin().await?;

    query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY;")
        .execute(&mut *tx)
        .await?;

    Ok(tx)
}

pub fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

pub async fn add_poll(conn: &PgPool, poll: &NewPoll) -> Result<Poll, sqlx::Error> {
    let mut tx = conn.begin().await?;

    let r = query(
        "INSERT INTO poll (time_created, id_created_by, status, title, time_expires)
         VALUES ($1, $2, 'ACTIVE', $3, $4)
         RETURNING id;")
        .bind(poll.time_created)
        .bind(&poll.id_created_by)
        .bind(&poll.title)
        .bind(poll.time_expires)
        .fetch_one(&mut *tx)
        .await?;
    let id: i64 = r.try_get("id")?;

    let mut opt_result = Vec::new();

    for (position, option) in poll.options.iter().enumerate() {
        let option_r = query(
            "INSERT INTO poll_option (id_poll, position, option)
             VALUES ($1, $2, $3)
             RETURNING id;")
            .bind(id)
            .bind(position as i32)
            .bind(option)
            .fetch_one(&mut *tx)
            .await?;

        opt_result.push(PollOption {
            id_poll: id,
            id: option_r.try_get("id")?,
            option: option.to_owned(),
            vote_count: 0,
        });
    }

    tx.commit().await?;

    Ok(Poll {
        id,
        time_created: poll.time_created,
        id_created_by: poll.id_created_by.clone(),
        status: PollStatus::Active,
        title: poll.title.clone(),
        time_expires: poll.time_expires,
        options: opt_result,
    })
}

pub async fn get_poll(conn: &PgPool, id_poll: i64) -> Result<Option<Poll>, sqlx::Error> {
    let mut tx = snapshot(conn).await?;

    let r = query(&format!("SELECT {} FROM poll p WHERE p.id=$1;", POLL_COLUMNS))
        .bind(id_poll)
        .fetch_optional(&mut *tx)
        .await?;

    let poll = match r {
        None => None,
        Some(v) => with_options(&mut *tx, vec![poll_from_row(&v)?]).await?.pop(),
    };

    tx.commit().await?;

    Ok(poll)
}

pub async fn list_active_expired_before(conn: &PgPool, time: DateTime<Utc>) -> Result<Vec<Poll>, sqlx::Error> {
    let mut tx = snapshot(conn).await?;

    let polls = query(&format!(
        "SELECT {} FROM poll p WHERE p.status='ACTIVE' AND p.time_expires < $1 ORDER BY p.id;",
        POLL_COLUMNS))
        .bind(time)
        .try_map(|r: PgRow| poll_from_row(&r))
        .fetch_all(&mut *tx)
        .await?;

    let polls = with_options(&mut *tx, polls).await?;
    tx.commit().await?;

    Ok(polls)
}

pub async fn search_polls(conn: &PgPool, title: Option<&str>, page: u32, page_size: u32) -> Result<Page<Poll>, sqlx::Error> {
    let pattern = title
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| format!("%{}%", escape_like(v)));

    let mut tx = snapshot(conn).await?;

    let total = query("SELECT COUNT(*) AS total FROM poll WHERE ($1::TEXT IS NULL OR title ILIKE $1);")
        .bind(pattern.clone())
        .fetch_one(&mut *tx)
        .await?;
    let total: i64 = total.try_get("total")?;

    let offset = i64::try_from(Page::<Poll>::offset(page, page_size)).unwrap_or(i64::MAX);

    let polls = query(&format!(
        "SELECT {} FROM poll p WHERE ($1::TEXT IS NULL OR p.title ILIKE $1) ORDER BY p.id DESC LIMIT $2 OFFSET $3;",
        POLL_COLUMNS))
        .bind(pattern)
        .bind(page_size as i64)
        .bind(offset)
        .try_map(|r: PgRow| poll_from_row(&r))
        .fetch_all(&mut *tx)
        .await?;

    let items = with_options(&mut *tx, polls).await?;
    tx.commit().await?;

    Ok(Page {
        items,
        page,
        page_size,
        total: total.max(0) as u64,
    })
}

pub async fn list_polls_created_by(conn: &PgPool, id_created_by: &str) -> Result<Vec<Poll>, sqlx::Error> {
    let mut tx = snapshot(conn).await?;

    let polls = query(&format!("SELECT {} FROM poll p WHERE p.id_created_by=$1 ORDER BY p.id DESC;", POLL_COLUMNS))
        .bind(id_created_by)
        .try_map(|r: PgRow| poll_from_row(&r))
        .fetch_all(&mut *tx)
        .await?;

    let polls = with_options(&mut *tx, polls).await?;
    tx.commit().await?;

    Ok(polls)
}

pub async fn list_votes_by(conn: &PgPool, id_voter: &str) -> Result<Vec<VotedPoll>, sqlx::Error> {
    let mut tx = snapshot(conn).await?;

    let rows = query(&format!(
        "SELECT v.id AS id_vote, v.id_option, o.option AS option_text, {}
         FROM vote v
         JOIN poll p ON p.id = v.id_poll
         JOIN poll_option o ON o.id = v.id_option
         WHERE v.id_voter=$1
         ORDER BY v.id DESC;",
        POLL_COLUMNS))
        .bind(id_voter)
        .try_map(|r: PgRow| {
            let id_vote: i64 = r.try_get("id_vote")?;
            let id_option: i64 = r.try_get("id_option")?;
            let option: String = r.try_get("option_text")?;
            Ok((id_vote, id_option, option, poll_from_row(&r)?))
        })
        .fetch_all(&mut *tx)
        .await?;

    let polls = with_options(&mut *tx, rows.iter().map(|v| v.3.clone()).collect()).await?;
    tx.commit().await?;

    Ok(rows.into_iter()
        .zip(polls)
        .map(|((id_vote, id_option, option, _), poll)| VotedPoll { id_vote, poll, id_option, option })
        .collect())
}

pub async fn lock_poll(conn: &mut PgConnection, id_poll: i64, mode: LockMode) -> Result<Option<Poll>, sqlx::Error> {
    let lock = match mode {
        LockMode::Shared => "FOR SHARE",
        LockMode::Exclusive => "FOR UPDATE",
    };

    let r = query(&format!("SELECT {} FROM poll p WHERE p.id=$1 {};", POLL_COLUMNS, lock))
        .bind(id_poll)
        .fetch_optional(&mut *conn)
        .await?;

    let mut poll = match r {
        None => return Ok(None),
        Some(v) => poll_from_row(&v)?,
    };

    poll.options = fetch_options(&mut *conn, vec![id_poll]).await?;

    Ok(Some(poll))
}

pub async fn check_voter_has_vote(conn: &mut PgConnection, id_poll: i64, id_voter: &str) -> Result<bool, sqlx::Error> {
    let r = query("SELECT EXISTS(SELECT 1 FROM vote WHERE id_poll=$1 AND id_voter=$2) AS known;")
        .bind(id_poll)
        .bind(id_voter)
        .fetch_one(conn)
        .await?;

    r.try_get("known")
}

pub async fn get_option_poll(conn: &mut PgConnection, id_option: i64) -> Result<Option<i64>, sqlx::Error> {
    let r = query("SELECT id_poll FROM poll_option WHERE id=$1;")
        .bind(id_option)
        .fetch_optional(conn)
        .await?;

    match r {
        None => Ok(None),
        Some(v) => Ok(Some(v.try_get("id_poll")?)),
    }
}

/// Returns `None` when the (poll, voter) unique index already holds a vote.
pub async fn add_vote(
    conn: &mut PgConnection,
    id_poll: i64,
    id_voter: &str,
    id_option: i64,
    time: DateTime<Utc>,
) -> Result<Option<Vote>, sqlx::Error> {
    let r = query(
        "INSERT INTO vote (time_created, id_poll, id_voter, id_option)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (id_poll, id_voter) DO NOTHING
         RETURNING id;")
        .bind(time)
        .bind(id_poll)
        .bind(id_voter)
        .bind(id_option)
        .fetch_optional(conn)
        .await?;

    match r {
        None => Ok(None),
        Some(v) => Ok(Some(Vote {
            id: v.try_get("id")?,
            time_created: time,
            id_poll,
            id_voter: id_voter.to_owned(),
            id_option,
        })),
    }
}

pub async fn increment_option_tally(conn: &mut PgConnection, id_poll: i64, id_option: i64) -> Result<Option<i64>, sqlx::Error> {
    let r = query("UPDATE poll_option SET vote_count = vote_count + 1 WHERE id=$1 AND id_poll=$2 RETURNING vote_count;")
        .bind(id_option)
        .bind(id_poll)
        .fetch_optional(conn)
        .await?;

    match r {
        None => Ok(None),
        Some(v) => Ok(Some(v.try_get("vote_count")?)),
    }
}

pub async fn get_poll_status(conn: &mut PgConnection, id_poll: i64) -> Result<Option<PollStatus>, sqlx::Error> {
    let r = query("SELECT status FROM poll WHERE id=$1;")
        .bind(id_poll)
        .fetch_optional(conn)
        .await?;

    match r {
        None => Ok(None),
        Some(v) => {
            let status: String = v.try_get("status")?;
            Ok(PollStatus::parse(&status))
        }
    }
}

pub async fn close_poll(conn: &mut PgConnection, id_poll: i64) -> Result<bool, sqlx::Error> {
    let r = query("UPDATE poll SET status='CLOSED' WHERE id=$1 AND status='ACTIVE';")
        .bind(id_poll)
        .execute(conn)
        .await?;

    Ok(r.rows_affected() > 0)
}

/// Options and votes go with the poll through `ON DELETE CASCADE`.
pub async fn delete_poll(conn: &mut PgConnection, id_poll: i64) -> Result<bool, sqlx::Error> {
    let r = query("DELETE FROM poll WHERE id=$1;")
        .bind(id_poll)
        .execute(conn)
        .await?;

    Ok(r.rows_affected() > 0)
}
