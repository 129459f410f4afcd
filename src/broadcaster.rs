//! Live tally feed, one channel per poll.
//!
//! Best effort: no backlog for late subscribers, publishing never blocks, and a
//! subscriber that falls behind skips ahead instead of slowing the publisher.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use dashmap::DashMap;
use evlog::meta;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;

use crate::runtime::get_logger;

/// A new tally for one option.
///
/// Per option, `vote_count` only ever grows on a channel: an update that arrives
/// after a higher count was already published for the same option is dropped, so
/// the last value a subscriber sees is the latest committed tally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TallyUpdate {
    pub id_poll: i64,
    pub id_option: i64,
    pub vote_count: i64,
}

struct Channel {
    tx: broadcast::Sender<TallyUpdate>,
    // Highest count published per option.
    latest: HashMap<i64, i64>,
}

type Channels = Arc<DashMap<i64, Channel>>;

pub struct Broadcaster {
    channels: Channels,
    capacity: usize,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, id_poll: i64) -> Subscription {
        let rx = self.channels
            .entry(id_poll)
            .or_insert_with(|| Channel {
                tx: broadcast::channel(self.capacity).0,
                latest: HashMap::new(),
            })
            .tx
            .subscribe();

        Subscription {
            id_poll,
            rx,
            release: Release {
                id_poll,
                channels: self.channels.clone(),
            },
        }
    }

    /// Returns how many subscribers the update was handed to.
    pub fn publish(&self, id_poll: i64, id_option: i64, vote_count: i64) -> usize {
        let update = TallyUpdate {
            id_poll,
            id_option,
            vote_count,
        };

        // Holding the entry serializes publishers of one poll. The guard must be
        // released before `remove_if` touches the same shard.
        let sent = match self.channels.get_mut(&id_poll) {
            None => None,
            Some(mut channel) => {
                let latest = channel.latest.entry(id_option).or_insert(0);
                if vote_count <= *latest {
                    get_logger().debug("Dropped stale tally update.", meta![
                        "PollID" => id_poll,
                        "OptionID" => id_option,
                        "VoteCount" => vote_count,
                    ]);
                    return 0;
                }
                *latest = vote_count;

                Some(channel.tx.send(update))
            }
        };

        match sent {
            None => 0,
            Some(Ok(n)) => {
                get_logger().debug("Published tally update.", meta![
                    "PollID" => id_poll,
                    "OptionID" => id_option,
                    "VoteCount" => vote_count,
                    "Subscribers" => n,
                ]);
                n
            }
            Some(Err(_)) => {
                // Everyone left; drop the channel unless someone rejoined meanwhile.
                self.channels.remove_if(&id_poll, |_, channel| channel.tx.receiver_count() == 0);
                0
            }
        }
    }

    /// Ends every subscription to the poll once pending updates are drained.
    pub fn close(&self, id_poll: i64) {
        self.channels.remove(&id_poll);
    }

    pub fn subscriber_count(&self, id_poll: i64) -> usize {
        self.channels.get(&id_poll).map(|channel| channel.tx.receiver_count()).unwrap_or(0)
    }

    pub fn has_channel(&self, id_poll: i64) -> bool {
        self.channels.contains_key(&id_poll)
    }
}

/// Drops the poll's channel when the last receiver is gone.
struct Release {
    id_poll: i64,
    channels: Channels,
}

impl Drop for Release {
    fn drop(&mut self) {
        self.channels.remove_if(&self.id_poll, |_, channel| channel.tx.receiver_count() == 0);
    }
}

fn log_lagged(id_poll: i64, skipped: u64) {
    get_logger().warn("Subscriber lagged behind tally updates.", meta![
        "PollID" => id_poll,
        "Skipped" => skipped,
    ]);
}

// Field order matters: the receiver is dropped before `release` checks the count.
pub struct Subscription {
    id_poll: i64,
    rx: broadcast::Receiver<TallyUpdate>,
    release: Release,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id_poll", &self.id_poll).finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn id_poll(&self) -> i64 {
        self.id_poll
    }

    /// Next update, or `None` once the poll's channel is closed.
    pub async fn recv(&mut self) -> Option<TallyUpdate> {
        loop {
            match self.rx.recv().await {
                Ok(v) => return Some(v),
                Err(RecvError::Lagged(skipped)) => log_lagged(self.id_poll, skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> TallyStream {
        TallyStream {
            id_poll: self.id_poll,
            inner: BroadcastStream::new(self.rx),
            _release: self.release,
        }
    }
}

/// [`Subscription`] as a [`Stream`]. Lagged updates are skipped and logged.
pub struct TallyStream {
    id_poll: i64,
    inner: BroadcastStream<TallyUpdate>,
    _release: Release,
}

impl Stream for TallyStream {
    type Item = TallyUpdate;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TallyUpdate>> {
        let this = self.get_mut();

        loop {
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(v)) => return Poll::Ready(Some(v)),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => log_lagged(this.id_poll, skipped),
                None => return Poll::Ready(None),
            }
        }
    }
}
