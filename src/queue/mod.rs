//! Queue engine: one `send`/`consume` contract, two delivery strategies.
//!
//! # Strategies
//!
//! ## Consumer groups ([`GroupQueue`])
//!
//! Messages are appended to a log. Each group keeps a cursor and a pending set;
//! members of a group share the work without duplicate delivery. Every loop
//! iteration runs a *new-message pass* followed by a *redelivery pass* over the
//! consumer's own unacknowledged entries, so a message whose handler failed is
//! retried until it is acknowledged.
//!
//! ## List polling ([`ListQueue`])
//!
//! Messages are pushed onto the head of a list and consumed from the tail by
//! peek, handle, then pop. A failed message stays at the tail and is retried
//! before anything behind it. The peek/pop pair is not atomic, so a topic must
//! have a single consumer.
//!
//! | Strategy | Redelivery | Consumers per topic | Message id |
//! |----------|------------|---------------------|------------|
//! | `Stream` | pending set, optional idle claiming | many (per group) | yes |
//! | `List` | head-of-queue retry | one | no |
//!
//! # Errors
//!
//! Handler errors only skip acknowledgment. Store errors and cancellation end
//! `consume` and are returned unchanged.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Strategy};
use crate::handler::Handler;
use crate::message::Message;
use crate::store::{LogStore, StartPosition};
use crate::{Error, Result};

pub mod group;
pub mod list;

pub use group::GroupQueue;
pub use list::ListQueue;

pub const DEFAULT_GROUP: &str = "default";
pub const DEFAULT_CONSUMER: &str = "default";

/// What a `consume` call reads and as whom.
///
/// The list strategy only looks at `topic`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub group: String,
    /// Identity of this worker within `group`.
    pub consumer: String,
    /// Used only when the group does not exist yet.
    pub start: StartPosition,
    /// Upper bound on entries fetched per pass. Must be at least 1.
    pub batch_size: usize,
    /// Take over other members' pending entries once they have been idle
    /// this long. `None` leaves them with their owner.
    pub claim_idle: Option<Duration>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group: DEFAULT_GROUP.to_string(),
            consumer: DEFAULT_CONSUMER.to_string(),
            start: StartPosition::default(),
            batch_size: 1,
            claim_idle: None,
        }
    }

    pub fn for_group(
        topic: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            consumer: consumer.into(),
            ..Self::new(topic)
        }
    }
}

/// Producer/consumer contract shared by both strategies.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Appends or pushes `msg`'s body to `msg`'s topic.
    async fn send(&self, ctx: &CancellationToken, msg: &Message) -> Result<()>;

    /// Runs the consume loop until a store error or cancellation.
    ///
    /// Never returns `Ok`: the loop only ends by failing.
    async fn consume<H: Handler>(
        &self,
        ctx: &CancellationToken,
        subscription: &Subscription,
        handler: H,
    ) -> Result<()>;
}

/// A queue whose strategy was picked at construction time.
pub enum Queue {
    Group(GroupQueue),
    List(ListQueue),
}

impl Queue {
    /// Builds a queue of `config.strategy` over an existing store.
    pub fn with_store(store: Arc<dyn LogStore>, config: &Config) -> Self {
        match config.strategy {
            Strategy::Stream => Self::Group(GroupQueue::new(store, config)),
            Strategy::List => Self::List(ListQueue::new(store, config)),
        }
    }

    /// Connects to Redis and builds a queue of `config.strategy`.
    ///
    /// Fails with [`Error::Config`] when `config` has neither a host nor a client.
    #[cfg(feature = "redis")]
    pub async fn connect(config: &Config) -> Result<Self> {
        let store = crate::store::RedisStore::connect(config).await?;
        Ok(Self::with_store(Arc::new(store), config))
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            Self::Group(_) => Strategy::Stream,
            Self::List(_) => Strategy::List,
        }
    }
}

#[async_trait]
impl MessageQueue for Queue {
    async fn send(&self, ctx: &CancellationToken, msg: &Message) -> Result<()> {
        match self {
            Self::Group(queue) => queue.send(ctx, msg).await,
            Self::List(queue) => queue.send(ctx, msg).await,
        }
    }

    async fn consume<H: Handler>(
        &self,
        ctx: &CancellationToken,
        subscription: &Subscription,
        handler: H,
    ) -> Result<()> {
        match self {
            Self::Group(queue) => queue.consume(ctx, subscription, handler).await,
            Self::List(queue) => queue.consume(ctx, subscription, handler).await,
        }
    }
}

/// Runs a store call unless `ctx` is cancelled first.
pub(crate) async fn cancellable<T, F>(ctx: &CancellationToken, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(Error::Cancelled),
        result = call => result,
    }
}

/// Sleeps for `interval`, returning early with [`Error::Cancelled`].
pub(crate) async fn pause(ctx: &CancellationToken, interval: Duration) -> Result<()> {
    cancellable(ctx, async {
        tokio::time::sleep(interval).await;
        Ok(())
    })
    .await
}
