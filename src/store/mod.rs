//! The ordered-log store the queue engine runs on.
//!
//! [`LogStore`] is the full contract the engine consumes: stream operations
//! with consumer groups for the group strategy, and list operations for the
//! polling strategy. Durability, ordering and pending-entry ownership all live
//! behind it; the engine never caches topic contents.
//!
//! Two implementations ship with the crate:
//!
//! | Store | Backing | Use |
//! |-------|---------|-----|
//! | [`MemoryStore`] | in-process maps | tests, embedding, single process |
//! | `RedisStore` | Redis streams and lists | production (feature `redis`) |

use std::time::Duration;

use async_trait::async_trait;

use crate::config::Trim;
use crate::message::EntryId;
use crate::Result;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::{Delivery, MemoryStore};
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Field under which a message body is stored in a stream entry.
pub const BODY_FIELD: &str = "body";

/// One entry returned by a group read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub id: EntryId,
    /// `None` when the entry is still pending but its payload was trimmed.
    pub body: Option<Vec<u8>>,
}

/// Where a new consumer group starts reading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StartPosition {
    /// Replay the topic from its first entry.
    Origin,
    /// Only entries appended after the group is created.
    #[default]
    Tail,
    /// Entries strictly after the given id.
    After(EntryId),
}

impl StartPosition {
    /// The id argument a store's group-create command takes.
    pub fn as_store_id(&self) -> String {
        match self {
            Self::Origin => "0".to_string(),
            Self::Tail => "$".to_string(),
            Self::After(id) => id.to_string(),
        }
    }
}

impl std::str::FromStr for StartPosition {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "0" | "origin" | "earliest" => Ok(Self::Origin),
            "$" | "tail" | "latest" => Ok(Self::Tail),
            other => Ok(Self::After(other.parse()?)),
        }
    }
}

/// Which entries a group read returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries never delivered to any member of the group (`>`).
    New,
    /// Entries already delivered to this consumer and not yet acknowledged,
    /// from the start of its pending set (`0`).
    Pending,
}

impl ReadCursor {
    pub fn as_store_id(&self) -> &'static str {
        match self {
            Self::New => ">",
            Self::Pending => "0",
        }
    }
}

/// Remote ordered-log / list store.
///
/// Implementations are shared between producers and consumers through an
/// `Arc` and must be safe to call concurrently.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Appends `body` to the stream `topic`, trimming it to `trim` if given.
    async fn append(&self, topic: &str, body: &[u8], trim: Option<Trim>) -> Result<EntryId>;

    /// Creates `group` on `topic` at `start`, creating the topic if absent.
    ///
    /// A group that already exists is not an error and is left untouched.
    async fn ensure_group(&self, topic: &str, group: &str, start: StartPosition) -> Result<()>;

    /// Fetches up to `count` entries for `consumer`.
    ///
    /// For [`ReadCursor::New`] the read may wait up to `block` for entries to
    /// arrive; it returns an empty batch when none do. Pending reads never wait.
    async fn read_group(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<Entry>>;

    /// Marks `id` as processed for `group`.
    async fn ack(&self, topic: &str, group: &str, id: EntryId) -> Result<()>;

    /// Moves up to `count` pending entries of any group member, idle for at
    /// least `min_idle`, into `consumer`'s pending set. Returns how many moved.
    async fn claim_idle(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<usize>;

    /// Number of delivered but unacknowledged entries in `group`.
    async fn pending_count(&self, topic: &str, group: &str) -> Result<usize>;

    /// Number of entries currently held by the stream `topic`.
    async fn stream_len(&self, topic: &str) -> Result<usize>;

    /// Pushes `body` onto the head of the list `topic`.
    async fn push_left(&self, topic: &str, body: &[u8]) -> Result<()>;

    /// The tail-most element of the list, without removing it. `None` when
    /// the list is empty or absent.
    async fn peek_last(&self, topic: &str) -> Result<Option<Vec<u8>>>;

    /// Removes the tail-most element of the list, if any.
    async fn pop_right(&self, topic: &str) -> Result<()>;

    async fn list_len(&self, topic: &str) -> Result<usize>;
}
