//! Minimal message queue on top of a remote ordered-log store.
//!
//! Producers call [`MessageQueue::send`]; consumers call
//! [`MessageQueue::consume`] with a [`Handler`] and keep running until the
//! store fails or the [`CancellationToken`](tokio_util::sync::CancellationToken)
//! they passed in is cancelled. Durability, ordering and pending-entry
//! bookkeeping are the store's job ([`store::LogStore`]).
//!
//! ```no_run
//! use streamq::{Config, Message, MessageQueue, Queue, Subscription};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> streamq::Result<()> {
//! let queue = Queue::connect(&Config::new("127.0.0.1")).await?;
//! let ctx = CancellationToken::new();
//!
//! queue.send(&ctx, &Message::new("orders", "A")).await?;
//!
//! let sub = Subscription::for_group("orders", "billing", "worker-1");
//! queue
//!     .consume(&ctx, &sub, |msg: &Message| -> anyhow::Result<()> {
//!         println!("{}", String::from_utf8_lossy(msg.body()));
//!         Ok(())
//!     })
//!     .await
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod queue;
pub mod store;

pub use config::{Config, Strategy, Trim};
pub use error::{Error, Result};
pub use handler::Handler;
pub use message::{EntryId, Message};
pub use queue::{GroupQueue, ListQueue, MessageQueue, Queue, Subscription};
pub use store::{Entry, LogStore, MemoryStore, ReadCursor, StartPosition};
#[cfg(feature = "redis")]
pub use store::RedisStore;
