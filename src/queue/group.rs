use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Trim};
use crate::handler::Handler;
use crate::message::{EntryId, Message};
use crate::queue::{cancellable, pause, MessageQueue, Subscription};
use crate::store::{LogStore, ReadCursor};
use crate::{Error, Result};

/// Consumer-group strategy: log append, group reads, acknowledgment.
///
/// At-least-once: an entry leaves the group's pending set only when its
/// handler succeeded and the acknowledgment reached the store. Until then it
/// is handed back on every redelivery pass of the consumer that owns it.
pub struct GroupQueue {
    store: Arc<dyn LogStore>,
    trim: Option<Trim>,
    block: Option<Duration>,
    poll_interval: Duration,
}

impl GroupQueue {
    pub fn new(store: Arc<dyn LogStore>, config: &Config) -> Self {
        Self {
            store,
            trim: config.trim(),
            block: config.block.filter(|block| !block.is_zero()),
            poll_interval: config.poll_interval,
        }
    }

    /// Appends `msg` and returns the id the store assigned to it.
    pub async fn publish(&self, ctx: &CancellationToken, msg: &Message) -> Result<EntryId> {
        cancellable(ctx, self.store.append(msg.topic(), msg.body(), self.trim)).await
    }

    /// Fetches one batch at `cursor` and dispatches it. Returns the batch size.
    async fn pass<H: Handler>(
        &self,
        ctx: &CancellationToken,
        sub: &Subscription,
        cursor: ReadCursor,
        handler: &mut H,
    ) -> Result<usize> {
        let block = match cursor {
            ReadCursor::New => self.block,
            ReadCursor::Pending => None,
        };
        let batch = cancellable(
            ctx,
            self.store.read_group(
                &sub.topic,
                &sub.group,
                &sub.consumer,
                cursor,
                sub.batch_size,
                block,
            ),
        )
        .await?;
        let fetched = batch.len();
        if fetched > 0 {
            debug!(
                "{}/{}: fetched {fetched} entries at cursor {}",
                sub.topic,
                sub.consumer,
                cursor.as_store_id()
            );
        }

        for entry in batch {
            let Some(body) = entry.body else {
                // The payload was trimmed while the entry was pending; it can
                // never be handled, only released.
                warn!("{}: entry {} was trimmed before it was acknowledged", sub.topic, entry.id);
                self.store.ack(&sub.topic, &sub.group, entry.id).await?;
                continue;
            };
            let msg = Message::from_group(entry.id, &sub.topic, body, &sub.group, &sub.consumer);
            match handler.handle(&msg) {
                Ok(()) => {
                    self.store.ack(&sub.topic, &sub.group, entry.id).await?;
                    debug!("{}: acked {}", sub.topic, entry.id);
                }
                Err(err) => {
                    warn!(
                        "{}: handler failed for {} ({err:#}); left pending for redelivery",
                        sub.topic, entry.id
                    );
                }
            }
        }
        Ok(fetched)
    }
}

#[async_trait]
impl MessageQueue for GroupQueue {
    async fn send(&self, ctx: &CancellationToken, msg: &Message) -> Result<()> {
        self.publish(ctx, msg).await.map(|_| ())
    }

    async fn consume<H: Handler>(
        &self,
        ctx: &CancellationToken,
        sub: &Subscription,
        mut handler: H,
    ) -> Result<()> {
        if sub.batch_size == 0 {
            return Err(Error::Config("batch size must be at least 1".into()));
        }
        cancellable(
            ctx,
            self.store.ensure_group(&sub.topic, &sub.group, sub.start),
        )
        .await?;
        info!(
            "consuming {} as {} in group {} (batch {})",
            sub.topic, sub.consumer, sub.group, sub.batch_size
        );

        loop {
            let fresh = self.pass(ctx, sub, ReadCursor::New, &mut handler).await?;

            if let Some(min_idle) = sub.claim_idle {
                let claimed = cancellable(
                    ctx,
                    self.store.claim_idle(
                        &sub.topic,
                        &sub.group,
                        &sub.consumer,
                        min_idle,
                        sub.batch_size,
                    ),
                )
                .await?;
                if claimed > 0 {
                    info!("{}: {} claimed {claimed} idle entries", sub.topic, sub.consumer);
                }
            }

            self.pass(ctx, sub, ReadCursor::Pending, &mut handler).await?;

            if fresh == 0 && self.block.is_none() {
                pause(ctx, self.poll_interval).await?;
            }
        }
    }
}
