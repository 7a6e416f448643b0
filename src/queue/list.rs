use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::handler::Handler;
use crate::message::Message;
use crate::queue::{cancellable, pause, MessageQueue, Subscription};
use crate::store::LogStore;
use crate::Result;

/// After the first failure of the tail element, only every Nth retry warns.
const FAILURE_WARN_EVERY: u64 = 1_000;

/// Polling strategy: push to the head of a list, peek and pop at the tail.
///
/// The tail element is removed only after its handler succeeds, so a failing
/// message is retried in place and blocks everything queued behind it.
///
/// Peek and pop are separate store calls. Running two consumers on the same
/// topic can pop an element the other one has not handled; use a single
/// consumer per topic, or the group strategy.
pub struct ListQueue {
    store: Arc<dyn LogStore>,
    poll_interval: Duration,
}

impl ListQueue {
    pub fn new(store: Arc<dyn LogStore>, config: &Config) -> Self {
        Self {
            store,
            poll_interval: config.poll_interval,
        }
    }
}

#[async_trait]
impl MessageQueue for ListQueue {
    async fn send(&self, ctx: &CancellationToken, msg: &Message) -> Result<()> {
        cancellable(ctx, self.store.push_left(msg.topic(), msg.body())).await
    }

    async fn consume<H: Handler>(
        &self,
        ctx: &CancellationToken,
        sub: &Subscription,
        mut handler: H,
    ) -> Result<()> {
        let topic = sub.topic.as_str();
        info!("polling {topic} every {:?} when empty", self.poll_interval);

        let mut failures = 0_u64;
        loop {
            let Some(body) = cancellable(ctx, self.store.peek_last(topic)).await? else {
                pause(ctx, self.poll_interval).await?;
                continue;
            };
            let msg = Message::new(topic, body);
            match handler.handle(&msg) {
                Ok(()) => {
                    self.store.pop_right(topic).await?;
                    failures = 0;
                    debug!("{topic}: removed handled message");
                }
                Err(err) => {
                    failures += 1;
                    if warn_on_failure(failures) {
                        warn!(
                            "{topic}: handler failed {failures} time(s) ({err:#}); \
                             message stays at the tail"
                        );
                    } else {
                        debug!("{topic}: handler failed again ({err:#})");
                    }
                    // Give other tasks a turn before retrying the same element.
                    tokio::task::yield_now().await;
                }
            }
        }
    }
}

fn warn_on_failure(failures: u64) -> bool {
    failures == 1 || failures % FAILURE_WARN_EVERY == 0
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::store::MemoryStore;
    use crate::Error;

    fn queue(store: &Arc<MemoryStore>) -> ListQueue {
        ListQueue::new(Arc::clone(store) as Arc<dyn LogStore>, &Config::default())
    }

    #[tokio::test]
    async fn send_pushes_to_head() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue(&store);
        let ctx = CancellationToken::new();
        queue.send(&ctx, &Message::new("jobs", "A")).await.unwrap();
        queue.send(&ctx, &Message::new("jobs", "B")).await.unwrap();
        assert_eq!(store.list_len("jobs").await.unwrap(), 2);
        assert_eq!(store.peek_last("jobs").await.unwrap().as_deref(), Some(b"A".as_slice()));
    }

    #[tokio::test]
    async fn failing_handler_sees_the_same_element_again() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue(&store);
        let ctx = CancellationToken::new();
        queue.send(&ctx, &Message::new("jobs", "A")).await.unwrap();
        queue.send(&ctx, &Message::new("jobs", "B")).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let stop = ctx.clone();
        let result = queue
            .consume(&ctx, &Subscription::new("jobs"), move |msg: &Message| -> anyhow::Result<()> {
                assert_eq!(msg.body(), b"A");
                if counter.fetch_add(1, Ordering::SeqCst) == 2 {
                    stop.cancel();
                }
                anyhow::bail!("downstream unavailable")
            })
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.list_len("jobs").await.unwrap(), 2);
        assert_eq!(store.peek_last("jobs").await.unwrap().as_deref(), Some(b"A".as_slice()));
    }

    #[test]
    fn repeated_failures_warn_sparingly() {
        let warned: Vec<u64> = (1..=3 * FAILURE_WARN_EVERY)
            .filter(|failures| warn_on_failure(*failures))
            .collect();
        assert_eq!(
            warned,
            vec![1, FAILURE_WARN_EVERY, 2 * FAILURE_WARN_EVERY, 3 * FAILURE_WARN_EVERY]
        );
    }
}
