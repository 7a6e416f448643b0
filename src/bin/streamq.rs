use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use tokio_util::sync::CancellationToken;

use streamq::{Config, Message, MessageQueue, Queue, StartPosition, Strategy, Subscription};

#[derive(Parser, Debug)]
#[command(name = "streamq")]
#[command(about = "Send to or consume from a Redis-backed message queue")]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Command,
}

/// Overrides for the settings `Config::from_env` reads (`REDIS_*`, `MQ_*`).
#[derive(Args, Debug)]
struct StoreArgs {
    /// Redis host [env: REDIS_HOST]
    #[arg(long, global = true)]
    redis_host: Option<String>,

    /// [env: REDIS_PORT, default: 6379]
    #[arg(long, global = true)]
    redis_port: Option<u16>,

    #[arg(long, global = true)]
    redis_username: Option<String>,

    #[arg(long, global = true)]
    redis_password: Option<String>,

    /// Logical database index [env: REDIS_DB]
    #[arg(long, global = true)]
    redis_db: Option<i64>,

    /// Delivery strategy: stream (consumer groups) or list (polling) [env: MQ_STRATEGY]
    #[arg(long, global = true)]
    strategy: Option<Strategy>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one message to a topic
    Send {
        #[arg(long, env = "TOPIC", default_value = "default")]
        topic: String,

        #[arg(long, env = "MESSAGE")]
        message: String,

        /// Keep at most this many entries in the topic (stream strategy) [env: MQ_MAX_LEN]
        #[arg(long)]
        max_len: Option<usize>,

        /// Trim approximately; cheaper, may keep a few extra entries [env: MQ_APPROX]
        #[arg(long)]
        approx: bool,
    },
    /// Consume a topic until interrupted, logging every message
    Consume {
        #[arg(long, env = "TOPIC", default_value = "default")]
        topic: String,

        #[arg(long, env = "GROUP", default_value = "default")]
        group: String,

        /// Consumer name within the group
        #[arg(long, env = "CONSUMER", default_value = "default")]
        consumer: String,

        /// Where a new group starts: 0 (origin), $ (tail) or an entry id
        #[arg(long, env = "START", default_value = "$")]
        start: StartPosition,

        #[arg(long, env = "BATCH_SIZE", default_value_t = 1)]
        batch_size: usize,

        /// Milliseconds a group read waits for new entries (0 = do not wait)
        #[arg(long, env = "BLOCK_MS", default_value_t = 0)]
        block_ms: u64,

        /// Claim other consumers' entries idle for this many milliseconds
        #[arg(long, env = "CLAIM_IDLE_MS")]
        claim_idle_ms: Option<u64>,

        /// Milliseconds between polls of an empty topic
        #[arg(long, env = "POLL_MS", default_value_t = 1000)]
        poll_ms: u64,
    },
}

impl StoreArgs {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.redis_host {
            config.host = Some(host);
        }
        if let Some(port) = self.redis_port {
            config.port = port;
        }
        if let Some(username) = self.redis_username {
            config.username = Some(username);
        }
        if let Some(password) = self.redis_password {
            config.password = Some(password);
        }
        if let Some(db) = self.redis_db {
            config.db = db;
        }
        if let Some(strategy) = self.strategy {
            config.strategy = strategy;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let mut config = Config::from_env().context("Invalid store settings in the environment")?;
    cli.store.apply(&mut config);

    let ctx = CancellationToken::new();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    match cli.command {
        Command::Send {
            topic,
            message,
            max_len,
            approx,
        } => {
            if max_len.is_some() {
                config.max_len = max_len;
            }
            config.approx |= approx;
            let queue = Queue::connect(&config)
                .await
                .context("Failed to connect to the store")?;
            queue
                .send(&ctx, &Message::new(topic.as_str(), message))
                .await
                .with_context(|| format!("Failed to send to {topic}"))?;
            info!("sent message to {topic}");
        }
        Command::Consume {
            topic,
            group,
            consumer,
            start,
            batch_size,
            block_ms,
            claim_idle_ms,
            poll_ms,
        } => {
            config.block = Some(Duration::from_millis(block_ms)).filter(|block| !block.is_zero());
            config.poll_interval = Duration::from_millis(poll_ms);
            let queue = Queue::connect(&config)
                .await
                .context("Failed to connect to the store")?;
            let sub = Subscription {
                start,
                batch_size,
                claim_idle: claim_idle_ms.map(Duration::from_millis),
                ..Subscription::for_group(topic.as_str(), group, consumer)
            };
            let result = queue
                .consume(&ctx, &sub, |msg: &Message| -> anyhow::Result<()> {
                    info!("consume message: {}", String::from_utf8_lossy(msg.body()));
                    Ok(())
                })
                .await;
            match result {
                Err(streamq::Error::Cancelled) => info!("stopped consuming {topic}"),
                other => other.with_context(|| format!("Consuming {topic} failed"))?,
            }
        }
    }
    Ok(())
}
