//! [`LogStore`] over Redis streams and lists.
//!
//! Group strategy: `XADD`, `XGROUP CREATE .. MKSTREAM`, `XREADGROUP`, `XACK`,
//! `XAUTOCLAIM .. JUSTID`. Polling strategy: `LPUSH`, `LINDEX -1`, `RPOP`.
//!
//! Commands go through a [`ConnectionManager`], which multiplexes one
//! connection and reconnects on its own. A blocking `XREADGROUP` holds that
//! connection for its duration, so consumers that block should get a store of
//! their own rather than share one with producers.

use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamMaxlen, StreamPendingReply,
    StreamReadOptions, StreamReadReply,
};
use ::redis::{AsyncCommands, Client, IntoConnectionInfo};
use async_trait::async_trait;
use log::debug;

use crate::config::{Config, Trim};
use crate::message::EntryId;
use crate::store::{Entry, LogStore, ReadCursor, StartPosition, BODY_FIELD};
use crate::{Error, Result};

const BUSY_GROUP: &str = "BUSYGROUP";
const NO_GROUP: &str = "NOGROUP";
const WRONG_TYPE: &str = "WRONGTYPE";

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connects using `config`'s pre-built client, or its host and credentials.
    pub async fn connect(config: &Config) -> Result<Self> {
        config.validate()?;
        let client = match &config.client {
            Some(client) => client.clone(),
            None => Client::open(connection_info(config)?)?,
        };
        Self::from_client(client).await
    }

    pub async fn from_client(client: Client) -> Result<Self> {
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn connection_info(config: &Config) -> Result<::redis::ConnectionInfo> {
    let host = config.host.clone().unwrap_or_default();
    let mut info = (host, config.port).into_connection_info()?;
    info.redis.db = config.db;
    info.redis.username = config.username.clone();
    info.redis.password = config.password.clone();
    Ok(info)
}

fn map_error(err: ::redis::RedisError, topic: &str, group: &str) -> Error {
    match err.code() {
        Some(NO_GROUP) => Error::NoGroup {
            topic: topic.to_string(),
            group: group.to_string(),
        },
        Some(WRONG_TYPE) => Error::WrongType(topic.to_string()),
        _ => Error::Redis(err),
    }
}

fn map_key_error(err: ::redis::RedisError, topic: &str) -> Error {
    match err.code() {
        Some(WRONG_TYPE) => Error::WrongType(topic.to_string()),
        _ => Error::Redis(err),
    }
}

#[async_trait]
impl LogStore for RedisStore {
    async fn append(&self, topic: &str, body: &[u8], trim: Option<Trim>) -> Result<EntryId> {
        let mut conn = self.conn();
        let fields = [(BODY_FIELD, body)];
        let appended: ::redis::RedisResult<String> = match trim {
            Some(trim) => {
                let maxlen = if trim.approx {
                    StreamMaxlen::Approx(trim.max_len)
                } else {
                    StreamMaxlen::Equals(trim.max_len)
                };
                conn.xadd_maxlen(topic, maxlen, "*", &fields).await
            }
            None => conn.xadd(topic, "*", &fields).await,
        };
        appended.map_err(|err| map_key_error(err, topic))?.parse()
    }

    async fn ensure_group(&self, topic: &str, group: &str, start: StartPosition) -> Result<()> {
        let mut conn = self.conn();
        let created: ::redis::RedisResult<()> = conn
            .xgroup_create_mkstream(topic, group, start.as_store_id())
            .await;
        match created {
            Ok(()) => {
                debug!("created group {group} on {topic} at {}", start.as_store_id());
                Ok(())
            }
            Err(err) if err.code() == Some(BUSY_GROUP) => Ok(()),
            Err(err) => Err(map_key_error(err, topic)),
        }
    }

    async fn read_group(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<Entry>> {
        let mut conn = self.conn();
        let mut options = StreamReadOptions::default().group(group, consumer).count(count);
        if cursor == ReadCursor::New {
            // BLOCK 0 waits forever; a zero duration means "do not wait".
            if let Some(block) = block.filter(|block| !block.is_zero()) {
                let ms = usize::try_from(block.as_millis()).unwrap_or(usize::MAX);
                options = options.block(ms.max(1));
            }
        }
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[topic], &[cursor.as_store_id()], &options)
            .await
            .map_err(|err| map_error(err, topic, group))?;

        let mut batch = Vec::new();
        for key in reply.map(|reply| reply.keys).unwrap_or_default() {
            for entry in key.ids {
                batch.push(Entry {
                    id: entry.id.parse()?,
                    body: entry.get::<Vec<u8>>(BODY_FIELD),
                });
            }
        }
        Ok(batch)
    }

    async fn ack(&self, topic: &str, group: &str, id: EntryId) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn
            .xack(topic, group, &[id.to_string()])
            .await
            .map_err(|err| map_error(err, topic, group))?;
        Ok(())
    }

    async fn claim_idle(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<usize> {
        let mut conn = self.conn();
        let min_idle_ms = u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX);
        let options = StreamAutoClaimOptions::default().count(count).with_justid();
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(topic, group, consumer, min_idle_ms, "0-0", options)
            .await
            .map_err(|err| map_error(err, topic, group))?;
        Ok(reply.claimed.len())
    }

    async fn pending_count(&self, topic: &str, group: &str) -> Result<usize> {
        let mut conn = self.conn();
        let reply: StreamPendingReply = conn
            .xpending(topic, group)
            .await
            .map_err(|err| map_error(err, topic, group))?;
        Ok(reply.count())
    }

    async fn stream_len(&self, topic: &str) -> Result<usize> {
        let mut conn = self.conn();
        conn.xlen(topic).await.map_err(|err| map_key_error(err, topic))
    }

    async fn push_left(&self, topic: &str, body: &[u8]) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn
            .lpush(topic, body)
            .await
            .map_err(|err| map_key_error(err, topic))?;
        Ok(())
    }

    async fn peek_last(&self, topic: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn();
        conn.lindex(topic, -1)
            .await
            .map_err(|err| map_key_error(err, topic))
    }

    async fn pop_right(&self, topic: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: Option<Vec<u8>> = conn
            .rpop(topic, None)
            .await
            .map_err(|err| map_key_error(err, topic))?;
        Ok(())
    }

    async fn list_len(&self, topic: &str) -> Result<usize> {
        let mut conn = self.conn();
        conn.llen(topic).await.map_err(|err| map_key_error(err, topic))
    }
}
