use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Which delivery strategy a [`Queue`](crate::Queue) is built with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Strategy {
    /// Append-only log with consumer groups, acknowledgment and redelivery.
    #[default]
    Stream,
    /// Head-push list consumed by peek-then-pop. One consumer per topic.
    List,
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stream" | "group" => Ok(Self::Stream),
            "list" | "poll" => Ok(Self::List),
            other => Err(Error::Config(format!("unknown strategy {other:?}"))),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => f.write_str("stream"),
            Self::List => f.write_str("list"),
        }
    }
}

/// Length bound applied to a topic on every append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trim {
    pub max_len: usize,
    /// Let the store keep slightly more than `max_len` entries in exchange
    /// for cheaper appends.
    pub approx: bool,
}

/// Construction-time configuration for a queue.
#[derive(Clone)]
pub struct Config {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: i64,
    /// Pre-built client; overrides `host`/`port` when set.
    #[cfg(feature = "redis")]
    pub client: Option<redis::Client>,
    /// Maximum topic length kept on append. `None` never trims.
    pub max_len: Option<usize>,
    pub approx: bool,
    pub strategy: Strategy,
    /// Backoff between empty list peeks, and between idle group iterations
    /// when reads do not block.
    pub poll_interval: Duration,
    /// How long a group read waits for new entries. `None` returns immediately.
    pub block: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            username: None,
            password: None,
            db: 0,
            #[cfg(feature = "redis")]
            client: None,
            max_len: None,
            approx: false,
            strategy: Strategy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            block: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Config");
        out.field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db);
        #[cfg(feature = "redis")]
        out.field("client", &self.client.is_some());
        out.field("max_len", &self.max_len)
            .field("approx", &self.approx)
            .field("strategy", &self.strategy)
            .field("poll_interval", &self.poll_interval)
            .field("block", &self.block)
            .finish()
    }
}

impl Config {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            ..Self::default()
        }
    }

    /// Reads connection and trim settings from the environment.
    ///
    /// `REDIS_HOST`, `REDIS_PORT`, `REDIS_USERNAME`, `REDIS_PASSWORD`,
    /// `REDIS_DB`, `MQ_MAX_LEN`, `MQ_APPROX`, `MQ_STRATEGY`. Unset variables
    /// keep their defaults; malformed ones are an error.
    pub fn from_env() -> Result<Self> {
        let mut config = Self {
            host: var("REDIS_HOST"),
            username: var("REDIS_USERNAME"),
            password: var("REDIS_PASSWORD"),
            ..Self::default()
        };
        if let Some(port) = parsed_var("REDIS_PORT")? {
            config.port = port;
        }
        if let Some(db) = parsed_var("REDIS_DB")? {
            config.db = db;
        }
        config.max_len = parsed_var("MQ_MAX_LEN")?;
        if let Some(approx) = parsed_var("MQ_APPROX")? {
            config.approx = approx;
        }
        if let Some(strategy) = var("MQ_STRATEGY") {
            config.strategy = strategy.parse()?;
        }
        Ok(config)
    }

    /// Fails when there is nothing to connect to.
    pub fn validate(&self) -> Result<()> {
        #[cfg(feature = "redis")]
        if self.client.is_some() {
            return Ok(());
        }
        match self.host.as_deref() {
            Some(host) if !host.is_empty() => Ok(()),
            _ => Err(Error::Config("store host is empty and no client was supplied".into())),
        }
    }

    pub fn trim(&self) -> Option<Trim> {
        self.max_len
            .filter(|max_len| *max_len > 0)
            .map(|max_len| Trim {
                max_len,
                approx: self.approx,
            })
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn parsed_var<T: FromStr>(key: &str) -> Result<Option<T>> {
    match var(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key}={raw:?} is not valid"))),
        None => Ok(None),
    }
}
