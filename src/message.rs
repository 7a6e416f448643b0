use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Store-assigned identifier of a stream entry, `<ms>-<seq>`.
///
/// Ids are strictly increasing within a topic, ordered by millisecond part
/// and then by sequence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    /// `0-0`; never assigned to an entry.
    pub const MIN: EntryId = EntryId { ms: 0, seq: 0 };

    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Next id for an append at `now_ms`, given the last id the topic handed out.
    ///
    /// Falls back to bumping the sequence when the clock has not moved past
    /// `last` (same millisecond, or a clock that stepped backwards).
    pub fn next_after(last: EntryId, now_ms: u64) -> Self {
        if now_ms > last.ms {
            Self::new(now_ms, 0)
        } else {
            Self::new(last.ms, last.seq + 1)
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidEntryId(s.to_string());
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, Some(seq)),
            None => (s, None),
        };
        let ms = ms.parse::<u64>().map_err(|_| invalid())?;
        let seq = match seq {
            Some(seq) => seq.parse::<u64>().map_err(|_| invalid())?,
            None => 0,
        };
        Ok(Self { ms, seq })
    }
}

/// The unit exchanged between producers and consumers.
///
/// `topic` and `body` are always present. `id`, `group` and `consumer` are
/// filled in only by the consumer-group strategy. A message is immutable once
/// built; handlers receive it by reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    id: Option<EntryId>,
    topic: String,
    body: Vec<u8>,
    group: Option<String>,
    consumer: Option<String>,
}

impl Message {
    /// A message to be sent.
    pub fn new(topic: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: None,
            topic: topic.into(),
            body: body.into(),
            group: None,
            consumer: None,
        }
    }

    pub(crate) fn from_group(
        id: EntryId,
        topic: &str,
        body: Vec<u8>,
        group: &str,
        consumer: &str,
    ) -> Self {
        Self {
            id: Some(id),
            topic: topic.to_string(),
            body,
            group: Some(group.to_string()),
            consumer: Some(consumer.to_string()),
        }
    }

    pub fn id(&self) -> Option<EntryId> {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Group member that fetched this message.
    pub fn consumer(&self) -> Option<&str> {
        self.consumer.as_deref()
    }
}
