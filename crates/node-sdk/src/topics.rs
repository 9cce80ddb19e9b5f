//! Topic store: one [`Topic`] per resolved name or wildcard pattern, with
//! broadcast fan-out to subscribers.
//!
//! Patterns use unix shell wildcards (`*`, `?`, `[abc]`, `[!abc]`).  A record
//! pushed to the store reaches the topic registered under its exact name and
//! every pattern topic whose pattern matches that name.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use glob::Pattern;
use nl_protocol::{TopicData, TopicDataRecord};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::error::{NodeSdkError, Result};

/// Per-topic channel capacity.  Slow subscribers lag rather than block.
pub const TOPIC_BUFFER: usize = 256;

/// Whether `name` contains unix wildcard characters.
pub fn is_wildcard(name: &str) -> bool {
    name.contains(['*', '?', '['])
}

/// Compile a unix wildcard pattern with fnmatch semantics: `*` crosses
/// `/`, `]` right after `[` or `[!` is a member, and a `[` that opens no
/// valid class is a literal bracket.
pub fn compile_wildcard(pattern: &str) -> Result<Pattern> {
    // `**` is only special to glob as a whole path component.
    let mut source = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if !(c == '*' && source.ends_with('*')) {
            source.push(c);
        }
    }

    // Every failed parse points at a `[` glob rejects; bracket it and retry.
    let attempts = source.matches('[').count() + 1;
    for _ in 0..attempts {
        match Pattern::new(&source) {
            Ok(compiled) => return Ok(compiled),
            Err(e) => {
                let at = source
                    .char_indices()
                    .nth(e.pos)
                    .map(|(i, _)| i)
                    .filter(|i| source[*i..].starts_with('['))
                    .ok_or_else(|| bad_pattern(pattern, e.msg))?;
                source.replace_range(at..at + 1, "[[]");
            }
        }
    }
    Err(bad_pattern(pattern, "unbalanced brackets"))
}

fn bad_pattern(pattern: &str, msg: &str) -> NodeSdkError {
    NodeSdkError::InvalidArgument(format!("bad pattern {pattern:?}: {msg}"))
}

/// A named topic; subscribers receive every record pushed to it.
pub struct Topic {
    name: String,
    pattern: Option<Pattern>,
    tx: broadcast::Sender<TopicDataRecord>,
}

impl Topic {
    fn new(name: &str) -> Result<Self> {
        let pattern = if is_wildcard(name) {
            Some(compile_wildcard(name)?)
        } else {
            None
        };
        let (tx, _) = broadcast::channel(TOPIC_BUFFER);
        Ok(Self {
            name: name.to_string(),
            pattern,
            tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_pattern(&self) -> bool {
        self.pattern.is_some()
    }

    /// Whether a record published on `topic` belongs to this topic.
    pub fn matches(&self, topic: &str) -> bool {
        match &self.pattern {
            Some(pattern) => pattern.matches(topic),
            None => self.name == topic,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopicDataRecord> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Fan `record` out; returns how many subscribers received it.
    pub fn push(&self, record: TopicDataRecord) -> usize {
        self.tx.send(record).unwrap_or(0)
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("is_pattern", &self.is_pattern())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Keyed registry of topics.
#[derive(Debug, Default)]
pub struct TopicStore {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
}

impl TopicStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The topic registered under `name`, created on first use.
    ///
    /// Repeated calls with the same name return the same `Arc`.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<Topic>> {
        if let Some(topic) = self.topics.read().get(name) {
            return Ok(topic.clone());
        }

        let mut topics = self.topics.write();
        // Another writer may have won the race between the two locks.
        if let Some(topic) = topics.get(name) {
            return Ok(topic.clone());
        }
        let topic = Arc::new(Topic::new(name)?);
        topics.insert(name.to_string(), topic.clone());
        Ok(topic)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.read().get(name).cloned()
    }

    /// Every topic (exact or pattern) a record on `name` would reach.
    pub fn matching(&self, name: &str) -> Vec<Arc<Topic>> {
        let mut found: Vec<Arc<Topic>> = self
            .topics
            .read()
            .values()
            .filter(|t| t.matches(name))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name().cmp(b.name()));
        found
    }

    /// Deliver `record` to every matching topic; returns total deliveries.
    pub fn push(&self, record: TopicDataRecord) -> usize {
        let targets = self.matching(&record.topic);
        if targets.is_empty() {
            tracing::trace!(topic = %record.topic, "record for unknown topic dropped");
            return 0;
        }
        targets.iter().map(|t| t.push(record.clone())).sum()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.write().remove(name)
    }

    /// Registered names and patterns (sorted).
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.topics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.read().is_empty()
    }
}

/// Relay inbound topic data into `store` until the stream ends.
///
/// Stream errors and broker error messages are logged and skipped.  Returns
/// the number of records relayed.
pub async fn relay_records(mut stream: BoxStream<'static, Result<TopicData>>, store: Arc<TopicStore>) -> u64 {
    let mut relayed: u64 = 0;
    while let Some(item) = stream.next().await {
        match item {
            Ok(TopicData::Error { title, message }) => {
                tracing::warn!(title = %title, message = %message, "broker sent topic data error");
            }
            Ok(data) => {
                for record in data.into_records() {
                    store.push(record);
                    relayed += 1;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "record relay error");
            }
        }
    }
    tracing::debug!(relayed, "record relay finished");
    relayed
}
