//! Job sources
//!
//! A [`JobSource`] yields jobs to the producer. `Ok(None)` means "nothing
//! right now, ask again"; `Err(SourceError::Closed)` means the source is
//! permanently exhausted. Any other error is reported and the producer keeps
//! asking.

use crate::db::RepositoryStore;
use crate::error::SourceError;
use crate::job::{Job, Mention};
use crate::queue::JobQueue;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

/// Lazy sequence of jobs
#[async_trait::async_trait]
pub trait JobSource: Send {
    async fn next(&mut self) -> Result<Option<Job>, SourceError>;
}

/// Turns mentions from an upstream queue into jobs
///
/// Every mention of the same endpoint resolves to the same repository id
/// through the metadata store.
pub struct MentionJobSource {
    mentions: Arc<dyn JobQueue>,
    store: Arc<dyn RepositoryStore>,
    consumer: String,
    wait: Duration,
}

impl MentionJobSource {
    pub fn new(
        mentions: Arc<dyn JobQueue>,
        store: Arc<dyn RepositoryStore>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            mentions,
            store,
            consumer: consumer.into(),
            wait: Duration::from_secs(1),
        }
    }

    /// How long each call waits for a mention before yielding `Ok(None)`
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

#[async_trait::async_trait]
impl JobSource for MentionJobSource {
    async fn next(&mut self) -> Result<Option<Job>, SourceError> {
        let delivery = match self.mentions.consume(&self.consumer, self.wait).await? {
            Some(delivery) => delivery,
            None => return Ok(None),
        };

        let mention = match Mention::decode(&delivery.payload) {
            Ok(mention) => mention,
            Err(e) => {
                self.mentions.dead_letter(&delivery).await?;
                return Err(SourceError::InvalidMention(e.to_string()));
            }
        };

        let id = match self
            .store
            .find_or_create_by_endpoint(&mention.endpoint, &mention.provider)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                // Leave the mention for a later attempt
                self.mentions.release(&delivery).await?;
                return Err(e.into());
            }
        };

        self.mentions.ack(&delivery).await?;
        Ok(Some(Job::new(id, mention.endpoint, mention.provider)))
    }
}

/// Reads endpoints from a text file, one per line
///
/// Blank lines and lines starting with `#` are skipped. End of file closes
/// the source.
pub struct UrlListSource {
    lines: Lines<BufReader<File>>,
    store: Arc<dyn RepositoryStore>,
    provider: String,
    /// Endpoint whose lookup failed, retried before reading on
    pending: Option<String>,
}

impl UrlListSource {
    pub async fn open(
        path: &Path,
        store: Arc<dyn RepositoryStore>,
        provider: impl Into<String>,
    ) -> Result<Self, SourceError> {
        let file = File::open(path).await?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            store,
            provider: provider.into(),
            pending: None,
        })
    }
}

#[async_trait::async_trait]
impl JobSource for UrlListSource {
    async fn next(&mut self) -> Result<Option<Job>, SourceError> {
        let endpoint = match self.pending.take() {
            Some(endpoint) => endpoint,
            None => loop {
                let line = match self.lines.next_line().await? {
                    Some(line) => line,
                    None => return Err(SourceError::Closed),
                };

                let endpoint = line.trim();
                if !endpoint.is_empty() && !endpoint.starts_with('#') {
                    break endpoint.to_string();
                }
            },
        };

        match self
            .store
            .find_or_create_by_endpoint(&endpoint, &self.provider)
            .await
        {
            Ok(id) => Ok(Some(Job::new(id, endpoint, self.provider.clone()))),
            Err(e) => {
                self.pending = Some(endpoint);
                Err(e.into())
            }
        }
    }
}
