//! In-process lock backend

use super::{LockHandle, Locker};
use crate::error::{LockError, LockResult};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct Entry {
    token: Uuid,
    expires_at: Instant,
}

type Table = Arc<Mutex<HashMap<String, Entry>>>;

/// Lock service local to this process
#[derive(Debug, Clone, Default)]
pub struct LocalLocker {
    table: Table,
}

impl LocalLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held (expired entries excluded)
    pub fn held_count(&self) -> usize {
        let now = Instant::now();
        self.table
            .lock()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }
}

#[async_trait::async_trait]
impl Locker for LocalLocker {
    async fn acquire(&self, key: &str, ttl: Duration) -> LockResult<Box<dyn LockHandle>> {
        let now = Instant::now();
        let mut table = self.table.lock();

        if let Some(entry) = table.get(key) {
            if entry.expires_at > now {
                return Err(LockError::Held {
                    key: key.to_string(),
                });
            }
        }

        let token = Uuid::new_v4();
        table.insert(
            key.to_string(),
            Entry {
                token,
                expires_at: now + ttl,
            },
        );

        Ok(Box::new(LocalLockHandle {
            table: self.table.clone(),
            key: key.to_string(),
            token,
        }))
    }
}

struct LocalLockHandle {
    table: Table,
    key: String,
    token: Uuid,
}

impl LocalLockHandle {
    fn lost(&self) -> LockError {
        LockError::Lost {
            key: self.key.clone(),
        }
    }
}

#[async_trait::async_trait]
impl LockHandle for LocalLockHandle {
    fn key(&self) -> &str {
        &self.key
    }

    async fn renew(&self, ttl: Duration) -> LockResult<()> {
        let now = Instant::now();
        let mut table = self.table.lock();

        match table.get_mut(&self.key) {
            Some(entry) if entry.token == self.token && entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Ok(())
            }
            _ => Err(self.lost()),
        }
    }

    async fn release(&self) -> LockResult<()> {
        let mut table = self.table.lock();

        match table.get(&self.key) {
            Some(entry) if entry.token == self.token => {
                table.remove(&self.key);
                Ok(())
            }
            _ => Err(self.lost()),
        }
    }
}
