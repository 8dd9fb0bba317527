//! Redis lock backend
//!
//! `SET key token NX PX ttl` to acquire; renew and release run as scripts
//! that compare the stored token first, so a stale handle can never touch a
//! lock that expired and was re-acquired elsewhere.

use super::{LockHandle, Locker};
use crate::error::{LockError, LockResult};

use redis::{aio::MultiplexedConnection, Client, Script};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Redis key prefix for locks
pub const LOCK_KEY_PREFIX: &str = "repo-archiver:lock";

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

struct Scripts {
    release: Script,
    renew: Script,
}

/// Lock service shared through Redis
#[derive(Clone)]
pub struct RedisLocker {
    connection: MultiplexedConnection,
    scripts: Arc<Scripts>,
}

impl RedisLocker {
    /// Connect to the lock backend. Fails if Redis is unreachable.
    pub async fn connect(url: &str) -> LockResult<Self> {
        let client = Client::open(url).map_err(|e| LockError::InvalidConfig {
            config: url.to_string(),
            reason: e.to_string(),
        })?;
        let connection = client.get_multiplexed_async_connection().await?;

        Ok(Self {
            connection,
            scripts: Arc::new(Scripts {
                release: Script::new(RELEASE_SCRIPT),
                renew: Script::new(RENEW_SCRIPT),
            }),
        })
    }

    fn redis_key(key: &str) -> String {
        format!("{}:{}", LOCK_KEY_PREFIX, key)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait::async_trait]
impl Locker for RedisLocker {
    async fn acquire(&self, key: &str, ttl: Duration) -> LockResult<Box<dyn LockHandle>> {
        let mut conn = self.connection.clone();
        let token = Uuid::new_v4().to_string();

        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::redis_key(key))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;

        if reply.is_none() {
            return Err(LockError::Held {
                key: key.to_string(),
            });
        }

        Ok(Box::new(RedisLockHandle {
            connection: self.connection.clone(),
            scripts: self.scripts.clone(),
            key: key.to_string(),
            token,
        }))
    }
}

struct RedisLockHandle {
    connection: MultiplexedConnection,
    scripts: Arc<Scripts>,
    key: String,
    token: String,
}

impl RedisLockHandle {
    fn lost(&self) -> LockError {
        LockError::Lost {
            key: self.key.clone(),
        }
    }
}

#[async_trait::async_trait]
impl LockHandle for RedisLockHandle {
    fn key(&self) -> &str {
        &self.key
    }

    async fn renew(&self, ttl: Duration) -> LockResult<()> {
        let mut conn = self.connection.clone();
        let renewed: i64 = self
            .scripts
            .renew
            .key(RedisLocker::redis_key(&self.key))
            .arg(&self.token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        if renewed == 0 {
            return Err(self.lost());
        }
        Ok(())
    }

    async fn release(&self) -> LockResult<()> {
        let mut conn = self.connection.clone();
        let deleted: i64 = self
            .scripts
            .release
            .key(RedisLocker::redis_key(&self.key))
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await?;

        if deleted == 0 {
            return Err(self.lost());
        }
        Ok(())
    }
}
