//! Redis cache layer for role resolution

use crate::config::RedisConfig;
use crate::domain::{Role, StringUuid};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

/// Cache key prefixes
mod keys {
    pub const USER_ROLES: &str = "authz:user_roles";
    /// Per user/tenant invalidation counter
    pub const USER_ROLES_GENERATION: &str = "authz:user_roles_gen";
    /// Bumped by invalidations that span several user/tenant pairs
    pub const USER_ROLES_EPOCH: &str = "authz:user_roles_epoch";
}

/// Default TTLs
mod ttl {
    pub const USER_ROLES_SECS: u64 = 300; // 5 minutes
    /// Must outlive any in-flight fill by a wide margin
    pub const GENERATION_SECS: u64 = 3600;
}

/// Invalidation counters observed before reading roles from the database.
///
/// A fill carrying a token is only stored if no invalidation touched the
/// same entry since the token was taken, so a read that raced with a revoke
/// can never put the revoked role back into the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillToken {
    pub epoch: i64,
    pub generation: i64,
}

/// Compare-and-set for a role cache fill.
/// KEYS: entry, generation, epoch. ARGV: epoch, generation, value, ttl.
const FILL_IF_CURRENT: &str = r#"
local epoch = tonumber(redis.call('GET', KEYS[3]) or '0')
local generation = tonumber(redis.call('GET', KEYS[2]) or '0')
if epoch ~= tonumber(ARGV[1]) or generation ~= tonumber(ARGV[2]) then
    return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'EX', tonumber(ARGV[4]))
return 1
"#;

/// Role-resolution cache operations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheOperations: Send + Sync {
    async fn get_user_roles(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
    ) -> Result<Option<Vec<Role>>>;
    /// Take a token before the database read that will fill the entry
    async fn user_roles_fill_token(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
    ) -> Result<FillToken>;
    /// Store `roles` unless the entry was invalidated after `token` was
    /// taken. Returns whether the entry was written.
    async fn set_user_roles(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
        roles: &[Role],
        token: FillToken,
    ) -> Result<bool>;
    /// Bumps the invalidation counters, then drops the entries.
    /// `None` drops the user's entries in every tenant
    async fn invalidate_user_roles(
        &self,
        user_id: StringUuid,
        tenant_id: Option<StringUuid>,
    ) -> Result<()>;
    async fn invalidate_all_user_roles(&self) -> Result<()>;
}

/// Cache manager for Redis operations
#[derive(Clone)]
pub struct CacheManager {
    conn: ConnectionManager,
}

impl CacheManager {
    /// Create a new cache manager
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Failed to create Redis client: {}", e))
        })?;

        let conn = ConnectionManager::new(client).await.map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Failed to connect to Redis: {}", e))
        })?;

        Ok(Self { conn })
    }

    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;

        match value {
            Some(v) => {
                let parsed = serde_json::from_str(&v).map_err(|e| {
                    AppError::Internal(anyhow::anyhow!("Cache deserialize error: {}", e))
                })?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }

    async fn counter(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }

    async fn bump(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .incr(key, 1)
            .ignore()
            .expire(key, ttl.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_current<T: Serialize + ?Sized>(
        &self,
        key: &str,
        generation_key: &str,
        value: &T,
        token: FillToken,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let serialized = serde_json::to_string(value).map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Cache serialize error: {}", e))
        })?;

        let stored: i64 = redis::Script::new(FILL_IF_CURRENT)
            .key(key)
            .key(generation_key)
            .key(keys::USER_ROLES_EPOCH)
            .arg(token.epoch)
            .arg(token.generation)
            .arg(serialized)
            .arg(ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(stored == 1)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut conn)
            .await?;

        if !keys.is_empty() {
            conn.del::<_, ()>(keys).await?;
        }
        Ok(())
    }
}

fn user_roles_key(user_id: StringUuid, tenant_id: StringUuid) -> String {
    format!("{}:{}:{}", keys::USER_ROLES, user_id, tenant_id)
}

fn user_roles_generation_key(user_id: StringUuid, tenant_id: StringUuid) -> String {
    format!("{}:{}:{}", keys::USER_ROLES_GENERATION, user_id, tenant_id)
}

#[async_trait]
impl CacheOperations for CacheManager {
    async fn get_user_roles(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
    ) -> Result<Option<Vec<Role>>> {
        self.get(&user_roles_key(user_id, tenant_id)).await
    }

    async fn user_roles_fill_token(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
    ) -> Result<FillToken> {
        Ok(FillToken {
            epoch: self.counter(keys::USER_ROLES_EPOCH).await?,
            generation: self
                .counter(&user_roles_generation_key(user_id, tenant_id))
                .await?,
        })
    }

    async fn set_user_roles(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
        roles: &[Role],
        token: FillToken,
    ) -> Result<bool> {
        self.set_if_current(
            &user_roles_key(user_id, tenant_id),
            &user_roles_generation_key(user_id, tenant_id),
            roles,
            token,
            Duration::from_secs(ttl::USER_ROLES_SECS),
        )
        .await
    }

    async fn invalidate_user_roles(
        &self,
        user_id: StringUuid,
        tenant_id: Option<StringUuid>,
    ) -> Result<()> {
        let generation_ttl = Duration::from_secs(ttl::GENERATION_SECS);
        match tenant_id {
            Some(tid) => {
                self.bump(&user_roles_generation_key(user_id, tid), generation_ttl)
                    .await?;
                self.delete(&user_roles_key(user_id, tid)).await
            }
            None => {
                self.bump(keys::USER_ROLES_EPOCH, generation_ttl).await?;
                let pattern = format!("{}:{}:*", keys::USER_ROLES, user_id);
                self.delete_pattern(&pattern).await
            }
        }
    }

    async fn invalidate_all_user_roles(&self) -> Result<()> {
        self.bump(keys::USER_ROLES_EPOCH, Duration::from_secs(ttl::GENERATION_SECS))
            .await?;
        let pattern = format!("{}:*", keys::USER_ROLES);
        self.delete_pattern(&pattern).await
    }
}

/// Cache that never stores anything; every read misses
#[derive(Clone, Default)]
pub struct NoOpCacheManager;

impl NoOpCacheManager {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CacheOperations for NoOpCacheManager {
    async fn get_user_roles(
        &self,
        _user_id: StringUuid,
        _tenant_id: StringUuid,
    ) -> Result<Option<Vec<Role>>> {
        Ok(None)
    }

    async fn user_roles_fill_token(
        &self,
        _user_id: StringUuid,
        _tenant_id: StringUuid,
    ) -> Result<FillToken> {
        Ok(FillToken::default())
    }

    async fn set_user_roles(
        &self,
        _user_id: StringUuid,
        _tenant_id: StringUuid,
        _roles: &[Role],
        _token: FillToken,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn invalidate_user_roles(
        &self,
        _user_id: StringUuid,
        _tenant_id: Option<StringUuid>,
    ) -> Result<()> {
        Ok(())
    }

    async fn invalidate_all_user_roles(&self) -> Result<()> {
        Ok(())
    }
}
