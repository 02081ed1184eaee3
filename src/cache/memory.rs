//! In-memory reference implementation of the cache.
//!
//! Fixed-window rate-limit counters keyed by event id, token entries
//! with absolute expiry, check-in timestamps and per-tenant limits.
//! Time comes from an injected clock so tests can roll windows and
//! expire tokens deterministically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Cache, CacheError, IdType, RateLimitParams};
use crate::context::RequestContext;
use crate::models::Limit;
use crate::utils::{Clock, SystemClock};

struct TokenEntry {
    raw: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Entries {
    // (tenant, id_type, device) -> token
    tokens: HashMap<(String, &'static str, String), TokenEntry>,
    // event_id -> (window index, count)
    counters: HashMap<String, (i64, u64)>,
    // (tenant, device) -> check-in
    check_ins: HashMap<(String, String), DateTime<Utc>>,
    // (tenant, name) -> limit
    limits: HashMap<(String, String), Limit>,
}

pub struct MemCache {
    clock: Arc<dyn Clock>,
    inner: Mutex<Entries>,
}

impl Default for MemCache {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Entries::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Entries>, CacheError> {
        self.inner
            .lock()
            .map_err(|e| CacheError::Internal(anyhow::anyhow!("cache mutex poisoned: {}", e)))
    }

    fn token_key(tenant_id: &str, device_id: &str, id_type: IdType) -> (String, &'static str, String) {
        (tenant_id.to_string(), id_type.as_str(), device_id.to_string())
    }
}

#[async_trait]
impl Cache for MemCache {
    async fn throttle(
        &self,
        _ctx: &RequestContext,
        _raw_token: &str,
        params: Option<RateLimitParams>,
        tenant_id: &str,
        device_id: &str,
        id_type: IdType,
        _uri: &str,
        _method: &str,
    ) -> Result<Option<String>, CacheError> {
        let now = self.clock.now();
        let mut entries = self.lock()?;

        if let Some(params) = params {
            let interval_secs = params.interval.as_secs().max(1) as i64;
            let window = now.timestamp() / interval_secs;
            let counter = entries
                .counters
                .entry(params.event_id.clone())
                .or_insert((window, 0));
            if counter.0 != window {
                *counter = (window, 0);
            }
            counter.1 += 1;
            if counter.1 > params.burst {
                return Err(CacheError::TooManyRequests);
            }
        }

        let key = Self::token_key(tenant_id, device_id, id_type);
        match entries.tokens.get(&key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.raw.clone())),
            Some(_) => {
                entries.tokens.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn cache_token(
        &self,
        _ctx: &RequestContext,
        tenant_id: &str,
        device_id: &str,
        id_type: IdType,
        raw_token: &str,
        expire_in: Duration,
    ) -> Result<(), CacheError> {
        let expires_at = self.clock.now()
            + chrono::Duration::from_std(expire_in)
                .map_err(|e| anyhow::anyhow!("token ttl out of range: {}", e))?;
        let mut entries = self.lock()?;
        entries.tokens.insert(
            Self::token_key(tenant_id, device_id, id_type),
            TokenEntry {
                raw: raw_token.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete_token(
        &self,
        _ctx: &RequestContext,
        tenant_id: &str,
        device_id: &str,
        id_type: IdType,
    ) -> Result<(), CacheError> {
        let mut entries = self.lock()?;
        entries
            .tokens
            .remove(&Self::token_key(tenant_id, device_id, id_type));
        Ok(())
    }

    async fn get_limit(
        &self,
        _ctx: &RequestContext,
        tenant_id: &str,
        name: &str,
    ) -> Result<Option<Limit>, CacheError> {
        let entries = self.lock()?;
        Ok(entries
            .limits
            .get(&(tenant_id.to_string(), name.to_string()))
            .cloned())
    }

    async fn set_limit(
        &self,
        _ctx: &RequestContext,
        tenant_id: &str,
        limit: Limit,
    ) -> Result<(), CacheError> {
        let mut entries = self.lock()?;
        entries
            .limits
            .insert((tenant_id.to_string(), limit.name.clone()), limit);
        Ok(())
    }

    async fn delete_limit(
        &self,
        _ctx: &RequestContext,
        tenant_id: &str,
        name: &str,
    ) -> Result<(), CacheError> {
        let mut entries = self.lock()?;
        entries
            .limits
            .remove(&(tenant_id.to_string(), name.to_string()));
        Ok(())
    }

    async fn cache_check_in_time(
        &self,
        _ctx: &RequestContext,
        tenant_id: &str,
        device_id: &str,
        time: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let mut entries = self.lock()?;
        entries
            .check_ins
            .insert((tenant_id.to_string(), device_id.to_string()), time);
        Ok(())
    }

    async fn get_check_in_time(
        &self,
        _ctx: &RequestContext,
        tenant_id: &str,
        device_id: &str,
    ) -> Result<Option<DateTime<Utc>>, CacheError> {
        let entries = self.lock()?;
        Ok(entries
            .check_ins
            .get(&(tenant_id.to_string(), device_id.to_string()))
            .copied())
    }

    async fn get_check_in_times(
        &self,
        _ctx: &RequestContext,
        tenant_id: &str,
        device_ids: &[String],
    ) -> Result<Vec<Option<DateTime<Utc>>>, CacheError> {
        let entries = self.lock()?;
        Ok(device_ids
            .iter()
            .map(|id| {
                entries
                    .check_ins
                    .get(&(tenant_id.to_string(), id.clone()))
                    .copied()
            })
            .collect())
    }

    async fn suspend_tenant(
        &self,
        _ctx: &RequestContext,
        tenant_id: &str,
    ) -> Result<(), CacheError> {
        let mut entries = self.lock()?;
        entries.tokens.retain(|(t, _, _), _| t != tenant_id);
        entries.check_ins.retain(|(t, _), _| t != tenant_id);
        entries.limits.retain(|(t, _), _| t != tenant_id);
        entries
            .counters
            .retain(|event_id, _| !event_id.starts_with(&format!("tenant:{}:", tenant_id)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::FixedClock;
    use chrono::TimeZone;

    fn cache_with_clock() -> (MemCache, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap(),
        ));
        (MemCache::new(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_token_round_trip_and_expiry() {
        let (cache, clock) = cache_with_clock();
        let ctx = RequestContext::new("test");

        cache
            .cache_token(&ctx, "acme", "dev-1", IdType::Device, "tok", Duration::from_secs(60))
            .await
            .unwrap();

        let got = cache
            .throttle(&ctx, "tok", None, "acme", "dev-1", IdType::Device, "", "GET")
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some("tok"));

        clock.advance(chrono::Duration::seconds(61));
        let got = cache
            .throttle(&ctx, "tok", None, "acme", "dev-1", IdType::Device, "", "GET")
            .await
            .unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_throttle_enforces_burst_per_window() {
        let (cache, clock) = cache_with_clock();
        let ctx = RequestContext::new("test");
        let params = RateLimitParams {
            burst: 2,
            interval: Duration::from_secs(60),
            event_id: "tenant:acme:ratelimit:foo".to_string(),
        };

        for _ in 0..2 {
            cache
                .throttle(
                    &ctx,
                    "tok",
                    Some(params.clone()),
                    "acme",
                    "dev-1",
                    IdType::Device,
                    "foo",
                    "GET",
                )
                .await
                .unwrap();
        }
        let err = cache
            .throttle(
                &ctx,
                "tok",
                Some(params.clone()),
                "acme",
                "dev-1",
                IdType::Device,
                "foo",
                "GET",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::TooManyRequests));

        // a fresh window resets the counter
        clock.advance(chrono::Duration::seconds(60));
        cache
            .throttle(
                &ctx,
                "tok",
                Some(params),
                "acme",
                "dev-1",
                IdType::Device,
                "foo",
                "GET",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_suspend_tenant_flushes_entries() {
        let (cache, _clock) = cache_with_clock();
        let ctx = RequestContext::new("test");

        cache
            .cache_token(&ctx, "acme", "dev-1", IdType::Device, "tok", Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .set_limit(&ctx, "acme", Limit::new("max_devices", 5))
            .await
            .unwrap();
        cache
            .cache_token(&ctx, "other", "dev-2", IdType::Device, "tok2", Duration::from_secs(60))
            .await
            .unwrap();

        cache.suspend_tenant(&ctx, "acme").await.unwrap();

        let got = cache
            .throttle(&ctx, "tok", None, "acme", "dev-1", IdType::Device, "", "GET")
            .await
            .unwrap();
        assert_eq!(got, None);
        assert!(cache.get_limit(&ctx, "acme", "max_devices").await.unwrap().is_none());

        let kept = cache
            .throttle(&ctx, "tok2", None, "other", "dev-2", IdType::Device, "", "GET")
            .await
            .unwrap();
        assert_eq!(kept.as_deref(), Some("tok2"));
    }
}
