use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Runtime;

pub(crate) const DEFAULT_CACHE_TTL_SECS: u64 = 86_400; // 1 day

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CacheError {
    Unavailable(String),
}

impl CacheError {
    pub(crate) fn code(&self) -> &'static str {
        match self {
            CacheError::Unavailable(_) => "cache-unavailable",
        }
    }

    pub(crate) fn detail(&self) -> &str {
        match self {
            CacheError::Unavailable(detail) => detail,
        }
    }
}

/// Identity of one cached read operation. The namespace groups every key the
/// operation ever produces, which is what bulk invalidation clears.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CachedOp {
    pub namespace: &'static str,
    pub name: &'static str,
}

pub(crate) const OP_LIST_STACKS: CachedOp = CachedOp {
    namespace: "stacks",
    name: "list_stacks",
};
pub(crate) const OP_GET_STACK: CachedOp = CachedOp {
    namespace: "stacks",
    name: "get_stack",
};
pub(crate) const OP_LIST_CONTAINERS: CachedOp = CachedOp {
    namespace: "containers",
    name: "list_containers",
};
pub(crate) const OP_LIST_IMAGES: CachedOp = CachedOp {
    namespace: "images",
    name: "list_images",
};
pub(crate) const OP_REMOTE_DIGEST: CachedOp = CachedOp {
    namespace: "registry",
    name: "remote_digest",
};

// Listing operations whose results can include data mutated by an update
// task. Cleared together when a task reaches a terminal state.
pub(crate) const LISTING_OPS: [CachedOp; 4] = [
    OP_LIST_STACKS,
    OP_GET_STACK,
    OP_LIST_CONTAINERS,
    OP_LIST_IMAGES,
];

impl CachedOp {
    pub(crate) fn key(&self, positional: &[&str], named: &[(&str, &str)]) -> String {
        cache_key(self.namespace, self.name, positional, named)
    }

    pub(crate) fn prefix(&self) -> String {
        namespace_prefix(self.namespace, self.name)
    }
}

/// Deterministic cache key: `namespace.op(positional..., named...)` with named
/// arguments sorted by name so keyword ordering never changes the key.
pub(crate) fn cache_key(
    namespace: &str,
    op: &str,
    positional: &[&str],
    named: &[(&str, &str)],
) -> String {
    let mut parts: Vec<String> = positional.iter().map(|v| format!("{v:?}")).collect();
    let mut named_sorted: Vec<(&str, &str)> = named.to_vec();
    named_sorted.sort_by(|a, b| a.0.cmp(b.0));
    parts.extend(named_sorted.iter().map(|(k, v)| format!("{k}={v:?}")));

    let args = parts.join(", ");
    if namespace.is_empty() {
        format!("{op}({args})")
    } else {
        format!("{namespace}.{op}({args})")
    }
}

/// Prefix matching every operation in a namespace, any arguments.
pub(crate) fn whole_namespace_prefix(namespace: &str) -> String {
    format!("{namespace}.")
}

pub(crate) fn namespace_prefix(namespace: &str, op: &str) -> String {
    if namespace.is_empty() {
        format!("{op}(")
    } else {
        format!("{namespace}.{op}(")
    }
}

/// Sqlite-backed key/value store with per-row TTL. Reads of expired rows
/// delete the row and report a miss; prefix clears run as a single DELETE so
/// no entry visible to the statement survives it.
pub(crate) struct CacheStore {
    pool: SqlitePool,
    runtime: Arc<Runtime>,
}

impl CacheStore {
    pub(crate) fn new(pool: SqlitePool, runtime: Arc<Runtime>) -> Self {
        Self { pool, runtime }
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    pub(crate) fn get_with_ttl(&self, key: &str) -> Result<Option<(u64, String)>, CacheError> {
        let pool = self.pool.clone();
        let key = key.to_string();
        let now = crate::current_unix_secs() as i64;

        self.block_on(async move {
            let row = sqlx::query("SELECT data, expires_at FROM api_cache WHERE key = ?")
                .bind(&key)
                .fetch_optional(&pool)
                .await
                .map_err(|e| CacheError::Unavailable(e.to_string()))?;

            let Some(row) = row else { return Ok(None) };
            let data: String = row.get("data");
            let expires_at: i64 = row.get("expires_at");

            if expires_at <= now {
                sqlx::query("DELETE FROM api_cache WHERE key = ?")
                    .bind(&key)
                    .execute(&pool)
                    .await
                    .map_err(|e| CacheError::Unavailable(e.to_string()))?;
                return Ok(None);
            }

            Ok(Some(((expires_at - now) as u64, data)))
        })
    }

    pub(crate) fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CacheError> {
        let pool = self.pool.clone();
        let key = key.to_string();
        let value = value.to_string();
        let now = crate::current_unix_secs() as i64;
        let expires_at = now + ttl_secs as i64;

        self.block_on(async move {
            sqlx::query(
                "INSERT INTO api_cache (key, data, expires_at, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(key) DO UPDATE SET
                   data = excluded.data,
                   expires_at = excluded.expires_at,
                   updated_at = excluded.updated_at",
            )
            .bind(&key)
            .bind(&value)
            .bind(expires_at)
            .bind(now)
            .bind(now)
            .execute(&pool)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
            Ok(())
        })
    }

    pub(crate) fn clear_key(&self, key: &str) -> Result<u64, CacheError> {
        let pool = self.pool.clone();
        let key = key.to_string();

        self.block_on(async move {
            let result = sqlx::query("DELETE FROM api_cache WHERE key = ?")
                .bind(&key)
                .execute(&pool)
                .await
                .map_err(|e| CacheError::Unavailable(e.to_string()))?;
            Ok(result.rows_affected())
        })
    }

    pub(crate) fn clear_namespace(&self, prefix: &str) -> Result<u64, CacheError> {
        let pool = self.pool.clone();
        let pattern = format!("{}%", escape_like(prefix));

        self.block_on(async move {
            let result = sqlx::query("DELETE FROM api_cache WHERE key LIKE ? ESCAPE '\\'")
                .bind(&pattern)
                .execute(&pool)
                .await
                .map_err(|e| CacheError::Unavailable(e.to_string()))?;
            Ok(result.rows_affected())
        })
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, key: &str, secs: i64) {
        let pool = self.pool.clone();
        let key = key.to_string();
        self.block_on(async move {
            sqlx::query("UPDATE api_cache SET expires_at = expires_at - ? WHERE key = ?")
                .bind(secs)
                .bind(&key)
                .execute(&pool)
                .await
                .unwrap();
        });
    }

    #[cfg(test)]
    pub(crate) fn close(&self) {
        let pool = self.pool.clone();
        self.block_on(async move { pool.close().await });
    }
}

fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CacheBypass {
    /// Normal read-through.
    None,
    /// Recompute, then write the fresh value back.
    NoCache,
    /// Recompute without touching the store.
    NoStore,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CachedOutcome {
    /// The caller's freshness token still matches the cached body.
    NotModified { etag: String },
    Value {
        body: String,
        etag: String,
        from_cache: bool,
    },
}

pub(crate) fn etag_for(body: &str) -> String {
    let digest = Sha256::digest(body.as_bytes());
    format!("W/\"{}\"", hex::encode(digest))
}

/// Read-through policy around one cached operation. Store faults degrade to
/// direct computation and are logged; they never fail the caller. Errors from
/// `produce` are the caller's problem and propagate.
pub(crate) fn fetch_through<F>(
    store: &CacheStore,
    op: CachedOp,
    positional: &[&str],
    named: &[(&str, &str)],
    ttl_secs: u64,
    bypass: CacheBypass,
    if_none_match: Option<&str>,
    produce: F,
) -> Result<CachedOutcome, String>
where
    F: FnOnce() -> Result<String, String>,
{
    let key = op.key(positional, named);

    if bypass != CacheBypass::None {
        let body = produce()?;
        if bypass == CacheBypass::NoCache {
            store_best_effort(store, &key, &body, ttl_secs);
        }
        let etag = etag_for(&body);
        return Ok(CachedOutcome::Value {
            body,
            etag,
            from_cache: false,
        });
    }

    match store.get_with_ttl(&key) {
        Ok(Some((_remaining, body))) => {
            let etag = etag_for(&body);
            if if_none_match == Some(etag.as_str()) {
                return Ok(CachedOutcome::NotModified { etag });
            }
            Ok(CachedOutcome::Value {
                body,
                etag,
                from_cache: true,
            })
        }
        Ok(None) => {
            let body = produce()?;
            store_best_effort(store, &key, &body, ttl_secs);
            let etag = etag_for(&body);
            Ok(CachedOutcome::Value {
                body,
                etag,
                from_cache: false,
            })
        }
        Err(err) => {
            crate::log_message(&format!(
                "warn cache-read-failed key={key} code={} detail={}",
                err.code(),
                err.detail()
            ));
            let body = produce()?;
            store_best_effort(store, &key, &body, ttl_secs);
            let etag = etag_for(&body);
            Ok(CachedOutcome::Value {
                body,
                etag,
                from_cache: false,
            })
        }
    }
}

fn store_best_effort(store: &CacheStore, key: &str, body: &str, ttl_secs: u64) {
    if let Err(err) = store.set(key, body, ttl_secs) {
        crate::log_message(&format!(
            "warn cache-write-failed key={key} code={} detail={}",
            err.code(),
            err.detail()
        ));
    }
}

/// Invalidation coordinator, storage side: clear every listing namespace whose
/// results could include mutated stack data. At-least-once; double clears are
/// harmless and failures only cost staleness up to the TTL.
pub(crate) fn invalidate_listing_caches(store: &CacheStore) {
    for op in LISTING_OPS {
        let prefix = op.prefix();
        match store.clear_namespace(&prefix) {
            Ok(0) => {}
            Ok(count) => {
                crate::log_message(&format!("cache-invalidated ns={prefix} removed={count}"));
            }
            Err(err) => {
                crate::log_message(&format!(
                    "warn cache-invalidate-failed ns={prefix} code={} detail={}",
                    err.code(),
                    err.detail()
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    fn test_store() -> CacheStore {
        let runtime = Arc::new(Runtime::new().unwrap());
        let pool = runtime.block_on(async {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await
                .unwrap();
            crate::MIGRATOR.run(&pool).await.unwrap();
            pool
        });
        CacheStore::new(pool, runtime)
    }

    #[test]
    fn cache_key_sorts_named_arguments() {
        let a = cache_key("stacks", "get_stack", &["web"], &[("b", "2"), ("a", "1")]);
        let b = cache_key("stacks", "get_stack", &["web"], &[("a", "1"), ("b", "2")]);
        assert_eq!(a, b);
        assert_eq!(a, "stacks.get_stack(\"web\", a=\"1\", b=\"2\")");
    }

    #[test]
    fn cache_key_without_namespace_or_args() {
        assert_eq!(cache_key("", "list_images", &[], &[]), "list_images()");
        assert_eq!(
            cache_key("images", "list_images", &[], &[]),
            "images.list_images()"
        );
    }

    #[test]
    fn cache_key_distinguishes_arguments() {
        let a = cache_key("stacks", "get_stack", &["web"], &[]);
        let b = cache_key("stacks", "get_stack", &["db"], &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn round_trip_within_ttl() {
        let store = test_store();
        store.set("k1", "v1", 60).unwrap();

        let (remaining, value) = store.get_with_ttl("k1").unwrap().expect("hit expected");
        assert_eq!(value, "v1");
        assert!(remaining <= 60);
    }

    #[test]
    fn expired_entry_is_a_miss_and_deleted() {
        let store = test_store();
        store.set("k1", "v1", 60).unwrap();
        store.backdate("k1", 120);

        assert_eq!(store.get_with_ttl("k1").unwrap(), None);
        // Lazy deletion happened; clearing the exact key removes nothing.
        assert_eq!(store.clear_key("k1").unwrap(), 0);
    }

    #[test]
    fn set_overwrites_and_resets_expiry() {
        let store = test_store();
        store.set("k1", "v1", 60).unwrap();
        store.backdate("k1", 50);
        store.set("k1", "v2", 60).unwrap();

        let (remaining, value) = store.get_with_ttl("k1").unwrap().expect("hit expected");
        assert_eq!(value, "v2");
        assert!(remaining > 50);
    }

    #[test]
    fn clear_namespace_removes_only_matching_prefix() {
        let store = test_store();
        let ka = cache_key("stacks", "list_stacks", &["a"], &[]);
        let kb = cache_key("stacks", "list_stacks", &["b"], &[]);
        let other = cache_key("images", "list_images", &[], &[]);
        store.set(&ka, "va", 60).unwrap();
        store.set(&kb, "vb", 60).unwrap();
        store.set(&other, "vo", 60).unwrap();

        let removed = store
            .clear_namespace(&namespace_prefix("stacks", "list_stacks"))
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.get_with_ttl(&ka).unwrap(), None);
        assert_eq!(store.get_with_ttl(&kb).unwrap(), None);
        assert!(store.get_with_ttl(&other).unwrap().is_some());
    }

    #[test]
    fn whole_namespace_prefix_matches_real_keys() {
        let store = test_store();
        let stacks_list = OP_LIST_STACKS.key(&[], &[]);
        let stacks_get = OP_GET_STACK.key(&["web"], &[]);
        let digest = OP_REMOTE_DIGEST.key(&["ghcr.io/example/app:latest"], &[]);
        store.set(&stacks_list, "v", 60).unwrap();
        store.set(&stacks_get, "v", 60).unwrap();
        store.set(&digest, "v", 60).unwrap();

        let removed = store
            .clear_namespace(&whole_namespace_prefix("stacks"))
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.get_with_ttl(&stacks_list).unwrap(), None);
        assert_eq!(store.get_with_ttl(&stacks_get).unwrap(), None);
        assert!(store.get_with_ttl(&digest).unwrap().is_some());
    }

    #[test]
    fn clear_namespace_escapes_like_wildcards() {
        let store = test_store();
        store.set("stacks.list_stacks(\"a\")", "v", 60).unwrap();
        store.set("stacksXlist_stacks(\"a\")", "v", 60).unwrap();

        // `_` in the prefix must not act as a single-character wildcard.
        let removed = store.clear_namespace("stacks.list_stacks(").unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_with_ttl("stacksXlist_stacks(\"a\")").unwrap().is_some());
    }

    #[test]
    fn fetch_through_miss_computes_and_stores() {
        let store = test_store();
        let outcome = fetch_through(
            &store,
            OP_LIST_STACKS,
            &[],
            &[],
            60,
            CacheBypass::None,
            None,
            || Ok("[1,2]".to_string()),
        )
        .unwrap();

        match outcome {
            CachedOutcome::Value {
                body, from_cache, ..
            } => {
                assert_eq!(body, "[1,2]");
                assert!(!from_cache);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let key = OP_LIST_STACKS.key(&[], &[]);
        assert!(store.get_with_ttl(&key).unwrap().is_some());
    }

    #[test]
    fn fetch_through_hit_skips_producer() {
        let store = test_store();
        let key = OP_LIST_STACKS.key(&[], &[]);
        store.set(&key, "[1]", 60).unwrap();

        let outcome = fetch_through(
            &store,
            OP_LIST_STACKS,
            &[],
            &[],
            60,
            CacheBypass::None,
            None,
            || panic!("producer must not run on a hit"),
        )
        .unwrap();

        match outcome {
            CachedOutcome::Value {
                body, from_cache, ..
            } => {
                assert_eq!(body, "[1]");
                assert!(from_cache);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn fetch_through_matching_etag_returns_not_modified() {
        let store = test_store();
        let key = OP_LIST_STACKS.key(&[], &[]);
        store.set(&key, "[1]", 60).unwrap();
        let etag = etag_for("[1]");

        let outcome = fetch_through(
            &store,
            OP_LIST_STACKS,
            &[],
            &[],
            60,
            CacheBypass::None,
            Some(&etag),
            || panic!("producer must not run on a revalidation hit"),
        )
        .unwrap();

        assert_eq!(outcome, CachedOutcome::NotModified { etag });
    }

    #[test]
    fn no_store_bypass_is_read_only() {
        let store = test_store();
        let outcome = fetch_through(
            &store,
            OP_LIST_STACKS,
            &[],
            &[],
            60,
            CacheBypass::NoStore,
            None,
            || Ok("fresh".to_string()),
        )
        .unwrap();

        assert!(matches!(outcome, CachedOutcome::Value { from_cache: false, .. }));
        let key = OP_LIST_STACKS.key(&[], &[]);
        assert_eq!(store.get_with_ttl(&key).unwrap(), None);
    }

    #[test]
    fn no_cache_bypass_recomputes_and_rewrites() {
        let store = test_store();
        let key = OP_LIST_STACKS.key(&[], &[]);
        store.set(&key, "stale", 60).unwrap();

        let outcome = fetch_through(
            &store,
            OP_LIST_STACKS,
            &[],
            &[],
            60,
            CacheBypass::NoCache,
            None,
            || Ok("fresh".to_string()),
        )
        .unwrap();

        match outcome {
            CachedOutcome::Value { body, .. } => assert_eq!(body, "fresh"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        let (_ttl, stored) = store.get_with_ttl(&key).unwrap().expect("rewritten entry");
        assert_eq!(stored, "fresh");
    }

    #[test]
    fn store_fault_degrades_to_direct_computation() {
        let store = test_store();
        store.close();

        let outcome = fetch_through(
            &store,
            OP_LIST_STACKS,
            &[],
            &[],
            60,
            CacheBypass::None,
            None,
            || Ok("computed".to_string()),
        )
        .unwrap();

        match outcome {
            CachedOutcome::Value {
                body, from_cache, ..
            } => {
                assert_eq!(body, "computed");
                assert!(!from_cache);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn invalidate_listing_caches_clears_every_listing_namespace() {
        let store = test_store();
        for op in LISTING_OPS {
            store.set(&op.key(&["x"], &[]), "v", 60).unwrap();
        }
        let digest_key = OP_REMOTE_DIGEST.key(&["ghcr.io/example/app:latest"], &[]);
        store.set(&digest_key, "{\"digest\":null}", 60).unwrap();

        invalidate_listing_caches(&store);

        for op in LISTING_OPS {
            assert_eq!(store.get_with_ttl(&op.key(&["x"], &[])).unwrap(), None);
        }
        // Registry digests are not a listing namespace and survive.
        assert!(store.get_with_ttl(&digest_key).unwrap().is_some());
    }
}
