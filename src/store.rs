//! Persistence for bucket instance state.
//!
//! - [`KvStore`]: the ordered byte-key store collaborator (get/put/delete/prefix scan).
//! - [`InMemoryKvStore`]: a `BTreeMap` backend for tests and single-process use.
//! - [`BucketStore`]: one bucket type's namespace over a shared `KvStore`.
//!
//! Keys are laid out as `0xFF <type> 0xFF <instance>`. `0xFF` never occurs in
//! UTF-8, so types cannot collide and a prefix scan never leaves its type.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::bucket::InstanceState;
use crate::error::LimitdError;

const SEPARATOR: u8 = 0xFF;

/// Abstract ordered key-value store.
///
/// Implementations must return `scan_prefix` results in ascending key order.
/// No retries or caching are expected at this layer; errors surface as-is.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch the value stored under `key`.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Store `value` under `key`, overwriting.
    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), Self::Error>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &[u8]) -> Result<(), Self::Error>;

    /// All entries whose key starts with `prefix`, ascending.
    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Self::Error>;

    /// At most `limit` entries under `prefix` with keys strictly after `after`, ascending.
    ///
    /// The default filters a full [`scan_prefix`](Self::scan_prefix); backends with
    /// native range reads should override it so memory stays bounded by `limit`.
    async fn scan_page(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Self::Error> {
        let rows = self.scan_prefix(prefix).await?;
        Ok(rows
            .into_iter()
            .filter(|(key, _)| after.map_or(true, |after| key.as_slice() > after))
            .take(limit)
            .collect())
    }
}

/// Simple in-memory ordered store.
#[derive(Default, Clone, Debug)]
pub struct InMemoryKvStore {
    data: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys across all namespaces.
    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    type Error = std::convert::Infallible;

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error> {
        let guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), Self::Error> {
        let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        guard.insert(key.to_vec(), value);
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<(), Self::Error> {
        let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        guard.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Self::Error> {
        let guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn scan_page(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Self::Error> {
        let start = match after {
            Some(after) => Bound::Excluded(after.to_vec()),
            None => Bound::Included(prefix.to_vec()),
        };
        let guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard
            .range((start, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Namespace of one bucket type over a shared [`KvStore`].
#[derive(Debug)]
pub struct BucketStore<S> {
    bucket: String,
    namespace: Vec<u8>,
    db: Arc<S>,
}

impl<S: KvStore> BucketStore<S> {
    /// Scope `db` to the bucket type `bucket`.
    pub fn new(bucket: impl Into<String>, db: Arc<S>) -> Self {
        let bucket = bucket.into();
        Self { namespace: namespace_of(&bucket), bucket, db }
    }

    /// Bucket type this store is scoped to.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Full byte key for `instance`.
    pub fn key(&self, instance: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.namespace.len() + instance.len());
        key.extend_from_slice(&self.namespace);
        key.extend_from_slice(instance.as_bytes());
        key
    }

    /// Inverse of [`key`](Self::key); `None` for keys outside this namespace.
    pub fn instance_of<'k>(&self, key: &'k [u8]) -> Option<&'k str> {
        key.strip_prefix(self.namespace.as_slice()).and_then(|rest| std::str::from_utf8(rest).ok())
    }

    pub async fn get(&self, instance: &str) -> Result<Option<InstanceState>, LimitdError> {
        let raw = self
            .db
            .get(&self.key(instance))
            .await
            .map_err(|e| LimitdError::storage(&self.bucket, e))?;
        raw.map(|bytes| self.decode(instance, &bytes)).transpose()
    }

    pub async fn put(&self, instance: &str, state: &InstanceState) -> Result<(), LimitdError> {
        let bytes = serde_json::to_vec(state).map_err(|e| self.corrupt(instance, e))?;
        self.db.put(&self.key(instance), bytes).await.map_err(|e| LimitdError::storage(&self.bucket, e))
    }

    pub async fn delete(&self, instance: &str) -> Result<(), LimitdError> {
        self.db.delete(&self.key(instance)).await.map_err(|e| LimitdError::storage(&self.bucket, e))
    }

    /// Every instance whose id starts with `prefix`, ascending by id.
    pub async fn scan(&self, prefix: &str) -> Result<Vec<(String, InstanceState)>, LimitdError> {
        let rows = self
            .db
            .scan_prefix(&self.key(prefix))
            .await
            .map_err(|e| LimitdError::storage(&self.bucket, e))?;
        self.decode_rows(rows)
    }

    /// Up to `limit` instances of this type with ids strictly after `after`, ascending.
    ///
    /// Passing the last id of one page as `after` yields the next page.
    pub async fn scan_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, InstanceState)>, LimitdError> {
        let after = after.map(|instance| self.key(instance));
        let rows = self
            .db
            .scan_page(&self.namespace, after.as_deref(), limit)
            .await
            .map_err(|e| LimitdError::storage(&self.bucket, e))?;
        self.decode_rows(rows)
    }

    fn decode_rows(&self, rows: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Vec<(String, InstanceState)>, LimitdError> {
        let mut out = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let Some(instance) = self.instance_of(&key) else {
                continue;
            };
            let state = self.decode(instance, &value)?;
            out.push((instance.to_string(), state));
        }
        Ok(out)
    }

    fn decode(&self, instance: &str, bytes: &[u8]) -> Result<InstanceState, LimitdError> {
        serde_json::from_slice(bytes).map_err(|e| self.corrupt(instance, e))
    }

    fn corrupt(&self, instance: &str, source: serde_json::Error) -> LimitdError {
        LimitdError::Corrupt { bucket: self.bucket.clone(), instance: instance.to_string(), source }
    }
}

fn namespace_of(bucket: &str) -> Vec<u8> {
    let mut ns = Vec::with_capacity(bucket.len() + 2);
    ns.push(SEPARATOR);
    ns.extend_from_slice(bucket.as_bytes());
    ns.push(SEPARATOR);
    ns
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(remaining: u64) -> InstanceState {
        InstanceState { remaining, last_drip: 1_000 }
    }

    #[test]
    fn keys_are_namespaced_per_type() {
        let db = Arc::new(InMemoryKvStore::new());
        let ip = BucketStore::new("ip", db.clone());
        assert_eq!(ip.key("1.2.3.4"), b"\xffip\xff1.2.3.4".to_vec());
        assert_eq!(ip.instance_of(b"\xffip\xff1.2.3.4"), Some("1.2.3.4"));
        assert_eq!(ip.instance_of(b"\xffipv6\xff::1"), None);
    }

    #[tokio::test]
    async fn get_put_delete_round_trip() {
        let db = Arc::new(InMemoryKvStore::new());
        let ip = BucketStore::new("ip", db.clone());
        assert_eq!(ip.get("a").await.unwrap(), None);
        ip.put("a", &state(4)).await.unwrap();
        assert_eq!(ip.get("a").await.unwrap(), Some(state(4)));
        ip.delete("a").await.unwrap();
        assert_eq!(ip.get("a").await.unwrap(), None);
        assert!(db.is_empty());
    }

    #[tokio::test]
    async fn scan_is_ordered_and_confined_to_type() {
        let db = Arc::new(InMemoryKvStore::new());
        let ip = BucketStore::new("ip", db.clone());
        let ipv6 = BucketStore::new("ipv6", db.clone());
        ip.put("class1|b", &state(2)).await.unwrap();
        ip.put("class1|a", &state(1)).await.unwrap();
        ip.put("class2|a", &state(3)).await.unwrap();
        ipv6.put("class1|z", &state(9)).await.unwrap();

        let rows = ip.scan("class1").await.unwrap();
        let ids: Vec<_> = rows.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["class1|a", "class1|b"]);
        assert_eq!(ip.scan("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn pages_walk_the_namespace_in_order() {
        let db = Arc::new(InMemoryKvStore::new());
        let ip = BucketStore::new("ip", db.clone());
        let ipv6 = BucketStore::new("ipv6", db.clone());
        for id in ["e", "a", "d", "b", "c"] {
            ip.put(id, &state(1)).await.unwrap();
        }
        ipv6.put("0", &state(1)).await.unwrap();

        let mut seen = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = ip.scan_page(after.as_deref(), 2).await.unwrap();
            assert!(page.len() <= 2);
            let Some((last, _)) = page.last() else { break };
            after = Some(last.clone());
            seen.extend(page.into_iter().map(|(id, _)| id));
        }
        assert_eq!(seen, ["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn default_paging_filters_a_full_scan() {
        /// Delegates everything but `scan_page`, so the trait default is used.
        #[derive(Debug, Default)]
        struct PlainScan(InMemoryKvStore);

        #[async_trait]
        impl KvStore for PlainScan {
            type Error = std::convert::Infallible;
            async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error> {
                self.0.get(key).await
            }
            async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), Self::Error> {
                self.0.put(key, value).await
            }
            async fn delete(&self, key: &[u8]) -> Result<(), Self::Error> {
                self.0.delete(key).await
            }
            async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Self::Error> {
                self.0.scan_prefix(prefix).await
            }
        }

        let ip = BucketStore::new("ip", Arc::new(PlainScan::default()));
        for id in ["a", "b", "c"] {
            ip.put(id, &state(1)).await.unwrap();
        }
        let page = ip.scan_page(Some("a"), 1).await.unwrap();
        assert_eq!(page, vec![("b".to_string(), state(1))]);
    }

    #[tokio::test]
    async fn undecodable_record_is_reported_as_storage_error() {
        let db = Arc::new(InMemoryKvStore::new());
        let ip = BucketStore::new("ip", db.clone());
        db.put(&ip.key("bad"), b"not json".to_vec()).await.unwrap();
        let err = ip.get("bad").await.unwrap_err();
        assert!(err.is_storage());
        assert!(matches!(err, LimitdError::Corrupt { ref instance, .. } if instance == "bad"));
    }
}
