use crate::error::ReduceError;
use crate::retry::RetryPolicy;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

pub type Attributes = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatRecord {
    pub key: String,
    pub attributes: Attributes,
}

/// Schema-less key/attribute-map rows grouped into named domains.
pub trait AttributeStoreLike: Send + Sync {
    fn list_domains(&self) -> Result<Vec<String>, ReduceError>;
    fn create_domain(&self, domain: &str) -> Result<(), ReduceError>;
    fn delete_domain(&self, domain: &str) -> Result<(), ReduceError>;
    fn batch_put(&self, domain: &str, records: &[StatRecord]) -> Result<(), ReduceError>;
    fn scan(&self, domain: &str) -> Result<Vec<StatRecord>, ReduceError>;
}

/// Where workers send stat rows.
pub trait StatSink: Send + Sync {
    fn add(&self, key: &str, attributes: Attributes) -> Result<(), ReduceError>;
    fn flush(&self) -> Result<(), ReduceError>;
}

/// Write-back cache in front of an attribute store domain.
///
/// Rows are keyed by `key` (last write wins) and sent as one batch whenever the cache
/// reaches `capacity` or `flush` is called. A flush that exhausts its retries still
/// clears the cache and returns an error; the writer should be discarded after that.
pub struct StatWriter {
    store: Arc<dyn AttributeStoreLike>,
    domain: String,
    capacity: usize,
    policy: RetryPolicy,
    cache: Mutex<HashMap<String, Attributes>>,
}

impl StatWriter {
    pub fn open(
        store: Arc<dyn AttributeStoreLike>,
        domain: &str,
        capacity: usize,
        policy: RetryPolicy,
    ) -> Result<Self, ReduceError> {
        policy
            .run(&format!("ensure domain {}", domain), || {
                if !store.list_domains()?.iter().any(|d| d == domain) {
                    store.create_domain(domain)?;
                    info!(domain, "created attribute domain");
                }
                Ok(())
            })
            .map_err(|e| ReduceError::AttributeStore(format!("unable to open domain {}: {}", domain, e)))?;

        Ok(Self {
            store,
            domain: domain.to_string(),
            capacity: capacity.max(1),
            policy,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn cached(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Attributes>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn flush_locked(&self, cache: &mut HashMap<String, Attributes>) -> Result<(), ReduceError> {
        if cache.is_empty() {
            return Ok(());
        }
        let records: Vec<StatRecord> = cache
            .iter()
            .map(|(key, attributes)| StatRecord {
                key: key.clone(),
                attributes: attributes.clone(),
            })
            .collect();

        let outcome = self
            .policy
            .run(&format!("batch put to {}", self.domain), || self.store.batch_put(&self.domain, &records));
        cache.clear();

        match outcome {
            Ok(()) => {
                debug!(domain = %self.domain, rows = records.len(), "flushed stats");
                Ok(())
            }
            Err(e) => {
                let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
                error!(domain = %self.domain, dropped = ?keys, "dropping stat rows after exhausting retries");
                Err(ReduceError::AttributeStore(format!(
                    "unable to write {} rows to {}: {}",
                    records.len(),
                    self.domain,
                    e
                )))
            }
        }
    }
}

impl StatSink for StatWriter {
    fn add(&self, key: &str, attributes: Attributes) -> Result<(), ReduceError> {
        let mut cache = self.lock();
        cache.insert(key.to_string(), attributes);
        if cache.len() >= self.capacity {
            self.flush_locked(&mut cache)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), ReduceError> {
        let mut cache = self.lock();
        self.flush_locked(&mut cache)
    }
}

#[derive(Default)]
struct MemoryDomains {
    domains: BTreeMap<String, BTreeMap<String, Attributes>>,
    batch_sizes: Vec<usize>,
    failures_left: u32,
}

/// In-process attribute store. `fail_next` injects transient batch-put failures.
#[derive(Default)]
pub struct InMemoryAttributeStore {
    inner: Mutex<MemoryDomains>,
}

impl InMemoryAttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, times: u32) {
        self.lock().failures_left = times;
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().batch_sizes.clone()
    }

    pub fn rows(&self, domain: &str) -> Vec<StatRecord> {
        self.scan(domain).unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryDomains> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AttributeStoreLike for InMemoryAttributeStore {
    fn list_domains(&self) -> Result<Vec<String>, ReduceError> {
        Ok(self.lock().domains.keys().cloned().collect())
    }

    fn create_domain(&self, domain: &str) -> Result<(), ReduceError> {
        self.lock().domains.entry(domain.to_string()).or_default();
        Ok(())
    }

    fn delete_domain(&self, domain: &str) -> Result<(), ReduceError> {
        self.lock().domains.remove(domain);
        Ok(())
    }

    fn batch_put(&self, domain: &str, records: &[StatRecord]) -> Result<(), ReduceError> {
        let mut inner = self.lock();
        if inner.failures_left > 0 {
            inner.failures_left -= 1;
            return Err(ReduceError::AttributeStore("service unavailable".into()));
        }
        inner.batch_sizes.push(records.len());
        let rows = inner
            .domains
            .get_mut(domain)
            .ok_or_else(|| ReduceError::AttributeStore(format!("no such domain {}", domain)))?;
        for record in records {
            rows.insert(record.key.clone(), record.attributes.clone());
        }
        Ok(())
    }

    fn scan(&self, domain: &str) -> Result<Vec<StatRecord>, ReduceError> {
        let inner = self.lock();
        let rows = inner
            .domains
            .get(domain)
            .ok_or_else(|| ReduceError::AttributeStore(format!("no such domain {}", domain)))?;
        Ok(rows
            .iter()
            .map(|(key, attributes)| StatRecord {
                key: key.clone(),
                attributes: attributes.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn attrs(value: &str) -> Attributes {
        let mut a = Attributes::new();
        a.insert("value".to_string(), value.to_string());
        a
    }

    fn writer(store: &Arc<InMemoryAttributeStore>, capacity: usize, tries: u32) -> StatWriter {
        StatWriter::open(store.clone(), "data", capacity, RetryPolicy::new(tries, Duration::ZERO)).unwrap()
    }

    #[test]
    fn test_open_creates_missing_domain() {
        let store = Arc::new(InMemoryAttributeStore::new());
        let w = writer(&store, 24, 3);
        assert_eq!(w.domain(), "data");
        assert_eq!(store.list_domains().unwrap(), vec!["data".to_string()]);
    }

    #[test]
    fn test_cache_never_exceeds_capacity() {
        let store = Arc::new(InMemoryAttributeStore::new());
        let w = writer(&store, 4, 3);
        for i in 0..10 {
            w.add(&format!("k{}", i), attrs("x")).unwrap();
            assert!(w.cached() < 4);
        }
        assert_eq!(store.batch_sizes(), vec![4, 4]);
        w.flush().unwrap();
        assert_eq!(w.cached(), 0);
        assert_eq!(store.rows("data").len(), 10);
    }

    #[test]
    fn test_last_write_wins_within_cache() {
        let store = Arc::new(InMemoryAttributeStore::new());
        let w = writer(&store, 24, 3);
        w.add("same", attrs("first")).unwrap();
        w.add("same", attrs("second")).unwrap();
        w.flush().unwrap();
        let rows = store.rows("data");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].attributes["value"], "second");
    }

    #[test]
    fn test_flush_retries_transient_failures() {
        let store = Arc::new(InMemoryAttributeStore::new());
        let w = writer(&store, 24, 5);
        w.add("k", attrs("v")).unwrap();
        store.fail_next(3);
        w.flush().unwrap();
        assert_eq!(store.rows("data").len(), 1);
    }

    #[test]
    fn test_exhausted_flush_clears_cache_and_errors() {
        let store = Arc::new(InMemoryAttributeStore::new());
        let w = writer(&store, 24, 2);
        w.add("k", attrs("v")).unwrap();
        store.fail_next(5);
        let err = w.flush().unwrap_err();
        assert!(matches!(err, ReduceError::AttributeStore(_)));
        assert_eq!(w.cached(), 0);
        assert!(store.rows("data").is_empty());
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let store = Arc::new(InMemoryAttributeStore::new());
        let w = writer(&store, 24, 1);
        w.flush().unwrap();
        assert!(store.batch_sizes().is_empty());
    }
}
