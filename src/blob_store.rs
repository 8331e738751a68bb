use crate::error::ReduceError;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobObject {
    pub key: String,
    pub size: u64,
}

pub trait BlobStoreLike: Send + Sync {
    /// All objects whose key starts with `prefix`, in key order.
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<BlobObject>, ReduceError>;
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ReduceError>;
    fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), ReduceError>;
    fn delete(&self, bucket: &str, key: &str) -> Result<(), ReduceError>;

    fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<(), ReduceError> {
        let bytes = fs::read(path)?;
        self.put(bucket, key, bytes)
    }

    /// Upload a file that must be readable anonymously (deployed artifacts).
    fn publish_file(&self, bucket: &str, key: &str, path: &Path) -> Result<(), ReduceError> {
        self.put_file(bucket, key, path)
    }
}

#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BlobStoreLike for InMemoryBlobStore {
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<BlobObject>, ReduceError> {
        Ok(self
            .lock()
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, k), v)| BlobObject {
                key: k.clone(),
                size: v.len() as u64,
            })
            .collect())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ReduceError> {
        self.lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| ReduceError::Storage(format!("no such object {}/{}", bucket, key)))
    }

    fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), ReduceError> {
        self.lock().insert((bucket.to_string(), key.to_string()), bytes);
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), ReduceError> {
        self.lock().remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_filters_bucket_and_prefix() {
        let store = InMemoryBlobStore::new();
        store.put("results", "data/b.gz", vec![1, 2]).unwrap();
        store.put("results", "data/a.gz", vec![1]).unwrap();
        store.put("results", "stats/a.csv.gz", vec![1]).unwrap();
        store.put("other", "data/c.gz", vec![1]).unwrap();

        let listed = store.list("results", "data/").unwrap();
        let keys: Vec<&str> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["data/a.gz", "data/b.gz"]);
        assert_eq!(listed[1].size, 2);
    }

    #[test]
    fn test_get_missing_is_storage_error() {
        let store = InMemoryBlobStore::new();
        assert!(matches!(store.get("b", "k"), Err(ReduceError::Storage(_))));
    }

    #[test]
    fn test_put_file_reads_contents() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("artifact");
        fs::write(&path, b"binary").unwrap();
        let store = InMemoryBlobStore::new();
        store.publish_file("deploy", "worker", &path).unwrap();
        assert_eq!(store.get("deploy", "worker").unwrap(), b"binary");
    }
}
