use crate::blob_store::BlobStoreLike;
use crate::config::Config;
use crate::csv_export::{finish_gzip_csv, gzip_csv_writer};
use crate::error::ReduceError;
use crate::queue::{JobQueueLike, SEND_BATCH_SIZE};
use crate::stat_writer::AttributeStoreLike;
use humansize::{BINARY, format_size};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tracing::{info, warn};

pub const INPUT_SUFFIX: &str = ".warc.gz";

/// Prefixes from a line-based file. Blank lines are skipped and repeats collapsed.
pub fn read_prefix_file(path: &Path) -> Result<Vec<String>, ReduceError> {
    let text = fs::read_to_string(path)?;
    let mut seen = HashSet::new();
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| seen.insert(line.to_string()))
        .map(str::to_string)
        .collect())
}

/// List input containers under every prefix and queue their keys in batches.
/// Stops as soon as `limit` keys have been queued. A prefix that cannot be listed is
/// skipped. Returns the number queued.
pub fn queue_inputs(
    queue: &dyn JobQueueLike,
    blobs: &dyn BlobStoreLike,
    config: &Config,
    prefixes: &[String],
    limit: Option<usize>,
) -> Result<usize, ReduceError> {
    if prefixes.is_empty() {
        warn!("no prefixes given, nothing queued");
        return Ok(0);
    }

    let mut queued = 0;
    let mut pending: Vec<String> = Vec::with_capacity(SEND_BATCH_SIZE);
    'prefixes: for prefix in prefixes {
        let listing_prefix = config.data_key_prefix(prefix);
        info!(bucket = %config.data_bucket, prefix = %listing_prefix, "listing inputs");
        let objects = match blobs.list(&config.data_bucket, &listing_prefix) {
            Ok(objects) => objects,
            Err(e) => {
                warn!(prefix = %listing_prefix, error = %e, "unable to list inputs, skipping prefix");
                continue;
            }
        };
        for object in objects {
            if !object.key.ends_with(INPUT_SUFFIX) {
                continue;
            }
            if limit.is_some_and(|limit| queued + pending.len() >= limit) {
                break 'prefixes;
            }
            pending.push(object.key);
            if pending.len() == SEND_BATCH_SIZE {
                queued += queue.enqueue_batch(&pending)?;
                pending.clear();
            }
        }
    }
    if !pending.is_empty() {
        queued += queue.enqueue_batch(&pending)?;
    }
    info!(queued, "queued inputs");
    Ok(queued)
}

pub fn clear_queue(queue: &dyn JobQueueLike) -> Result<(), ReduceError> {
    queue.delete_queue()?;
    info!("deleted job queue");
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearReport {
    pub domains: usize,
    pub objects: usize,
}

/// Delete every attribute domain on `threads` workers, and optionally every result and
/// stat shard in the result bucket.
pub fn clear_data(
    store: &dyn AttributeStoreLike,
    blobs: &dyn BlobStoreLike,
    result_bucket: &str,
    include_storage: bool,
    threads: usize,
) -> Result<ClearReport, ReduceError> {
    let domains = store.list_domains()?;
    let deleted = AtomicUsize::new(0);
    let (tx, rx) = crossbeam_channel::unbounded::<String>();
    for domain in domains {
        let _ = tx.send(domain);
    }
    drop(tx);

    thread::scope(|scope| {
        for _ in 0..threads.max(1) {
            let rx = rx.clone();
            let deleted = &deleted;
            scope.spawn(move || {
                for domain in rx.iter() {
                    match store.delete_domain(&domain) {
                        Ok(()) => {
                            info!(domain = %domain, "deleted domain");
                            deleted.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => warn!(domain = %domain, error = %e, "unable to delete domain"),
                    }
                }
            });
        }
    });

    let mut objects = 0;
    if include_storage {
        for prefix in ["data/", "stats/"] {
            for object in blobs.list(result_bucket, prefix)? {
                blobs.delete(result_bucket, &object.key)?;
                objects += 1;
            }
        }
        info!(objects, bucket = %result_bucket, "deleted stored results");
    }

    Ok(ClearReport {
        domains: deleted.load(Ordering::SeqCst),
        objects,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryStats {
    pub files: u64,
    pub size: u64,
}

/// Object count and total size of input containers at every directory level under `prefix`.
pub fn collect_crawl_stats(
    blobs: &dyn BlobStoreLike,
    bucket: &str,
    prefix: &str,
) -> Result<BTreeMap<String, DirectoryStats>, ReduceError> {
    let mut levels: BTreeMap<String, DirectoryStats> = BTreeMap::new();
    for object in blobs.list(bucket, prefix)? {
        if !object.key.ends_with(INPUT_SUFFIX) {
            continue;
        }
        let Some((dirs, _file)) = object.key.rsplit_once('/') else {
            continue;
        };
        let mut path = String::new();
        for part in dirs.split('/') {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(part);
            let entry = levels.entry(path.clone()).or_default();
            entry.files += 1;
            entry.size += object.size;
        }
    }
    Ok(levels)
}

pub fn crawl_stats(blobs: &dyn BlobStoreLike, bucket: &str, prefix: &str, output: &Path) -> Result<usize, ReduceError> {
    let levels = collect_crawl_stats(blobs, bucket, prefix)?;
    let mut writer = gzip_csv_writer(output)?;
    writer.write_record(["bucket", "files", "key", "size", "sizep"])?;
    for (key, stats) in &levels {
        writer.write_record([
            bucket.to_string(),
            stats.files.to_string(),
            key.clone(),
            stats.size.to_string(),
            format_size(stats.size, BINARY.decimal_places(1)),
        ])?;
    }
    finish_gzip_csv(writer)?;
    info!(rows = levels.len(), path = %output.display(), "wrote crawl stats");
    Ok(levels.len())
}

/// Publish the worker artifact where fleet nodes download it. Returns its URL.
pub fn deploy(blobs: &dyn BlobStoreLike, config: &Config, artifact: &Path) -> Result<String, ReduceError> {
    let metadata = fs::metadata(artifact)
        .map_err(|e| ReduceError::Config(format!("cannot read artifact {}: {}", artifact.display(), e)))?;
    if !metadata.is_file() {
        return Err(ReduceError::Config(format!("{} is not a file", artifact.display())));
    }
    blobs.publish_file(&config.deploy_bucket, &config.deploy_filename, artifact)?;
    let url = config.artifact_url();
    info!(url = %url, bytes = metadata.len(), "deployed artifact");
    Ok(url)
}
