use crate::blob_store::BlobStoreLike;
use crate::config::Config;
use crate::error::ReduceError;
use crate::multiplexer::{ClosedShard, OutputMultiplexer, ShardNaming};
use crate::queue::{Job, JobQueueLike};
use crate::stat_writer::{Attributes, StatSink};
use crate::supervisor::PoolWorker;
use crate::watchdog::{CancelToken, Watchdog};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const STACKTRACE_LIMIT: usize = 1024;

/// One extracted record. Written as a single line carrying its category token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    pub category: String,
    pub payload: String,
}

impl ResultRecord {
    pub fn new(category: &str, payload: &str) -> Self {
        Self {
            category: category.to_string(),
            payload: payload.to_string(),
        }
    }

    pub fn to_line(&self) -> String {
        let payload = self.payload.replace(['\n', '\r'], " ");
        format!("{} <ex:{}>\n", payload.trim_end(), self.category)
    }
}

/// Per-page stat rows returned by an extractor. Shipped as one CSV shard per job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageStats {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub records: Vec<ResultRecord>,
    pub counters: BTreeMap<String, u64>,
    pub pages_total: u64,
    pub pages_errors: u64,
    pub page_stats: Option<PageStats>,
}

pub struct JobContext {
    pub body_key: String,
    pub receive_count: u32,
    /// Cancelled when the iteration deadline passes. Long extractions should check it.
    pub token: CancelToken,
}

/// Turns one input container into result records. Everything page-level lives behind this.
pub trait Extractor: Send + Sync {
    fn extract(&self, job: &JobContext, input: &[u8]) -> Result<Extraction, ReduceError>;
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub data_bucket: String,
    pub result_bucket: String,
    pub retry_limit: u32,
    pub visibility_timeout: Duration,
    pub shard_size_limit: u64,
    pub result_extension: String,
    pub scratch_dir: PathBuf,
    pub node: String,
    /// Pause after an iteration failed on infrastructure, before fetching again.
    pub error_pause: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config, scratch_dir: &Path) -> Self {
        Self {
            data_bucket: config.data_bucket.clone(),
            result_bucket: config.result_bucket.clone(),
            retry_limit: config.job_retry_limit,
            visibility_timeout: config.job_time_limit(),
            shard_size_limit: config.shard_size_limit_bytes(),
            result_extension: config.result_extension.clone(),
            scratch_dir: scratch_dir.to_path_buf(),
            node: node_name(),
            error_pause: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    Idle,
    Quarantined,
    Completed,
    Failed,
}

pub fn node_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// File name of an input key without directories or the container suffix.
pub fn input_stem(body_key: &str) -> String {
    let name = body_key.rsplit('/').next().unwrap_or(body_key);
    name.split(".warc").next().unwrap_or(name).to_string()
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

pub struct WorkerLoop {
    queue: Arc<dyn JobQueueLike>,
    blobs: Arc<dyn BlobStoreLike>,
    extractor: Arc<dyn Extractor>,
    data_stats: Arc<dyn StatSink>,
    error_stats: Arc<dyn StatSink>,
    settings: WorkerSettings,
    watchdog: Arc<Watchdog>,
}

impl WorkerLoop {
    pub fn new(
        queue: Arc<dyn JobQueueLike>,
        blobs: Arc<dyn BlobStoreLike>,
        extractor: Arc<dyn Extractor>,
        data_stats: Arc<dyn StatSink>,
        error_stats: Arc<dyn StatSink>,
        settings: WorkerSettings,
        watchdog: Arc<Watchdog>,
    ) -> Self {
        Self {
            queue,
            blobs,
            extractor,
            data_stats,
            error_stats,
            settings,
            watchdog,
        }
    }

    /// Loop until the watchdog cancels this loop or a stat writer gives up.
    pub fn run(&self) -> Result<(), ReduceError> {
        info!(node = %self.settings.node, "worker loop started");
        loop {
            match self.run_once() {
                Ok(_) => {}
                Err(e @ ReduceError::AttributeStore(_)) => {
                    error!(error = %e, "stat writer failed, stopping worker loop");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "worker iteration failed");
                    std::thread::sleep(self.settings.error_pause);
                }
            }
            if self.watchdog.token().is_cancelled() {
                self.watchdog.disarm();
                warn!("worker loop abandoned after its deadline passed");
                return Ok(());
            }
        }
    }

    /// One pass through fetch, quarantine check, process, persist and ack.
    pub fn run_once(&self) -> Result<IterationOutcome, ReduceError> {
        let token = self.watchdog.arm();
        let Some(job) = self.queue.receive_one(self.settings.visibility_timeout)? else {
            return Ok(IterationOutcome::Idle);
        };

        if job.receive_count > self.settings.retry_limit {
            self.quarantine(&job)?;
            return Ok(IterationOutcome::Quarantined);
        }

        info!(file = %job.body_key, receive_count = job.receive_count, "now working on job");
        let started = Instant::now();
        let outcome = self.process(&job, &token).and_then(|(extraction, size)| {
            token.check("persist")?;
            self.persist_outputs(&job, &extraction)?;
            Ok((extraction, size))
        });

        match outcome {
            Ok((extraction, size)) => {
                self.record_success(&job, &extraction, size, started.elapsed())?;
                token.check("ack")?;
                self.queue.ack(&job)?;
                info!(file = %job.body_key, records = extraction.records.len(), "finished processing job");
                Ok(IterationOutcome::Completed)
            }
            Err(e) => {
                warn!(file = %job.body_key, error = %e, "unable to finish processing");
                self.record_failure(&job.body_key, &e)?;
                Ok(IterationOutcome::Failed)
            }
        }
    }

    fn quarantine(&self, job: &Job) -> Result<(), ReduceError> {
        warn!(file = %job.body_key, receive_count = job.receive_count, "discarding message");
        self.queue.ack(job)?;

        let mut stat = Attributes::new();
        stat.insert("message".to_string(), "Discarded".to_string());
        stat.insert("node".to_string(), self.settings.node.clone());
        stat.insert("file".to_string(), job.body_key.clone());
        stat.insert("datetime".to_string(), timestamp());
        self.error_stats.add(&Uuid::new_v4().to_string(), stat)?;
        self.error_stats.flush()
    }

    #[instrument(skip_all, fields(file = %job.body_key))]
    fn process(&self, job: &Job, token: &CancelToken) -> Result<(Extraction, u64), ReduceError> {
        let input = self.blobs.get(&self.settings.data_bucket, &job.body_key)?;
        token.check("fetch")?;
        let context = JobContext {
            body_key: job.body_key.clone(),
            receive_count: job.receive_count,
            token: token.clone(),
        };
        let extraction = self.extractor.extract(&context, &input)?;
        Ok((extraction, input.len() as u64))
    }

    /// Upload result shards and page stats. The job's scratch directory is removed afterwards
    /// whether or not this succeeded.
    fn persist_outputs(&self, job: &Job, extraction: &Extraction) -> Result<(), ReduceError> {
        let stem = input_stem(&job.body_key);
        let scratch = self.settings.scratch_dir.join(format!("job-{}", Uuid::new_v4()));
        let uploaded = self.write_result_shards(&stem, &scratch, extraction);
        if let Err(e) = fs::remove_dir_all(&scratch) {
            warn!(path = %scratch.display(), error = %e, "unable to remove scratch directory");
        }
        let shards = uploaded?;

        if let Some(page_stats) = &extraction.page_stats {
            let key = format!("stats/{}.csv.gz", stem);
            self.blobs.put(&self.settings.result_bucket, &key, page_stats_csv(page_stats)?)?;
        }
        info!(file = %job.body_key, shards, "uploaded results");
        Ok(())
    }

    fn write_result_shards(&self, stem: &str, scratch: &Path, extraction: &Extraction) -> Result<usize, ReduceError> {
        let naming = ShardNaming::new(stem, &self.settings.result_extension);
        let mut mux = OutputMultiplexer::new(scratch, naming, self.settings.shard_size_limit)?;
        let mut uploaded = 0;
        for record in &extraction.records {
            if let Some(closed) = mux.write(&record.category, record.to_line().as_bytes())? {
                self.upload_shard(&closed)?;
                uploaded += 1;
            }
        }
        for closed in mux.close_all()? {
            self.upload_shard(&closed)?;
            uploaded += 1;
        }
        Ok(uploaded)
    }

    fn upload_shard(&self, shard: &ClosedShard) -> Result<(), ReduceError> {
        let name = shard
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ReduceError::Other(format!("bad shard path {}", shard.path.display())))?;
        let key = format!("data/{}", name);
        self.blobs.put_file(&self.settings.result_bucket, &key, &shard.path)?;
        fs::remove_file(&shard.path)?;
        Ok(())
    }

    fn record_success(&self, job: &Job, extraction: &Extraction, size: u64, elapsed: Duration) -> Result<(), ReduceError> {
        let duration = elapsed.as_secs_f64();
        let rate = if duration > 0.0 {
            extraction.pages_total as f64 / duration
        } else {
            0.0
        };

        let mut stat: Attributes = extraction
            .counters
            .iter()
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect();
        stat.insert("duration".to_string(), duration.to_string());
        stat.insert("rate".to_string(), rate.to_string());
        stat.insert("pagesTotal".to_string(), extraction.pages_total.to_string());
        stat.insert("pagesErrors".to_string(), extraction.pages_errors.to_string());
        stat.insert("size".to_string(), size.to_string());

        info!(
            file = %job.body_key,
            pages = extraction.pages_total,
            duration,
            rate,
            "extracted data"
        );
        self.data_stats.add(&job.body_key, stat)?;
        self.data_stats.flush()
    }

    fn record_failure(&self, body_key: &str, err: &ReduceError) -> Result<(), ReduceError> {
        let mut stat = Attributes::new();
        stat.insert("exception".to_string(), err.kind().to_string());
        stat.insert("message".to_string(), err.to_string());
        stat.insert("stacktrace".to_string(), truncate_chars(&format!("{:?}", err), STACKTRACE_LIMIT));
        stat.insert("node".to_string(), self.settings.node.clone());
        stat.insert("file".to_string(), body_key.to_string());
        stat.insert("datetime".to_string(), timestamp());
        self.error_stats.add(&Uuid::new_v4().to_string(), stat)?;
        self.error_stats.flush()
    }
}

impl PoolWorker for WorkerLoop {
    fn run(self: Box<Self>) -> Result<(), ReduceError> {
        WorkerLoop::run(&self)
    }
}

fn page_stats_csv(stats: &PageStats) -> Result<Vec<u8>, ReduceError> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(GzEncoder::new(Vec::new(), Compression::default()));
    writer.write_record(&stats.header)?;
    for row in &stats.rows {
        writer.write_record(row)?;
    }
    let encoder = writer
        .into_inner()
        .map_err(|e| ReduceError::Other(format!("unable to finish stats csv: {}", e)))?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::InMemoryBlobStore;
    use crate::queue::InMemoryQueue;
    use crate::retry::RetryPolicy;
    use crate::stat_writer::{InMemoryAttributeStore, StatWriter};
    use flate2::read::GzDecoder;
    use std::io::Read;

    struct FixedExtractor;

    impl Extractor for FixedExtractor {
        fn extract(&self, _job: &JobContext, input: &[u8]) -> Result<Extraction, ReduceError> {
            let text = String::from_utf8_lossy(input);
            if text.contains("poison") {
                return Err(ReduceError::Extraction("unparseable input".into()));
            }
            let mut extraction = Extraction::default();
            for word in text.split_whitespace() {
                extraction.records.push(ResultRecord::new("words", word));
            }
            extraction.counters.insert("tables".to_string(), 2);
            extraction.pages_total = 3;
            extraction.page_stats = Some(PageStats {
                header: vec!["url".into(), "tables".into()],
                rows: vec![vec!["http://a".into(), "2".into()]],
            });
            Ok(extraction)
        }
    }

    struct Fixture {
        queue: Arc<InMemoryQueue>,
        blobs: Arc<InMemoryBlobStore>,
        store: Arc<InMemoryAttributeStore>,
        worker: WorkerLoop,
        _scratch: tempfile::TempDir,
    }

    fn fixture(retry_limit: u32) -> Fixture {
        let queue = Arc::new(InMemoryQueue::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let store = Arc::new(InMemoryAttributeStore::new());
        let policy = RetryPolicy::new(2, Duration::ZERO);
        let data_stats = Arc::new(StatWriter::open(store.clone(), "data", 24, policy).unwrap());
        let error_stats = Arc::new(StatWriter::open(store.clone(), "failed", 24, policy).unwrap());
        let scratch = tempfile::tempdir().unwrap();
        let settings = WorkerSettings {
            data_bucket: "commoncrawl".into(),
            result_bucket: "results".into(),
            retry_limit,
            visibility_timeout: Duration::from_secs(60),
            shard_size_limit: 1024,
            result_extension: "json".into(),
            scratch_dir: scratch.path().to_path_buf(),
            node: "node-1".into(),
            error_pause: Duration::ZERO,
        };
        let worker = WorkerLoop::new(
            queue.clone(),
            blobs.clone(),
            Arc::new(FixedExtractor),
            data_stats,
            error_stats,
            settings,
            Arc::new(Watchdog::new(Duration::from_secs(60))),
        );
        Fixture {
            queue,
            blobs,
            store,
            worker,
            _scratch: scratch,
        }
    }

    fn gunzip(bytes: &[u8]) -> String {
        let mut out = String::new();
        GzDecoder::new(bytes).read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn test_input_stem() {
        assert_eq!(input_stem("crawl-data/seg/warc/CC-MAIN-01.warc.gz"), "CC-MAIN-01");
        assert_eq!(input_stem("plain.gz"), "plain.gz");
    }

    #[test]
    fn test_result_line_carries_category() {
        let line = ResultRecord::new("tables", "{\"a\":1}\n").to_line();
        assert_eq!(line, "{\"a\":1} <ex:tables>\n");
    }

    #[test]
    fn test_idle_when_queue_empty() {
        let f = fixture(3);
        assert_eq!(f.worker.run_once().unwrap(), IterationOutcome::Idle);
    }

    #[test]
    fn test_completed_job_persists_and_acks() {
        let f = fixture(3);
        f.blobs.put("commoncrawl", "in/a.warc.gz", b"alpha beta".to_vec()).unwrap();
        f.queue.enqueue_batch(&["in/a.warc.gz".to_string()]).unwrap();

        assert_eq!(f.worker.run_once().unwrap(), IterationOutcome::Completed);
        assert!(f.queue.is_empty());

        let shard = f.blobs.get("results", "data/a.words.0.json.gz").unwrap();
        assert_eq!(gunzip(&shard), "alpha <ex:words>\nbeta <ex:words>\n\n");
        let stats = gunzip(&f.blobs.get("results", "stats/a.csv.gz").unwrap());
        assert!(stats.starts_with("url,tables\n"));

        let rows = f.store.rows("data");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "in/a.warc.gz");
        assert_eq!(rows[0].attributes["tables"], "2");
        assert_eq!(rows[0].attributes["pagesTotal"], "3");
        assert_eq!(rows[0].attributes["size"], "10");
        assert!(rows[0].attributes.contains_key("rate"));
    }

    #[test]
    fn test_failed_job_is_recorded_and_left_queued() {
        let f = fixture(3);
        f.blobs.put("commoncrawl", "in/p.warc.gz", b"poison".to_vec()).unwrap();
        f.queue.enqueue_batch(&["in/p.warc.gz".to_string()]).unwrap();

        assert_eq!(f.worker.run_once().unwrap(), IterationOutcome::Failed);
        assert_eq!(f.queue.len(), 1);

        let errors = f.store.rows("failed");
        assert_eq!(errors.len(), 1);
        let row = &errors[0].attributes;
        assert_eq!(row["exception"], "ExtractionError");
        assert_eq!(row["file"], "in/p.warc.gz");
        assert_eq!(row["node"], "node-1");
        assert!(row["stacktrace"].chars().count() <= STACKTRACE_LIMIT);
    }

    #[test]
    fn test_missing_input_routes_to_failure() {
        let f = fixture(3);
        f.queue.enqueue_batch(&["in/missing.warc.gz".to_string()]).unwrap();
        assert_eq!(f.worker.run_once().unwrap(), IterationOutcome::Failed);
        assert_eq!(f.store.rows("failed")[0].attributes["exception"], "StorageError");
    }

    #[test]
    fn test_poison_job_quarantined_once() {
        let f = fixture(2);
        f.blobs.put("commoncrawl", "in/p.warc.gz", b"poison".to_vec()).unwrap();
        f.queue.enqueue_batch(&["in/p.warc.gz".to_string()]).unwrap();

        for _ in 0..2 {
            assert_eq!(f.worker.run_once().unwrap(), IterationOutcome::Failed);
            f.queue.expire_in_flight();
        }
        assert_eq!(f.worker.run_once().unwrap(), IterationOutcome::Quarantined);
        assert!(f.queue.is_empty());
        assert_eq!(f.worker.run_once().unwrap(), IterationOutcome::Idle);

        let discards: Vec<_> = f
            .store
            .rows("failed")
            .into_iter()
            .filter(|r| r.attributes.get("message").map(String::as_str) == Some("Discarded"))
            .collect();
        assert_eq!(discards.len(), 1);
        assert_eq!(discards[0].attributes["file"], "in/p.warc.gz");
    }

    #[test]
    fn test_cancelled_token_skips_persist() {
        let f = fixture(3);
        f.blobs.put("commoncrawl", "in/a.warc.gz", b"alpha".to_vec()).unwrap();
        f.queue.enqueue_batch(&["in/a.warc.gz".to_string()]).unwrap();
        f.worker.watchdog.token().cancel();

        assert_eq!(f.worker.run_once().unwrap(), IterationOutcome::Failed);
        assert_eq!(f.queue.len(), 1);
        assert!(f.blobs.keys("results").is_empty());
        assert_eq!(f.store.rows("failed")[0].attributes["exception"], "Cancelled");
    }

    #[test]
    fn test_run_exits_once_cancelled() {
        let f = fixture(3);
        f.worker.watchdog.token().cancel();
        f.worker.run().unwrap();
    }
}
