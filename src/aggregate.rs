use crate::blob_store::{BlobObject, BlobStoreLike};
use crate::csv_export::export_domains;
use crate::error::ReduceError;
use crate::multiplexer::{ClosedShard, OutputMultiplexer, ShardNaming};
use crate::stat_writer::AttributeStoreLike;
use crossbeam_channel::Sender;
use flate2::read::GzDecoder;
use humansize::{BINARY, format_size};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use tracing::{info, warn};

pub const RESULT_PREFIX: &str = "data/";
pub const STATS_PREFIX: &str = "stats/";
pub const PAGE_STATS_CATEGORY: &str = "pages";

const CATEGORY_OPEN: &str = "<ex:";

/// Split a result line into its category and the rest of the line.
///
/// The category is the first space-separated token of the form `<ex:NAME>`; the payload is
/// the line with that token (and the space joining it) removed.
pub fn parse_line(line: &str) -> Option<(String, String)> {
    let mut offset = 0;
    for token in line.split(' ') {
        if let Some(tail) = token.strip_prefix(CATEGORY_OPEN) {
            let name = tail.strip_suffix('>')?;
            if name.is_empty() || name.contains(['/', '\\', '<', '>']) || name == "." || name == ".." {
                return None;
            }
            let before = line[..offset].trim_end_matches(' ');
            let after = line[offset + token.len()..].trim_start_matches(' ');
            let payload = if before.is_empty() || after.is_empty() {
                format!("{}{}", before, after)
            } else {
                format!("{} {}", before, after)
            };
            return Some((name.to_string(), payload));
        }
        offset += token.len() + 1;
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sequential,
    /// One task per object, at most `max_outstanding` running at once.
    Parallel { max_outstanding: usize },
}

impl ExecutionMode {
    pub fn parallel() -> Self {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        ExecutionMode::Parallel { max_outstanding: cores }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub objects: usize,
    pub failed_objects: usize,
    pub lines_written: u64,
    pub lines_dropped: u64,
    /// Final location of every finished shard, mirrored ones included.
    pub shards: Vec<PathBuf>,
}

#[derive(Default)]
struct MergeCounters {
    failed_objects: AtomicUsize,
    lines_written: AtomicU64,
    lines_dropped: AtomicU64,
}

/// Shared state for one merge run. Every task writes through the same locked multiplexer.
struct MergeTarget<'a> {
    mux: Mutex<OutputMultiplexer>,
    mount: Option<&'a Path>,
    shards: Mutex<Vec<PathBuf>>,
    counters: MergeCounters,
}

impl<'a> MergeTarget<'a> {
    fn new(mux: OutputMultiplexer, mount: Option<&'a Path>) -> Self {
        Self {
            mux: Mutex::new(mux),
            mount,
            shards: Mutex::new(Vec::new()),
            counters: MergeCounters::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OutputMultiplexer> {
        self.mux.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self, category: &str, bytes: &[u8]) -> Result<(), ReduceError> {
        let closed = self.lock().write(category, bytes)?;
        if let Some(shard) = closed {
            self.finished(shard);
        }
        Ok(())
    }

    fn write_header(&self, category: &str, bytes: &[u8]) -> Result<(), ReduceError> {
        let (closed, _) = self.lock().write_header(category, bytes)?;
        if let Some(shard) = closed {
            self.finished(shard);
        }
        Ok(())
    }

    fn finished(&self, shard: ClosedShard) {
        let location = match self.mount {
            Some(mount) => mirror(&shard.path, mount).unwrap_or_else(|e| {
                warn!(path = %shard.path.display(), error = %e, "could not copy file");
                shard.path.clone()
            }),
            None => shard.path.clone(),
        };
        self.shards.lock().unwrap_or_else(|p| p.into_inner()).push(location);
    }

    fn finish(self, objects: usize) -> Result<MergeReport, ReduceError> {
        let closed = self.lock().close_all()?;
        for shard in closed {
            self.finished(shard);
        }
        let mut shards = self.shards.into_inner().unwrap_or_else(|p| p.into_inner());
        shards.sort();
        Ok(MergeReport {
            objects,
            failed_objects: self.counters.failed_objects.load(Ordering::SeqCst),
            lines_written: self.counters.lines_written.load(Ordering::SeqCst),
            lines_dropped: self.counters.lines_dropped.load(Ordering::SeqCst),
            shards,
        })
    }
}

/// Copy a finished shard into `mount` and remove the local file. Copy-then-delete so the
/// mount may live on another filesystem.
fn mirror(path: &Path, mount: &Path) -> Result<PathBuf, ReduceError> {
    let name = path
        .file_name()
        .ok_or_else(|| ReduceError::Other(format!("bad shard path {}", path.display())))?;
    fs::create_dir_all(mount)?;
    let target = mount.join(name);
    fs::copy(path, &target)?;
    fs::remove_file(path)?;
    Ok(target)
}

/// Signals a finished task when dropped, so a panicking task still frees its admission slot.
struct Completion(Sender<()>);

impl Drop for Completion {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

/// Run `task` once per object under `mode`. Task failures are counted and logged, never fatal.
fn for_each_object<F>(objects: &[BlobObject], mode: ExecutionMode, counters: &MergeCounters, task: F)
where
    F: Fn(usize, &BlobObject) -> Result<(), ReduceError> + Sync,
{
    let total = objects.len();
    let run = |i: usize, object: &BlobObject| {
        info!(
            "retrieving {}, ({}/{}) {}",
            object.key,
            i + 1,
            total,
            format_size(object.size, BINARY.decimal_places(1))
        );
        if let Err(e) = task(i, object) {
            warn!(key = %object.key, error = %e, "error in object");
            counters.failed_objects.fetch_add(1, Ordering::SeqCst);
        }
    };

    match mode {
        ExecutionMode::Sequential => {
            for (i, object) in objects.iter().enumerate() {
                run(i, object);
            }
        }
        ExecutionMode::Parallel { max_outstanding } => {
            let limit = max_outstanding.max(1);
            let (done_tx, done_rx) = crossbeam_channel::unbounded::<()>();
            thread::scope(|scope| {
                let mut outstanding = 0usize;
                for (i, object) in objects.iter().enumerate() {
                    while outstanding >= limit {
                        if done_rx.recv().is_err() {
                            break;
                        }
                        outstanding -= 1;
                    }
                    let completion = Completion(done_tx.clone());
                    let run = &run;
                    outstanding += 1;
                    scope.spawn(move || {
                        let _completion = completion;
                        run(i, object);
                    });
                }
                while outstanding > 0 {
                    if done_rx.recv().is_err() {
                        break;
                    }
                    outstanding -= 1;
                }
            });
        }
    }
}

fn open_gz_lines(bytes: &[u8]) -> impl Iterator<Item = std::io::Result<String>> + '_ {
    BufReader::new(GzDecoder::new(bytes)).lines()
}

/// Download every result shard under `data/` and re-multiplex its lines into local
/// category shards under `destination`.
pub fn retrieve_data(
    blobs: &dyn BlobStoreLike,
    result_bucket: &str,
    destination: &Path,
    naming: ShardNaming,
    size_limit: u64,
    mode: ExecutionMode,
) -> Result<MergeReport, ReduceError> {
    let objects: Vec<BlobObject> = blobs
        .list(result_bucket, RESULT_PREFIX)?
        .into_iter()
        .filter(|o| o.key.ends_with(".gz"))
        .collect();
    info!(objects = objects.len(), mode = ?mode, "retrieving data");

    let target = MergeTarget::new(OutputMultiplexer::new(destination, naming, size_limit)?, None);
    for_each_object(&objects, mode, &target.counters, |_, object| {
        let bytes = blobs.get(result_bucket, &object.key)?;
        for line in open_gz_lines(&bytes) {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(&line) {
                Some((category, payload)) => {
                    target.write(&category, format!("{}\n", payload).as_bytes())?;
                    target.counters.lines_written.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    warn!(key = %object.key, line = %line, "unable to parse");
                    target.counters.lines_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    });
    let report = target.finish(objects.len())?;
    info!(
        written = report.lines_written,
        dropped = report.lines_dropped,
        shards = report.shards.len(),
        "data retrieved"
    );
    Ok(report)
}

fn csv_line(record: &csv::StringRecord) -> Result<Vec<u8>, ReduceError> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(record)?;
    writer
        .into_inner()
        .map_err(|e| ReduceError::Other(format!("unable to encode csv row: {}", e)))
}

/// Merge every page stat shard under `stats/` into `pages.{n}.csv.gz` files, writing the
/// header once and dropping rows whose width differs from it. Finished files are moved to
/// `mount` when one is given.
pub fn merge_page_stats(
    blobs: &dyn BlobStoreLike,
    result_bucket: &str,
    destination: &Path,
    mount: Option<&Path>,
    size_limit: u64,
    mode: ExecutionMode,
) -> Result<MergeReport, ReduceError> {
    let objects: Vec<BlobObject> = blobs
        .list(result_bucket, STATS_PREFIX)?
        .into_iter()
        .filter(|o| o.key.ends_with(".csv.gz"))
        .collect();
    info!(objects = objects.len(), mode = ?mode, "retrieving page stats");

    let naming = ShardNaming::new("", "csv");
    let target = MergeTarget::new(OutputMultiplexer::new(destination, naming, size_limit)?, mount);
    for_each_object(&objects, mode, &target.counters, |_, object| {
        let bytes = blobs.get(result_bucket, &object.key)?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(GzDecoder::new(bytes.as_slice()));

        let mut width = None;
        for record in reader.records() {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    warn!(key = %object.key, error = %e, "dropping unreadable row");
                    target.counters.lines_dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            let Some(expected) = width else {
                width = Some(record.len());
                target.write_header(PAGE_STATS_CATEGORY, &csv_line(&record)?)?;
                continue;
            };
            if record.len() != expected {
                target.counters.lines_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            target.write(PAGE_STATS_CATEGORY, &csv_line(&record)?)?;
            target.counters.lines_written.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    });
    target.finish(objects.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsMode {
    Errors,
    Data,
    Pages,
    All,
}

impl StatsMode {
    pub fn from_number(mode: u8) -> Result<Self, ReduceError> {
        match mode {
            1 => Ok(StatsMode::Errors),
            2 => Ok(StatsMode::Data),
            3 => Ok(StatsMode::Pages),
            4 => Ok(StatsMode::All),
            other => Err(ReduceError::Config(format!("invalid stats mode {}, expected 1-4", other))),
        }
    }

    fn errors(self) -> bool {
        matches!(self, StatsMode::Errors | StatsMode::All)
    }

    fn data(self) -> bool {
        matches!(self, StatsMode::Data | StatsMode::All)
    }

    fn pages(self) -> bool {
        matches!(self, StatsMode::Pages | StatsMode::All)
    }
}

#[derive(Debug, Clone)]
pub struct StatsRequest<'a> {
    pub result_bucket: &'a str,
    pub error_domain: &'a str,
    pub data_domain: &'a str,
    pub destination: &'a Path,
    pub mount: Option<&'a Path>,
    pub size_limit: u64,
    pub mode: StatsMode,
    pub execution: ExecutionMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsReport {
    pub error_rows: Option<usize>,
    pub data_rows: Option<usize>,
    pub pages: Option<MergeReport>,
}

pub fn retrieve_stats(
    blobs: &dyn BlobStoreLike,
    store: &dyn AttributeStoreLike,
    request: &StatsRequest<'_>,
) -> Result<StatsReport, ReduceError> {
    fs::create_dir_all(request.destination)?;
    let mut report = StatsReport::default();
    if request.mode.errors() {
        let path = request.destination.join("failed.csv.gz");
        report.error_rows = Some(export_domains(store, request.error_domain, &path)?);
    }
    if request.mode.data() {
        let path = request.destination.join("data.csv.gz");
        report.data_rows = Some(export_domains(store, request.data_domain, &path)?);
    }
    if request.mode.pages() {
        report.pages = Some(merge_page_stats(
            blobs,
            request.result_bucket,
            request.destination,
            request.mount,
            request.size_limit,
            request.execution,
        )?);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::InMemoryBlobStore;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::{Read, Write};

    fn gz(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    fn read_gz(path: &Path) -> String {
        let mut out = String::new();
        GzDecoder::new(fs::File::open(path).unwrap()).read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn test_parse_line_extracts_category() {
        assert_eq!(
            parse_line("<a> <b> <c> <ex:tables> ."),
            Some(("tables".to_string(), "<a> <b> <c> .".to_string()))
        );
        assert_eq!(parse_line("{\"x\":1} <ex:json>"), Some(("json".to_string(), "{\"x\":1}".to_string())));
        assert_eq!(parse_line("<ex:first> rest"), Some(("first".to_string(), "rest".to_string())));
    }

    #[test]
    fn test_parse_line_rejects_malformed() {
        assert_eq!(parse_line("no category here"), None);
        assert_eq!(parse_line("x <ex:>"), None);
        assert_eq!(parse_line("x <ex:../up>"), None);
        assert_eq!(parse_line("x <ex:foo>bar"), None);
        assert_eq!(parse_line("x <ex:foo>>"), None);
        assert_eq!(parse_line("x <ex:foo"), None);
    }

    #[test]
    fn test_parallel_admission_never_exceeds_limit() {
        use std::time::Duration;

        let objects: Vec<BlobObject> = (0..24)
            .map(|i| BlobObject {
                key: format!("data/{}.gz", i),
                size: 1,
            })
            .collect();
        let counters = MergeCounters::default();
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let ran = AtomicUsize::new(0);

        for_each_object(&objects, ExecutionMode::Parallel { max_outstanding: 3 }, &counters, |_, _| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            running.fetch_sub(1, Ordering::SeqCst);
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(ran.load(Ordering::SeqCst), objects.len());
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
        assert_eq!(counters.failed_objects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_task_frees_its_slot() {
        use std::panic::{AssertUnwindSafe, catch_unwind};

        let objects: Vec<BlobObject> = (0..8)
            .map(|i| BlobObject {
                key: format!("data/{}.gz", i),
                size: 1,
            })
            .collect();
        let counters = MergeCounters::default();
        let started = AtomicUsize::new(0);

        // Every task panics; with one slot the loop only reaches the last object if each
        // panic hands its slot back.
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            for_each_object(&objects, ExecutionMode::Parallel { max_outstanding: 1 }, &counters, |_, _| {
                started.fetch_add(1, Ordering::SeqCst);
                panic!("task blew up");
            });
        }));

        assert!(outcome.is_err());
        assert_eq!(started.load(Ordering::SeqCst), objects.len());
    }

    #[test]
    fn test_retrieve_data_drops_malformed_lines() {
        let temp_dir = tempfile::tempdir().unwrap();
        let blobs = InMemoryBlobStore::new();
        blobs
            .put("results", "data/a.t.0.json.gz", gz("one <ex:t>\ngarbage\ntwo <ex:u>\n\n"))
            .unwrap();
        blobs.put("results", "data/broken.gz", b"not gzip".to_vec()).unwrap();

        let report = retrieve_data(
            &blobs,
            "results",
            temp_dir.path(),
            ShardNaming::new("webreduce", "json"),
            1024,
            ExecutionMode::Sequential,
        )
        .unwrap();
        assert_eq!(report.objects, 2);
        assert_eq!(report.failed_objects, 1);
        assert_eq!(report.lines_written, 2);
        assert_eq!(report.lines_dropped, 1);
        assert_eq!(read_gz(&temp_dir.path().join("webreduce.t.0.json.gz")), "one\n\n");
        assert_eq!(read_gz(&temp_dir.path().join("webreduce.u.0.json.gz")), "two\n\n");
    }

    #[test]
    fn test_page_stats_header_once_and_width_filter() {
        let temp_dir = tempfile::tempdir().unwrap();
        let blobs = InMemoryBlobStore::new();
        blobs.put("results", "stats/a.csv.gz", gz("url,n\nhttp://a,1\nbad\n")).unwrap();
        blobs.put("results", "stats/b.csv.gz", gz("url,n\nhttp://b,2\n")).unwrap();

        let report = merge_page_stats(&blobs, "results", temp_dir.path(), None, 1 << 20, ExecutionMode::Sequential).unwrap();
        assert_eq!(report.lines_written, 2);
        assert_eq!(report.lines_dropped, 1);
        let merged = read_gz(&temp_dir.path().join("pages.0.csv.gz"));
        assert_eq!(merged, "url,n\nhttp://a,1\nhttp://b,2\n\n");
    }

    #[test]
    fn test_page_stats_mirrored_to_mount() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mount = tempfile::tempdir().unwrap();
        let blobs = InMemoryBlobStore::new();
        blobs.put("results", "stats/a.csv.gz", gz("url,n\nhttp://a,1\n")).unwrap();

        let report = merge_page_stats(
            &blobs,
            "results",
            temp_dir.path(),
            Some(mount.path()),
            1 << 20,
            ExecutionMode::Sequential,
        )
        .unwrap();
        assert_eq!(report.shards, vec![mount.path().join("pages.0.csv.gz")]);
        assert!(!temp_dir.path().join("pages.0.csv.gz").exists());
        assert!(read_gz(&mount.path().join("pages.0.csv.gz")).starts_with("url,n\n"));
    }

    #[test]
    fn test_stats_mode_numbers() {
        assert_eq!(StatsMode::from_number(4).unwrap(), StatsMode::All);
        assert!(StatsMode::from_number(0).is_err());
        assert!(StatsMode::from_number(5).is_err());
    }
}
