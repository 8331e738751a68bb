use dotenv::dotenv;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use webreduce::aws::{AwsContext, DynamoAttributeStore, S3BlobStore, SqsJobQueue};
use webreduce::blob_store::BlobStoreLike;
use webreduce::config::Config;
use webreduce::extract::TableCountExtractor;
use webreduce::queue::JobQueueLike;
use webreduce::retry::RetryPolicy;
use webreduce::stat_writer::{AttributeStoreLike, StatWriter};
use webreduce::supervisor::{PoolWorker, Supervisor, SupervisorSettings, WorkerFactory};
use webreduce::telemetry::init_tracing;
use webreduce::watchdog::{CancelToken, Watchdog};
use webreduce::worker::{Extractor, WorkerLoop, WorkerSettings};
use webreduce::ReduceError;

/// Builds worker loops over shared AWS clients. Each loop gets its own stat writers so a
/// writer that gives up takes down only its loop.
struct AwsWorkerFactory {
    config: &'static Config,
    queue: Arc<dyn JobQueueLike>,
    blobs: Arc<dyn BlobStoreLike>,
    store: Arc<dyn AttributeStoreLike>,
    extractor: Arc<dyn Extractor>,
    scratch_dir: PathBuf,
}

impl WorkerFactory for AwsWorkerFactory {
    fn build(&self, watchdog: Arc<Watchdog>) -> Result<Box<dyn PoolWorker>, ReduceError> {
        let policy = RetryPolicy::new(self.config.stat_max_tries, self.config.stat_retry_delay());
        let capacity = self.config.stat_cache_capacity;
        let data_stats = StatWriter::open(self.store.clone(), &self.config.data_domain, capacity, policy)?;
        let error_stats = StatWriter::open(self.store.clone(), &self.config.error_domain, capacity, policy)?;
        Ok(Box::new(WorkerLoop::new(
            self.queue.clone(),
            self.blobs.clone(),
            self.extractor.clone(),
            Arc::new(data_stats),
            Arc::new(error_stats),
            WorkerSettings::from_config(self.config, &self.scratch_dir),
            watchdog,
        )))
    }
}

fn main() -> ExitCode {
    dotenv().ok();
    init_tracing("webreduce-worker");

    let config = match Config::global() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "unable to load configuration");
            return ExitCode::FAILURE;
        }
    };
    let ctx = match AwsContext::new(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "unable to initialise AWS clients");
            return ExitCode::FAILURE;
        }
    };

    let scratch_dir = std::env::temp_dir().join("webreduce");
    if let Err(e) = std::fs::create_dir_all(&scratch_dir) {
        error!(path = %scratch_dir.display(), error = %e, "unable to create scratch directory");
        return ExitCode::FAILURE;
    }

    let factory = AwsWorkerFactory {
        config,
        queue: Arc::new(SqsJobQueue::new(&ctx, config)),
        blobs: Arc::new(S3BlobStore::new(&ctx)),
        store: Arc::new(DynamoAttributeStore::new(&ctx)),
        extractor: Arc::new(TableCountExtractor),
        scratch_dir,
    };
    let settings = SupervisorSettings::new(config.job_time_limit());
    info!(threads = settings.thread_limit, "starting worker pool");

    // Runs until the node is terminated.
    let never = CancelToken::new();
    Supervisor::new(Arc::new(factory), settings).run(&never);
    ExitCode::SUCCESS
}
