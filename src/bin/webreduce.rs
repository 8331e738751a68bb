use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::PathBuf;
use std::process::ExitCode;
use webreduce::aggregate::{self, ExecutionMode, StatsMode, StatsRequest};
use webreduce::aws::{AwsContext, DynamoAttributeStore, Ec2FleetProvider, S3BlobStore, SqsJobQueue};
use webreduce::config::Config;
use webreduce::fleet::FleetController;
use webreduce::monitor::Monitor;
use webreduce::multiplexer::ShardNaming;
use webreduce::operator;
use webreduce::telemetry::init_tracing;
use webreduce::watchdog::CancelToken;
use webreduce::ReduceError;

#[derive(Parser)]
#[command(name = "webreduce")]
#[command(about = "Operator CLI for the webreduce extraction fleet", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue every input container under the given prefixes
    Queue {
        /// Prefix below the data prefix, e.g. a crawl segment
        #[arg(long = "bucket-prefix", conflicts_with = "bucket_prefix_file")]
        bucket_prefix: Option<String>,
        /// File with one prefix per line
        #[arg(long = "bucket-prefix-file")]
        bucket_prefix_file: Option<PathBuf>,
        /// Stop after this many inputs have been queued
        #[arg(long = "file-number-limit")]
        file_number_limit: Option<usize>,
    },
    /// Delete the job queue
    Clearqueue,
    /// Delete every stat domain, and optionally stored results
    Cleardata {
        #[arg(long = "includeS3Storage")]
        include_s3_storage: bool,
    },
    /// Write per-directory input counts and sizes
    Crawlstats {
        #[arg(long = "bucket-prefix")]
        bucket_prefix: String,
        #[arg(long = "output-file")]
        output_file: PathBuf,
    },
    /// Publish the worker executable fleet nodes download on boot
    Deploy {
        #[arg(long = "jarfile")]
        jarfile: PathBuf,
    },
    /// Request worker instances
    Start {
        #[arg(long = "worker-amount")]
        worker_amount: u32,
        /// Maximum hourly price per instance; defaults to WEBREDUCE_PRICE_LIMIT
        #[arg(long = "pricelimit")]
        pricelimit: Option<f64>,
    },
    /// Cancel instance requests and terminate running instances
    Shutdown,
    /// Download and merge result shards
    Retrievedata {
        #[arg(long)]
        destination: PathBuf,
        #[arg(long = "multiThreadMode")]
        multi_thread_mode: bool,
    },
    /// Export stat domains and merge page stat shards
    Retrievestats {
        #[arg(long)]
        destination: PathBuf,
        /// Move finished page stat files here
        #[arg(long = "mountdestination")]
        mount_destination: Option<PathBuf>,
        /// 1 errors, 2 data, 3 page stats, 4 all
        #[arg(long, default_value_t = 4)]
        mode: u8,
        #[arg(long = "multiThreadMode")]
        multi_thread_mode: bool,
    },
    /// Show queue depth, drain rate and fleet size until interrupted
    Monitor,
}

fn execution_mode(parallel: bool) -> ExecutionMode {
    if parallel {
        ExecutionMode::parallel()
    } else {
        ExecutionMode::Sequential
    }
}

fn run(command: Commands, config: &Config) -> Result<(), ReduceError> {
    let ctx = AwsContext::new(config)?;
    match command {
        Commands::Queue {
            bucket_prefix,
            bucket_prefix_file,
            file_number_limit,
        } => {
            let prefixes = match (bucket_prefix, bucket_prefix_file) {
                (Some(prefix), _) => vec![prefix],
                (None, Some(path)) => operator::read_prefix_file(&path)
                    .map_err(|e| ReduceError::Config(format!("cannot read {}: {}", path.display(), e)))?,
                (None, None) => Vec::new(),
            };
            let queue = SqsJobQueue::new(&ctx, config);
            let blobs = S3BlobStore::new(&ctx);
            let queued = operator::queue_inputs(&queue, &blobs, config, &prefixes, file_number_limit)?;
            println!("queued {} inputs", queued);
        }
        Commands::Clearqueue => {
            operator::clear_queue(&SqsJobQueue::new(&ctx, config))?;
            println!("done.");
        }
        Commands::Cleardata { include_s3_storage } => {
            let threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
            let report = operator::clear_data(
                &DynamoAttributeStore::new(&ctx),
                &S3BlobStore::new(&ctx),
                &config.result_bucket,
                include_s3_storage,
                threads,
            )?;
            println!("deleted {} domains and {} objects", report.domains, report.objects);
        }
        Commands::Crawlstats {
            bucket_prefix,
            output_file,
        } => {
            let rows = operator::crawl_stats(
                &S3BlobStore::new(&ctx),
                &config.data_bucket,
                &config.data_key_prefix(&bucket_prefix),
                &output_file,
            )?;
            println!("wrote {} rows to {}", rows, output_file.display());
        }
        Commands::Deploy { jarfile } => {
            let url = operator::deploy(&S3BlobStore::new(&ctx), config, &jarfile)?;
            println!("deployed to {}", url);
        }
        Commands::Start {
            worker_amount,
            pricelimit,
        } => {
            let provider = Ec2FleetProvider::new(&ctx);
            let ids = FleetController::new(&provider).create(
                config,
                worker_amount,
                pricelimit.unwrap_or(config.price_limit),
            )?;
            println!("placed {} instance requests", ids.len());
        }
        Commands::Shutdown => {
            let provider = Ec2FleetProvider::new(&ctx);
            let report = FleetController::new(&provider).shutdown()?;
            println!(
                "cancelled {} requests, terminated {} instances",
                report.cancelled_requests, report.terminated_instances
            );
        }
        Commands::Retrievedata {
            destination,
            multi_thread_mode,
        } => {
            let report = aggregate::retrieve_data(
                &S3BlobStore::new(&ctx),
                &config.result_bucket,
                &destination,
                ShardNaming::new(&config.output_prefix, &config.result_extension),
                config.shard_size_limit_bytes(),
                execution_mode(multi_thread_mode),
            )?;
            println!(
                "merged {} objects into {} shards ({} lines, {} dropped)",
                report.objects,
                report.shards.len(),
                report.lines_written,
                report.lines_dropped
            );
        }
        Commands::Retrievestats {
            destination,
            mount_destination,
            mode,
            multi_thread_mode,
        } => {
            let request = StatsRequest {
                result_bucket: &config.result_bucket,
                error_domain: &config.error_domain,
                data_domain: &config.data_domain,
                destination: &destination,
                mount: mount_destination.as_deref(),
                size_limit: config.shard_size_limit_bytes(),
                mode: StatsMode::from_number(mode)?,
                execution: execution_mode(multi_thread_mode),
            };
            let report = aggregate::retrieve_stats(&S3BlobStore::new(&ctx), &DynamoAttributeStore::new(&ctx), &request)?;
            println!("{:?}", report);
        }
        Commands::Monitor => {
            let queue = SqsJobQueue::new(&ctx, config);
            let provider = Ec2FleetProvider::new(&ctx);
            let stop = CancelToken::new();
            Monitor::new(&queue, &provider).run(&mut std::io::stdout(), &stop)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();
    init_tracing("webreduce");

    let config = match Config::global() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    match run(cli.command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
