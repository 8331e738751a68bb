use crate::ReduceError;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::time::Duration;

const ENV_PREFIX: &str = "WEBREDUCE_";

static GLOBAL: OnceCell<Config> = OnceCell::new();

/// Process-wide settings. Loaded once and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub region: String,
    pub endpoint: Option<String>,
    pub data_bucket: String,
    pub data_prefix: String,
    pub result_bucket: String,
    pub deploy_bucket: String,
    pub deploy_filename: String,
    pub queue_name: String,
    pub queue_retention_secs: u64,
    pub data_domain: String,
    pub error_domain: String,
    pub job_time_limit_secs: u64,
    pub job_retry_limit: u32,
    pub instance_type: String,
    pub image_id: String,
    pub key_pair: String,
    pub price_limit: f64,
    pub output_prefix: String,
    pub result_extension: String,
    pub shard_size_limit_mb: u64,
    pub stat_cache_capacity: usize,
    pub stat_max_tries: u32,
    pub stat_retry_delay_ms: u64,
}

impl Config {
    /// Load from the environment on first call and hand out the same instance afterwards.
    pub fn global() -> Result<&'static Config, ReduceError> {
        GLOBAL.get_or_try_init(Self::from_env)
    }

    pub fn from_env() -> Result<Self, ReduceError> {
        Self::from_lookup(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ReduceError> {
        Self::from_lookup(|key| map.get(key).cloned())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ReduceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &str| {
            get(key).ok_or_else(|| ReduceError::Config(format!("missing required key {}{}", ENV_PREFIX, key)))
        };
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            region: or("REGION", "us-east-1"),
            endpoint: get("ENDPOINT"),
            data_bucket: required("DATA_BUCKET")?,
            data_prefix: or("DATA_PREFIX", ""),
            result_bucket: required("RESULT_BUCKET")?,
            deploy_bucket: required("DEPLOY_BUCKET")?,
            deploy_filename: or("DEPLOY_FILENAME", "webreduce-worker"),
            queue_name: required("QUEUE_NAME")?,
            queue_retention_secs: parse_num(&get, "QUEUE_RETENTION", 1_209_600)?,
            data_domain: required("DATA_DOMAIN")?,
            error_domain: required("ERROR_DOMAIN")?,
            job_time_limit_secs: parse_num(&get, "JOB_TIME_LIMIT", 900)?,
            job_retry_limit: parse_num(&get, "JOB_RETRY_LIMIT", 3)?,
            instance_type: or("INSTANCE_TYPE", "c5.xlarge"),
            image_id: or("IMAGE_ID", ""),
            key_pair: or("KEY_PAIR", ""),
            price_limit: parse_num(&get, "PRICE_LIMIT", 0.10)?,
            output_prefix: or("OUTPUT_PREFIX", "webreduce"),
            result_extension: or("RESULT_EXTENSION", "json"),
            shard_size_limit_mb: parse_num(&get, "SHARD_SIZE_LIMIT_MB", 100)?,
            stat_cache_capacity: parse_num(&get, "STAT_CACHE_CAPACITY", 24)?,
            stat_max_tries: parse_num(&get, "STAT_MAX_TRIES", 20)?,
            stat_retry_delay_ms: parse_num(&get, "STAT_RETRY_DELAY_MS", 1000)?,
        })
    }

    pub fn job_time_limit(&self) -> Duration {
        Duration::from_secs(self.job_time_limit_secs)
    }

    pub fn shard_size_limit_bytes(&self) -> u64 {
        self.shard_size_limit_mb * 1024 * 1024
    }

    pub fn stat_retry_delay(&self) -> Duration {
        Duration::from_millis(self.stat_retry_delay_ms)
    }

    /// Public URL fleet nodes download the worker artifact from.
    pub fn artifact_url(&self) -> String {
        format!("https://{}.s3.amazonaws.com/{}", self.deploy_bucket, self.deploy_filename)
    }

    /// Key prefix under which input containers are listed.
    pub fn data_key_prefix(&self, prefix: &str) -> String {
        if self.data_prefix.is_empty() {
            prefix.to_string()
        } else {
            format!("{}/{}", self.data_prefix.trim_end_matches('/'), prefix.trim_start_matches('/'))
        }
    }

    /// Settings a fleet node needs, as `WEBREDUCE_*` pairs. Credentials are never included;
    /// nodes pick those up from their instance profile.
    pub fn node_environment(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("REGION", self.region.clone()),
            ("DATA_BUCKET", self.data_bucket.clone()),
            ("DATA_PREFIX", self.data_prefix.clone()),
            ("RESULT_BUCKET", self.result_bucket.clone()),
            ("DEPLOY_BUCKET", self.deploy_bucket.clone()),
            ("DEPLOY_FILENAME", self.deploy_filename.clone()),
            ("QUEUE_NAME", self.queue_name.clone()),
            ("DATA_DOMAIN", self.data_domain.clone()),
            ("ERROR_DOMAIN", self.error_domain.clone()),
            ("JOB_TIME_LIMIT", self.job_time_limit_secs.to_string()),
            ("JOB_RETRY_LIMIT", self.job_retry_limit.to_string()),
            ("RESULT_EXTENSION", self.result_extension.clone()),
            ("SHARD_SIZE_LIMIT_MB", self.shard_size_limit_mb.to_string()),
        ];
        if let Some(endpoint) = &self.endpoint {
            pairs.push(("ENDPOINT", endpoint.clone()));
        }
        pairs
            .into_iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (format!("{}{}", ENV_PREFIX, k), v))
            .collect()
    }
}

fn parse_num<T, G>(get: &G, key: &str, default: T) -> Result<T, ReduceError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ReduceError::Config(format!("{}{} is not a valid number: {}", ENV_PREFIX, key, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    let map: HashMap<String, String> = [
        ("DATA_BUCKET", "commoncrawl"),
        ("DATA_PREFIX", "crawl-data"),
        ("RESULT_BUCKET", "results"),
        ("DEPLOY_BUCKET", "deploy"),
        ("QUEUE_NAME", "jobs"),
        ("DATA_DOMAIN", "data"),
        ("ERROR_DOMAIN", "failed"),
        ("STAT_RETRY_DELAY_MS", "0"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    Config::from_map(&map).expect("test config")
}
