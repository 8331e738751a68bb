//! AWS-backed adapters: S3 blobs, SQS jobs, DynamoDB stat domains and EC2 spot capacity.
//!
//! Every adapter drives the async SDK through one shared runtime with `block_on`, so the
//! engine above stays plain threads.

use crate::blob_store::{BlobObject, BlobStoreLike};
use crate::config::Config;
use crate::error::ReduceError;
use crate::fleet::{CapacityRequest, FleetProviderLike, FleetRequest, RequestState};
use crate::queue::{BatchEntry, Job, JobQueueLike, QueueAttributes, SEND_BATCH_SIZE};
use crate::stat_writer::{Attributes, AttributeStoreLike, StatRecord};
use aws_config::{BehaviorVersion, Region, SdkConfig};
use backon::{BlockingRetryable, ConstantBuilder, ExponentialBuilder};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

const DYNAMO_BATCH_LIMIT: usize = 25;
const UNPROCESSED_RESUBMITS: usize = 4;
const TABLE_ACTIVE_POLLS: usize = 59;
const KEY_ATTRIBUTE: &str = "_key";
const RECEIVE_WAIT_SECS: i32 = 10;

/// Runtime and resolved SDK settings shared by every client.
#[derive(Clone)]
pub struct AwsContext {
    runtime: Arc<Runtime>,
    sdk_config: SdkConfig,
    endpoint: Option<String>,
}

impl AwsContext {
    pub fn new(config: &Config) -> Result<Self, ReduceError> {
        let runtime = Runtime::new().map_err(|e| ReduceError::Other(format!("tokio runtime error: {}", e)))?;
        let region = Region::new(config.region.clone());
        let sdk_config = runtime.block_on(aws_config::defaults(BehaviorVersion::latest()).region(region).load());
        Ok(Self {
            runtime: Arc::new(runtime),
            sdk_config,
            endpoint: config.endpoint.clone(),
        })
    }

    fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

pub struct S3BlobStore {
    ctx: AwsContext,
    client: aws_sdk_s3::Client,
}

impl S3BlobStore {
    pub fn new(ctx: &AwsContext) -> Self {
        let mut builder = aws_sdk_s3::config::Builder::from(&ctx.sdk_config);
        if let Some(endpoint) = &ctx.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self {
            ctx: ctx.clone(),
            client: aws_sdk_s3::Client::from_conf(builder.build()),
        }
    }

    fn put_with_acl(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        acl: Option<aws_sdk_s3::types::ObjectCannedAcl>,
    ) -> Result<(), ReduceError> {
        let body = aws_sdk_s3::primitives::ByteStream::from(bytes);
        self.ctx
            .block_on(
                self.client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .set_acl(acl)
                    .body(body)
                    .send(),
            )
            .map_err(|e| ReduceError::Storage(format!("S3 put {}/{}: {}", bucket, key, e)))?;
        Ok(())
    }
}

impl BlobStoreLike for S3BlobStore {
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<BlobObject>, ReduceError> {
        let mut token: Option<String> = None;
        let mut objects = Vec::new();
        loop {
            let request = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(token.clone());
            let resp = self
                .ctx
                .block_on(request.send())
                .map_err(|e| ReduceError::Storage(format!("S3 list {}/{}: {}", bucket, prefix, e)))?;

            for object in resp.contents() {
                if let Some(key) = object.key() {
                    objects.push(BlobObject {
                        key: key.to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                    });
                }
            }

            if resp.is_truncated().unwrap_or(false) {
                token = resp.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }
        Ok(objects)
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ReduceError> {
        let resp = self
            .ctx
            .block_on(self.client.get_object().bucket(bucket).key(key).send())
            .map_err(|e| ReduceError::Storage(format!("S3 get {}/{}: {}", bucket, key, e)))?;
        let data = self
            .ctx
            .block_on(resp.body.collect())
            .map_err(|e| ReduceError::Storage(format!("S3 read {}/{}: {}", bucket, key, e)))?
            .to_vec();
        Ok(data)
    }

    fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), ReduceError> {
        self.put_with_acl(bucket, key, bytes, None)
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), ReduceError> {
        self.ctx
            .block_on(self.client.delete_object().bucket(bucket).key(key).send())
            .map_err(|e| ReduceError::Storage(format!("S3 delete {}/{}: {}", bucket, key, e)))?;
        Ok(())
    }

    fn publish_file(&self, bucket: &str, key: &str, path: &Path) -> Result<(), ReduceError> {
        let bytes = std::fs::read(path)?;
        self.put_with_acl(
            bucket,
            key,
            bytes,
            Some(aws_sdk_s3::types::ObjectCannedAcl::PublicRead),
        )
    }
}

/// SQS queue resolved by name. Created with the configured retention and visibility
/// timeout the first time it is missing.
pub struct SqsJobQueue {
    ctx: AwsContext,
    client: aws_sdk_sqs::Client,
    name: String,
    retention_secs: u64,
    visibility_secs: u64,
    url: Mutex<Option<String>>,
}

impl SqsJobQueue {
    pub fn new(ctx: &AwsContext, config: &Config) -> Self {
        let mut builder = aws_sdk_sqs::config::Builder::from(&ctx.sdk_config);
        if let Some(endpoint) = &ctx.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Self {
            ctx: ctx.clone(),
            client: aws_sdk_sqs::Client::from_conf(builder.build()),
            name: config.queue_name.clone(),
            retention_secs: config.queue_retention_secs,
            visibility_secs: config.job_time_limit_secs,
            url: Mutex::new(None),
        }
    }

    fn cached_url(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.url.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn queue_url(&self) -> Result<String, ReduceError> {
        if let Some(url) = self.cached_url().clone() {
            return Ok(url);
        }

        let lookup = self
            .ctx
            .block_on(self.client.get_queue_url().queue_name(&self.name).send());
        let url = match lookup {
            Ok(out) => out.queue_url().map(str::to_string),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_queue_does_not_exist()) => {
                use aws_sdk_sqs::types::QueueAttributeName;
                info!(queue = %self.name, "creating job queue");
                let created = self
                    .ctx
                    .block_on(
                        self.client
                            .create_queue()
                            .queue_name(&self.name)
                            .attributes(QueueAttributeName::MessageRetentionPeriod, self.retention_secs.to_string())
                            .attributes(QueueAttributeName::VisibilityTimeout, self.visibility_secs.to_string())
                            .send(),
                    )
                    .map_err(|e| ReduceError::Queue(format!("SQS create {}: {}", self.name, e)))?;
                created.queue_url().map(str::to_string)
            }
            Err(e) => return Err(ReduceError::Queue(format!("SQS resolve {}: {}", self.name, e))),
        };

        let url = url.ok_or_else(|| ReduceError::Queue(format!("SQS returned no url for {}", self.name)))?;
        *self.cached_url() = Some(url.clone());
        Ok(url)
    }
}

impl JobQueueLike for SqsJobQueue {
    fn send_batch(&self, entries: &[BatchEntry]) -> Result<(), ReduceError> {
        use aws_sdk_sqs::types::SendMessageBatchRequestEntry;
        if entries.len() > SEND_BATCH_SIZE {
            return Err(ReduceError::Queue(format!("batch of {} exceeds limit of {}", entries.len(), SEND_BATCH_SIZE)));
        }
        let url = self.queue_url()?;
        let batch = entries
            .iter()
            .map(|e| {
                SendMessageBatchRequestEntry::builder()
                    .id(&e.id)
                    .message_body(&e.body)
                    .build()
                    .map_err(|err| ReduceError::Queue(format!("bad batch entry {}: {}", e.id, err)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let out = self
            .ctx
            .block_on(
                self.client
                    .send_message_batch()
                    .queue_url(url)
                    .set_entries(Some(batch))
                    .send(),
            )
            .map_err(|e| ReduceError::Queue(format!("SQS send batch: {}", e)))?;
        if !out.failed().is_empty() {
            let ids: Vec<&str> = out.failed().iter().map(|f| f.id()).collect();
            return Err(ReduceError::Queue(format!("SQS rejected entries {:?}", ids)));
        }
        Ok(())
    }

    fn receive_one(&self, visibility_timeout: Duration) -> Result<Option<Job>, ReduceError> {
        use aws_sdk_sqs::types::MessageSystemAttributeName;
        let url = self.queue_url()?;
        let out = self
            .ctx
            .block_on(
                self.client
                    .receive_message()
                    .queue_url(url)
                    .max_number_of_messages(1)
                    .wait_time_seconds(RECEIVE_WAIT_SECS)
                    .visibility_timeout(visibility_timeout.as_secs().min(i32::MAX as u64) as i32)
                    .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
                    .send(),
            )
            .map_err(|e| ReduceError::Queue(format!("SQS receive: {}", e)))?;

        let Some(message) = out.messages().first() else {
            debug!("queue is empty");
            return Ok(None);
        };
        let handle = message
            .receipt_handle()
            .ok_or_else(|| ReduceError::Queue("message without receipt handle".into()))?;
        let receive_count = message
            .attributes()
            .and_then(|a| a.get(&MessageSystemAttributeName::ApproximateReceiveCount))
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(1);
        Ok(Some(Job {
            handle: handle.to_string(),
            body_key: message.body().unwrap_or_default().to_string(),
            receive_count,
        }))
    }

    fn ack(&self, job: &Job) -> Result<(), ReduceError> {
        let url = self.queue_url()?;
        self.ctx
            .block_on(
                self.client
                    .delete_message()
                    .queue_url(url)
                    .receipt_handle(&job.handle)
                    .send(),
            )
            .map_err(|e| ReduceError::Queue(format!("SQS delete message: {}", e)))?;
        Ok(())
    }

    fn attributes(&self) -> Result<QueueAttributes, ReduceError> {
        use aws_sdk_sqs::types::QueueAttributeName;
        let url = self.queue_url()?;
        let out = self
            .ctx
            .block_on(
                self.client
                    .get_queue_attributes()
                    .queue_url(url)
                    .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
                    .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
                    .send(),
            )
            .map_err(|e| ReduceError::Queue(format!("SQS attributes: {}", e)))?;
        let read = |name: QueueAttributeName| {
            out.attributes()
                .and_then(|a| a.get(&name))
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };
        Ok(QueueAttributes {
            visible: read(QueueAttributeName::ApproximateNumberOfMessages),
            in_flight: read(QueueAttributeName::ApproximateNumberOfMessagesNotVisible),
        })
    }

    fn delete_queue(&self) -> Result<(), ReduceError> {
        let url = self.queue_url()?;
        self.ctx
            .block_on(self.client.delete_queue().queue_url(url).send())
            .map_err(|e| ReduceError::Queue(format!("SQS delete queue: {}", e)))?;
        *self.cached_url() = None;
        Ok(())
    }
}

/// One DynamoDB table per stat domain, hash-keyed on `_key`.
pub struct DynamoAttributeStore {
    ctx: AwsContext,
    client: aws_sdk_dynamodb::Client,
}

impl DynamoAttributeStore {
    pub fn new(ctx: &AwsContext) -> Self {
        let mut builder = aws_sdk_dynamodb::config::Builder::from(&ctx.sdk_config);
        if let Some(endpoint) = &ctx.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Self {
            ctx: ctx.clone(),
            client: aws_sdk_dynamodb::Client::from_conf(builder.build()),
        }
    }

    fn wait_until_active(&self, table: &str) -> Result<(), ReduceError> {
        use aws_sdk_dynamodb::types::TableStatus;
        let poll = || -> Result<(), Attempt> {
            let out = self
                .ctx
                .block_on(self.client.describe_table().table_name(table).send())
                .map_err(|e| Attempt::Failed(ReduceError::AttributeStore(format!("describe {}: {}", table, e))))?;
            if out.table().and_then(|t| t.table_status()) == Some(&TableStatus::Active) {
                Ok(())
            } else {
                Err(Attempt::NotReady(format!("table {} never became active", table)))
            }
        };
        poll.retry(
            ConstantBuilder::default()
                .with_delay(Duration::from_secs(1))
                .with_max_times(TABLE_ACTIVE_POLLS),
        )
        .sleep(std::thread::sleep)
        .when(Attempt::is_not_ready)
        .notify(|_, _| debug!(table, "waiting for table to become active"))
        .call()
        .map_err(Attempt::into_error)
    }
}

/// Outcome of one polled or resubmitted call: either worth another go or a hard failure.
enum Attempt {
    NotReady(String),
    Failed(ReduceError),
}

impl Attempt {
    fn is_not_ready(&self) -> bool {
        matches!(self, Attempt::NotReady(_))
    }

    fn into_error(self) -> ReduceError {
        match self {
            Attempt::NotReady(message) => ReduceError::AttributeStore(message),
            Attempt::Failed(e) => e,
        }
    }
}

fn to_attribute_string(value: &aws_sdk_dynamodb::types::AttributeValue) -> Option<String> {
    use aws_sdk_dynamodb::types::AttributeValue;
    match value {
        AttributeValue::S(s) => Some(s.clone()),
        AttributeValue::N(n) => Some(n.clone()),
        AttributeValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl AttributeStoreLike for DynamoAttributeStore {
    fn list_domains(&self) -> Result<Vec<String>, ReduceError> {
        let mut names = Vec::new();
        let mut start: Option<String> = None;
        loop {
            let out = self
                .ctx
                .block_on(
                    self.client
                        .list_tables()
                        .set_exclusive_start_table_name(start.clone())
                        .send(),
                )
                .map_err(|e| ReduceError::AttributeStore(format!("list tables: {}", e)))?;
            names.extend(out.table_names().iter().cloned());
            match out.last_evaluated_table_name() {
                Some(last) => start = Some(last.to_string()),
                None => break,
            }
        }
        Ok(names)
    }

    fn create_domain(&self, domain: &str) -> Result<(), ReduceError> {
        use aws_sdk_dynamodb::types::{
            AttributeDefinition, BillingMode, KeySchemaElement, KeyType, ScalarAttributeType,
        };
        let build_err = |e: aws_sdk_dynamodb::error::BuildError| ReduceError::AttributeStore(e.to_string());
        let definition = AttributeDefinition::builder()
            .attribute_name(KEY_ATTRIBUTE)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(build_err)?;
        let key = KeySchemaElement::builder()
            .attribute_name(KEY_ATTRIBUTE)
            .key_type(KeyType::Hash)
            .build()
            .map_err(build_err)?;

        let created = self.ctx.block_on(
            self.client
                .create_table()
                .table_name(domain)
                .attribute_definitions(definition)
                .key_schema(key)
                .billing_mode(BillingMode::PayPerRequest)
                .send(),
        );
        match created {
            Ok(_) => {}
            Err(e) if e.as_service_error().is_some_and(|se| se.is_resource_in_use_exception()) => {
                debug!(domain, "table already exists");
            }
            Err(e) => return Err(ReduceError::AttributeStore(format!("create {}: {}", domain, e))),
        }
        self.wait_until_active(domain)
    }

    fn delete_domain(&self, domain: &str) -> Result<(), ReduceError> {
        self.ctx
            .block_on(self.client.delete_table().table_name(domain).send())
            .map_err(|e| ReduceError::AttributeStore(format!("delete {}: {}", domain, e)))?;
        Ok(())
    }

    fn batch_put(&self, domain: &str, records: &[StatRecord]) -> Result<(), ReduceError> {
        use aws_sdk_dynamodb::types::{AttributeValue, PutRequest, WriteRequest};
        for chunk in records.chunks(DYNAMO_BATCH_LIMIT) {
            let mut requests = Vec::with_capacity(chunk.len());
            for record in chunk {
                let mut item: HashMap<String, AttributeValue> = record
                    .attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), AttributeValue::S(v.clone())))
                    .collect();
                item.insert(KEY_ATTRIBUTE.to_string(), AttributeValue::S(record.key.clone()));
                let put = PutRequest::builder()
                    .set_item(Some(item))
                    .build()
                    .map_err(|e| ReduceError::AttributeStore(e.to_string()))?;
                requests.push(WriteRequest::builder().put_request(put).build());
            }

            let mut pending = HashMap::from([(domain.to_string(), requests)]);
            let submit = || -> Result<(), Attempt> {
                let out = self
                    .ctx
                    .block_on(
                        self.client
                            .batch_write_item()
                            .set_request_items(Some(pending.clone()))
                            .send(),
                    )
                    .map_err(|e| Attempt::Failed(ReduceError::AttributeStore(format!("batch put {}: {}", domain, e))))?;
                match out.unprocessed_items() {
                    Some(left) if left.values().any(|v| !v.is_empty()) => {
                        pending = left.clone();
                        Err(Attempt::NotReady(format!("{} rows left unprocessed", domain)))
                    }
                    _ => Ok(()),
                }
            };
            submit
                .retry(
                    ExponentialBuilder::default()
                        .with_min_delay(Duration::from_millis(200))
                        .with_max_times(UNPROCESSED_RESUBMITS),
                )
                .sleep(std::thread::sleep)
                .when(Attempt::is_not_ready)
                .notify(|_, delay| warn!(domain, delay_ms = delay.as_millis() as u64, "resubmitting unprocessed stat rows"))
                .call()
                .map_err(Attempt::into_error)?;
        }
        Ok(())
    }

    fn scan(&self, domain: &str) -> Result<Vec<StatRecord>, ReduceError> {
        let mut records = Vec::new();
        let mut start = None;
        loop {
            let out = self
                .ctx
                .block_on(
                    self.client
                        .scan()
                        .table_name(domain)
                        .set_exclusive_start_key(start.clone())
                        .send(),
                )
                .map_err(|e| ReduceError::AttributeStore(format!("scan {}: {}", domain, e)))?;
            for item in out.items() {
                let Some(key) = item.get(KEY_ATTRIBUTE).and_then(to_attribute_string) else {
                    continue;
                };
                let attributes: Attributes = item
                    .iter()
                    .filter(|(name, _)| name.as_str() != KEY_ATTRIBUTE)
                    .filter_map(|(name, value)| to_attribute_string(value).map(|v| (name.clone(), v)))
                    .collect();
                records.push(StatRecord { key, attributes });
            }
            match out.last_evaluated_key() {
                Some(last) if !last.is_empty() => start = Some(last.clone()),
                _ => break,
            }
        }
        Ok(records)
    }
}

/// EC2 persistent spot requests.
pub struct Ec2FleetProvider {
    ctx: AwsContext,
    client: aws_sdk_ec2::Client,
}

impl Ec2FleetProvider {
    pub fn new(ctx: &AwsContext) -> Self {
        let mut builder = aws_sdk_ec2::config::Builder::from(&ctx.sdk_config);
        if let Some(endpoint) = &ctx.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Self {
            ctx: ctx.clone(),
            client: aws_sdk_ec2::Client::from_conf(builder.build()),
        }
    }
}

impl FleetProviderLike for Ec2FleetProvider {
    fn request_capacity(&self, request: &FleetRequest) -> Result<Vec<String>, ReduceError> {
        use aws_sdk_ec2::types::{InstanceType, RequestSpotLaunchSpecification, SpotInstanceType};
        let spec = RequestSpotLaunchSpecification::builder()
            .instance_type(InstanceType::from(request.instance.instance_type.as_str()))
            .image_id(&request.instance.image_id)
            .set_key_name(request.instance.key_pair.clone())
            .user_data(&request.bootstrap_payload)
            .build();
        let out = self
            .ctx
            .block_on(
                self.client
                    .request_spot_instances()
                    .spot_price(request.price_limit.to_string())
                    .instance_count(request.desired_count.min(i32::MAX as u32) as i32)
                    .r#type(SpotInstanceType::Persistent)
                    .launch_specification(spec)
                    .send(),
            )
            .map_err(|e| ReduceError::Fleet(format!("request spot instances: {}", e)))?;
        Ok(out
            .spot_instance_requests()
            .iter()
            .filter_map(|r| r.spot_instance_request_id().map(str::to_string))
            .collect())
    }

    fn describe_requests(&self) -> Result<Vec<CapacityRequest>, ReduceError> {
        let mut requests = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let out = self
                .ctx
                .block_on(
                    self.client
                        .describe_spot_instance_requests()
                        .set_next_token(token.clone())
                        .send(),
                )
                .map_err(|e| ReduceError::Fleet(format!("describe spot requests: {}", e)))?;
            for request in out.spot_instance_requests() {
                let (Some(id), Some(state)) = (
                    request.spot_instance_request_id(),
                    request.state().and_then(|s| RequestState::parse(s.as_str())),
                ) else {
                    continue;
                };
                requests.push(CapacityRequest {
                    id: id.to_string(),
                    state,
                    instance_id: request.instance_id().map(str::to_string),
                });
            }
            match out.next_token() {
                Some(next) if !next.is_empty() => token = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(requests)
    }

    fn cancel_requests(&self, ids: &[String]) -> Result<(), ReduceError> {
        self.ctx
            .block_on(
                self.client
                    .cancel_spot_instance_requests()
                    .set_spot_instance_request_ids(Some(ids.to_vec()))
                    .send(),
            )
            .map_err(|e| ReduceError::Fleet(format!("cancel spot requests: {}", e)))?;
        Ok(())
    }

    fn terminate_instances(&self, ids: &[String]) -> Result<(), ReduceError> {
        self.ctx
            .block_on(
                self.client
                    .terminate_instances()
                    .set_instance_ids(Some(ids.to_vec()))
                    .send(),
            )
            .map_err(|e| ReduceError::Fleet(format!("terminate instances: {}", e)))?;
        Ok(())
    }
}
