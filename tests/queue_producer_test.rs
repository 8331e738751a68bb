use std::collections::HashMap;
use webreduce::blob_store::{BlobStoreLike, InMemoryBlobStore};
use webreduce::config::Config;
use webreduce::operator::queue_inputs;
use webreduce::queue::{InMemoryQueue, JobQueueLike};

fn config() -> Config {
    let map: HashMap<String, String> = [
        ("DATA_BUCKET", "commoncrawl"),
        ("DATA_PREFIX", "crawl-data"),
        ("RESULT_BUCKET", "results"),
        ("DEPLOY_BUCKET", "deploy"),
        ("QUEUE_NAME", "jobs"),
        ("DATA_DOMAIN", "data"),
        ("ERROR_DOMAIN", "failed"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    Config::from_map(&map).unwrap()
}

fn seed(blobs: &InMemoryBlobStore, prefix: &str, count: usize) {
    for i in 0..count {
        let key = format!("crawl-data/{}/segments/{:04}.warc.gz", prefix, i);
        blobs.put("commoncrawl", &key, vec![0; 4]).unwrap();
    }
}

#[test]
fn test_twenty_five_keys_make_three_batches() {
    let queue = InMemoryQueue::new();
    let blobs = InMemoryBlobStore::new();
    seed(&blobs, "batch1", 25);

    let queued = queue_inputs(&queue, &blobs, &config(), &["batch1".to_string()], None).unwrap();
    assert_eq!(queued, 25);
    assert_eq!(queue.sent_batches(), vec![10, 10, 5]);
    assert_eq!(queue.attributes().unwrap().visible, 25);
}

#[test]
fn test_limit_stops_enqueueing_mid_listing() {
    let queue = InMemoryQueue::new();
    let blobs = InMemoryBlobStore::new();
    seed(&blobs, "batch1", 25);

    let queued = queue_inputs(&queue, &blobs, &config(), &["batch1".to_string()], Some(15)).unwrap();
    assert_eq!(queued, 15);
    assert_eq!(queue.len(), 15);
}
