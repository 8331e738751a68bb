use crate::error::ReduceError;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Upper bound on entries per batched send call.
pub const SEND_BATCH_SIZE: usize = 10;

/// One delivery of a queued work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Opaque receipt handle, only used to acknowledge this delivery.
    pub handle: String,
    pub body_key: String,
    /// 1-based count of deliveries so far, including this one.
    pub receive_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueAttributes {
    pub visible: u64,
    pub in_flight: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub id: String,
    pub body: String,
}

pub trait JobQueueLike: Send + Sync {
    /// Send at most `SEND_BATCH_SIZE` entries in one call. Entry ids must be unique within the call.
    fn send_batch(&self, entries: &[BatchEntry]) -> Result<(), ReduceError>;
    fn receive_one(&self, visibility_timeout: Duration) -> Result<Option<Job>, ReduceError>;
    fn ack(&self, job: &Job) -> Result<(), ReduceError>;
    fn attributes(&self) -> Result<QueueAttributes, ReduceError>;
    /// Drop the queue entirely. The next access re-creates it.
    fn delete_queue(&self) -> Result<(), ReduceError>;

    fn enqueue_batch(&self, items: &[String]) -> Result<usize, ReduceError> {
        for chunk in items.chunks(SEND_BATCH_SIZE) {
            let entries: Vec<BatchEntry> = chunk
                .iter()
                .enumerate()
                .map(|(i, body)| BatchEntry {
                    id: format!("task_{}", i),
                    body: body.clone(),
                })
                .collect();
            self.send_batch(&entries)?;
        }
        Ok(items.len())
    }
}

struct StoredMessage {
    id: u64,
    body: String,
    receive_count: u32,
    invisible_until: Option<Instant>,
}

#[derive(Default)]
struct MemoryState {
    messages: VecDeque<StoredMessage>,
    next_id: u64,
    sent_batches: Vec<usize>,
}

/// In-process queue with visibility timeouts and receive counts. Used by tests and
/// single-machine runs.
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<MemoryState>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sizes of every `send_batch` call so far, in call order.
    pub fn sent_batches(&self) -> Vec<usize> {
        self.lock().sent_batches.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bodies(&self) -> Vec<String> {
        self.lock().messages.iter().map(|m| m.body.clone()).collect()
    }

    /// Make every in-flight message visible again, as if its visibility timeout elapsed.
    pub fn expire_in_flight(&self) {
        for message in self.lock().messages.iter_mut() {
            message.invisible_until = None;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn handle_for(id: u64, receive_count: u32) -> String {
    format!("{}:{}", id, receive_count)
}

impl JobQueueLike for InMemoryQueue {
    fn send_batch(&self, entries: &[BatchEntry]) -> Result<(), ReduceError> {
        if entries.len() > SEND_BATCH_SIZE {
            return Err(ReduceError::Queue(format!(
                "batch of {} exceeds limit of {}",
                entries.len(),
                SEND_BATCH_SIZE
            )));
        }
        let mut state = self.lock();
        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|e| e.id == entry.id) {
                return Err(ReduceError::Queue(format!("duplicate batch entry id {}", entry.id)));
            }
        }
        state.sent_batches.push(entries.len());
        for entry in entries {
            let id = state.next_id;
            state.next_id += 1;
            state.messages.push_back(StoredMessage {
                id,
                body: entry.body.clone(),
                receive_count: 0,
                invisible_until: None,
            });
        }
        Ok(())
    }

    fn receive_one(&self, visibility_timeout: Duration) -> Result<Option<Job>, ReduceError> {
        let now = Instant::now();
        let mut state = self.lock();
        let found = state
            .messages
            .iter_mut()
            .find(|m| m.invisible_until.map_or(true, |until| until <= now));
        if let Some(message) = found {
            message.receive_count += 1;
            message.invisible_until = Some(now + visibility_timeout);
            return Ok(Some(Job {
                handle: handle_for(message.id, message.receive_count),
                body_key: message.body.clone(),
                receive_count: message.receive_count,
            }));
        }
        drop(state);
        // stand-in for a long poll
        std::thread::sleep(Duration::from_millis(10));
        Ok(None)
    }

    fn ack(&self, job: &Job) -> Result<(), ReduceError> {
        let id = job
            .handle
            .split(':')
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| ReduceError::Queue(format!("malformed receipt handle {}", job.handle)))?;
        self.lock().messages.retain(|m| m.id != id);
        Ok(())
    }

    fn attributes(&self) -> Result<QueueAttributes, ReduceError> {
        let now = Instant::now();
        let state = self.lock();
        let in_flight = state
            .messages
            .iter()
            .filter(|m| m.invisible_until.map_or(false, |until| until > now))
            .count() as u64;
        Ok(QueueAttributes {
            visible: state.messages.len() as u64 - in_flight,
            in_flight,
        })
    }

    fn delete_queue(&self) -> Result<(), ReduceError> {
        let mut state = self.lock();
        state.messages.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("data/{}.warc.gz", i)).collect()
    }

    #[test]
    fn test_enqueue_batch_chunks_by_ten() {
        let queue = InMemoryQueue::new();
        let queued = queue.enqueue_batch(&keys(25)).unwrap();
        assert_eq!(queued, 25);
        assert_eq!(queue.sent_batches(), vec![10, 10, 5]);
        assert_eq!(queue.len(), 25);
    }

    #[test]
    fn test_receive_hides_message_until_expired() {
        let queue = InMemoryQueue::new();
        queue.enqueue_batch(&keys(1)).unwrap();

        let first = queue.receive_one(Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(first.receive_count, 1);
        assert!(queue.receive_one(Duration::from_secs(60)).unwrap().is_none());

        let attrs = queue.attributes().unwrap();
        assert_eq!(attrs, QueueAttributes { visible: 0, in_flight: 1 });

        queue.expire_in_flight();
        let second = queue.receive_one(Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(second.body_key, first.body_key);
        assert_eq!(second.receive_count, 2);
        assert_ne!(second.handle, first.handle);
    }

    #[test]
    fn test_ack_removes_message() {
        let queue = InMemoryQueue::new();
        queue.enqueue_batch(&keys(2)).unwrap();
        let job = queue.receive_one(Duration::from_secs(60)).unwrap().unwrap();
        queue.ack(&job).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.attributes().unwrap().visible, 1);
    }

    #[test]
    fn test_oversized_batch_rejected() {
        let queue = InMemoryQueue::new();
        let entries: Vec<BatchEntry> = (0..11)
            .map(|i| BatchEntry { id: format!("task_{}", i), body: i.to_string() })
            .collect();
        assert!(queue.send_batch(&entries).is_err());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_entry_ids_rejected() {
        let queue = InMemoryQueue::new();
        let entries = vec![
            BatchEntry { id: "task_0".into(), body: "a".into() },
            BatchEntry { id: "task_0".into(), body: "b".into() },
        ];
        assert!(queue.send_batch(&entries).is_err());
    }
}
