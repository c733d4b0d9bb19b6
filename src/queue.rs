use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::models::RelativePath;

pub const PRIORITY_PERMISSION_FILE: u8 = 0;
pub const PRIORITY_REGULAR_FILE: u8 = 1;

/// A path-level unit of sync work.
#[derive(Debug, Clone)]
pub struct FileChangeInfo {
    pub path: RelativePath,
    pub local_abs_path: PathBuf,
    pub priority: u8,
}

#[derive(Debug, Error)]
#[error("queue empty")]
pub struct Empty;

#[derive(Debug)]
struct QueueEntry {
    priority: u8,
    seq: u64,
    change: FileChangeInfo,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // BinaryHeap is a max-heap: invert so the lowest priority number wins,
    // FIFO within equal priority.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

/// Priority queue of pending sync work. Permission files (priority 0) are
/// served before regular files (priority 1).
#[derive(Default)]
pub struct SyncQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, change: FileChangeInfo) {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(QueueEntry {
            priority: change.priority,
            seq,
            change,
        });
        self.cond.notify_one();
    }

    /// Pop the highest-priority item, waiting up to `timeout`.
    pub fn get(&self, timeout: Duration) -> Result<FileChangeInfo, Empty> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(entry) = inner.heap.pop() {
                return Ok(entry.change);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Empty);
            }
            let (guard, _) = self
                .cond
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(path: &str, priority: u8) -> FileChangeInfo {
        FileChangeInfo {
            path: RelativePath::new(path).unwrap(),
            local_abs_path: PathBuf::from("/tmp").join(path),
            priority,
        }
    }

    #[test]
    fn permission_files_come_out_first() {
        let queue = SyncQueue::new();
        queue.put(change("a@x.com/one.txt", PRIORITY_REGULAR_FILE));
        queue.put(change("a@x.com/_.syftperm", PRIORITY_PERMISSION_FILE));
        queue.put(change("a@x.com/two.txt", PRIORITY_REGULAR_FILE));

        let first = queue.get(Duration::from_millis(10)).unwrap();
        assert_eq!(first.path.as_str(), "a@x.com/_.syftperm");
    }

    #[test]
    fn fifo_within_equal_priority() {
        let queue = SyncQueue::new();
        for name in ["one", "two", "three"] {
            queue.put(change(&format!("a@x.com/{name}.txt"), PRIORITY_REGULAR_FILE));
        }
        let order: Vec<String> = (0..3)
            .map(|_| {
                queue
                    .get(Duration::from_millis(10))
                    .unwrap()
                    .path
                    .as_str()
                    .to_string()
            })
            .collect();
        assert_eq!(
            order,
            vec!["a@x.com/one.txt", "a@x.com/two.txt", "a@x.com/three.txt"]
        );
    }

    #[test]
    fn get_times_out_on_empty_queue() {
        let queue = SyncQueue::new();
        let start = Instant::now();
        assert!(queue.get(Duration::from_millis(50)).is_err());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn producer_consumer_across_threads() {
        let queue = std::sync::Arc::new(SyncQueue::new());
        let producer = queue.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.put(change("a@x.com/late.txt", PRIORITY_REGULAR_FILE));
        });

        let item = queue.get(Duration::from_millis(500)).unwrap();
        assert_eq!(item.path.as_str(), "a@x.com/late.txt");
        handle.join().unwrap();
    }
}
