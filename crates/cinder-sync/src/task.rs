//! Download tasks and the task queue.

use crate::peer::PeerId;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

/// What a task fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Block headers.
    Headers,
    /// Full blocks for already-validated headers.
    Bodies,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Headers => f.write_str("headers"),
            TaskKind::Bodies => f.write_str("bodies"),
        }
    }
}

/// One batch request: `count` consecutive items starting at height `from`.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// What to fetch.
    pub kind: TaskKind,
    /// First height of the batch.
    pub from: u64,
    /// Number of consecutive items.
    pub count: usize,
    /// Peer currently serving the task.
    pub peer: Option<PeerId>,
    /// When the request was handed to the transport.
    pub issued_at: Option<Instant>,
    /// How many times the task has been reassigned.
    pub retries: u32,
}

impl DownloadTask {
    /// Create an unassigned task.
    pub fn new(kind: TaskKind, from: u64, count: usize) -> Self {
        Self {
            kind,
            from,
            count,
            peer: None,
            issued_at: None,
            retries: 0,
        }
    }

    /// Height just past the end of the batch.
    pub fn end(&self) -> u64 {
        self.from + self.count as u64
    }

    /// Whether the request has been outstanding longer than `timeout`.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.issued_at
            .map(|t| t.elapsed() > timeout)
            .unwrap_or(false)
    }
}

/// Pending and in-flight tasks for one fetch phase.
///
/// Each peer serves at most one task, so in-flight tasks are keyed by peer.
#[derive(Debug, Default)]
pub struct TaskQueue {
    pending: VecDeque<DownloadTask>,
    in_flight: HashMap<PeerId, DownloadTask>,
}

impl TaskQueue {
    /// Split the inclusive height range `[from, to]` into batch tasks.
    pub fn partition(kind: TaskKind, from: u64, to: u64, batch: usize) -> Self {
        assert!(batch > 0, "batch size must be positive");
        let mut pending = VecDeque::new();
        let mut height = from;
        while height <= to {
            let remaining = to - height + 1;
            let count = remaining.min(batch as u64) as usize;
            pending.push_back(DownloadTask::new(kind, height, count));
            height += count as u64;
        }
        Self {
            pending,
            in_flight: HashMap::new(),
        }
    }

    /// Take the next unassigned task.
    pub fn pop_pending(&mut self) -> Option<DownloadTask> {
        self.pending.pop_front()
    }

    /// Record a task as handed to `peer`.
    pub fn dispatched(&mut self, peer: PeerId, mut task: DownloadTask) {
        task.peer = Some(peer.clone());
        task.issued_at = Some(Instant::now());
        self.in_flight.insert(peer, task);
    }

    /// The task assigned to `peer`, if any.
    pub fn in_flight(&self, peer: &PeerId) -> Option<&DownloadTask> {
        self.in_flight.get(peer)
    }

    /// Remove and return the task assigned to `peer`, if any.
    pub fn take_in_flight(&mut self, peer: &PeerId) -> Option<DownloadTask> {
        self.in_flight.remove(peer)
    }

    /// Put a task back at the front of the pending queue.
    pub fn requeue(&mut self, mut task: DownloadTask) {
        task.peer = None;
        task.issued_at = None;
        self.pending.push_front(task);
    }

    /// Peers whose in-flight task has exceeded `timeout`.
    pub fn timed_out(&self, timeout: Duration) -> Vec<PeerId> {
        self.in_flight
            .iter()
            .filter(|(_, task)| task.is_timed_out(timeout))
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// Time until the oldest in-flight request hits `timeout`.
    ///
    /// Returns `timeout` itself when nothing is in flight.
    pub fn next_deadline(&self, timeout: Duration) -> Duration {
        self.in_flight
            .values()
            .filter_map(|task| task.issued_at)
            .map(|issued| timeout.saturating_sub(issued.elapsed()))
            .min()
            .unwrap_or(timeout)
    }

    /// Number of unassigned tasks.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of tasks currently assigned to peers.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether every task has completed.
    pub fn is_done(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_covers_range_exactly() {
        let mut queue = TaskQueue::partition(TaskKind::Headers, 3, 12, 4);
        let mut covered = Vec::new();
        while let Some(task) = queue.pop_pending() {
            assert!(task.count <= 4);
            for h in task.from..task.end() {
                covered.push(h);
            }
        }
        assert_eq!(covered, (3..=12).collect::<Vec<_>>());
    }

    #[test]
    fn test_partition_single_item_range() {
        let mut queue = TaskQueue::partition(TaskKind::Bodies, 7, 7, 64);
        let task = queue.pop_pending().unwrap();
        assert_eq!((task.from, task.count), (7, 1));
        assert!(queue.is_done());
    }

    #[test]
    fn test_dispatch_and_complete() {
        let mut queue = TaskQueue::partition(TaskKind::Headers, 0, 9, 5);
        let peer = PeerId::from("p1");

        let task = queue.pop_pending().unwrap();
        queue.dispatched(peer.clone(), task);
        assert_eq!(queue.in_flight_len(), 1);
        assert!(!queue.is_done());

        let done = queue.take_in_flight(&peer).unwrap();
        assert_eq!(done.peer, Some(peer));
        assert_eq!(queue.in_flight_len(), 0);
    }

    #[test]
    fn test_requeue_restores_priority() {
        let mut queue = TaskQueue::partition(TaskKind::Headers, 0, 19, 5);
        let first = queue.pop_pending().unwrap();
        let first_from = first.from;
        queue.dispatched(PeerId::from("p1"), first);

        let mut failed = queue.take_in_flight(&PeerId::from("p1")).unwrap();
        failed.retries += 1;
        queue.requeue(failed);

        // The failed range comes back before later ranges.
        let next = queue.pop_pending().unwrap();
        assert_eq!(next.from, first_from);
        assert_eq!(next.retries, 1);
        assert!(next.peer.is_none());
    }

    #[test]
    fn test_timed_out_detection() {
        let mut queue = TaskQueue::partition(TaskKind::Bodies, 0, 3, 2);
        let peer = PeerId::from("slow");
        let task = queue.pop_pending().unwrap();
        queue.dispatched(peer.clone(), task);

        assert!(queue.timed_out(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(queue.timed_out(Duration::ZERO), vec![peer]);
    }

    #[test]
    fn test_next_deadline_defaults_to_timeout() {
        let queue = TaskQueue::partition(TaskKind::Headers, 0, 3, 2);
        let timeout = Duration::from_secs(10);
        assert_eq!(queue.next_deadline(timeout), timeout);
    }
}
