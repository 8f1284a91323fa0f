//! In-memory pending-task queue.
//!
//! The queue keeps tasks in dispatch order:
//!
//! - Higher priority first (`high` > `normal` > `low`)
//! - Within a priority, higher estimated complexity first, so long tasks
//!   start early and do not end up as the tail of a batch
//! - Tasks with equal rank keep submission order
//!
//! Retried tasks bypass the ordering and are placed at the head of the
//! queue, so a task that already consumed a worker finishes promptly.
//!
//! Enqueue and pop are O(log n); membership checks are O(1).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};

use super::task::Task;

/// Heap entry: task rank first, then earlier submission first.
#[derive(Debug)]
struct QueuedTask {
    sequence: u64,
    task: Task,
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.task
            .schedule_cmp(&other.task)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedTask {}

/// Ordered queue of tasks waiting for a worker.
#[derive(Debug, Default)]
pub struct PendingQueue {
    /// Requeued tasks, dispatched before anything in `ranked`.
    front: VecDeque<Task>,
    ranked: BinaryHeap<QueuedTask>,
    ids: HashSet<String>,
    next_sequence: u64,
}

impl PendingQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a task at its ordered position.
    pub fn enqueue(&mut self, task: Task) {
        self.ids.insert(task.id.clone());
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.ranked.push(QueuedTask { sequence, task });
    }

    /// Inserts a batch of tasks at their ordered positions.
    pub fn enqueue_batch(&mut self, tasks: impl IntoIterator<Item = Task>) {
        let tasks = tasks.into_iter();
        self.ranked.reserve(tasks.size_hint().0);
        for task in tasks {
            self.enqueue(task);
        }
    }

    /// Places a task at the head of the queue (used for retries).
    pub fn requeue_front(&mut self, task: Task) {
        self.ids.insert(task.id.clone());
        self.front.push_front(task);
    }

    /// Removes and returns the next task to dispatch.
    pub fn pop(&mut self) -> Option<Task> {
        let task = match self.front.pop_front() {
            Some(task) => task,
            None => self.ranked.pop()?.task,
        };
        self.ids.remove(&task.id);
        Some(task)
    }

    /// Returns whether a task with this id is queued.
    pub fn contains(&self, task_id: &str) -> bool {
        self.ids.contains(task_id)
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.front.len() + self.ranked.len()
    }

    /// Returns whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.front.is_empty() && self.ranked.is_empty()
    }

    /// Removes every queued task and returns them in dispatch order.
    pub fn drain(&mut self) -> Vec<Task> {
        self.ids.clear();
        let mut tasks: Vec<Task> = self.front.drain(..).collect();
        // into_sorted_vec is ascending; dispatch order is the reverse.
        let ranked = std::mem::take(&mut self.ranked).into_sorted_vec();
        tasks.extend(ranked.into_iter().rev().map(|queued| queued.task));
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::{Priority, TaskSpec};

    fn task(id: &str, priority: Priority, complexity: f64) -> Task {
        Task::from_spec(
            TaskSpec::new(id)
                .with_priority(priority)
                .with_complexity(complexity),
            "batch",
        )
    }

    fn pop_ids(queue: &mut PendingQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.pop()).map(|t| t.id).collect()
    }

    #[test]
    fn test_priority_order() {
        let mut queue = PendingQueue::new();
        queue.enqueue(task("low", Priority::Low, 1.0));
        queue.enqueue(task("high", Priority::High, 1.0));
        queue.enqueue(task("normal", Priority::Normal, 1.0));

        assert_eq!(pop_ids(&mut queue), vec!["high", "normal", "low"]);
    }

    #[test]
    fn test_complexity_breaks_ties() {
        let mut queue = PendingQueue::new();
        queue.enqueue_batch(vec![
            task("small", Priority::Normal, 1.0),
            task("large", Priority::Normal, 9.0),
            task("medium", Priority::Normal, 5.0),
            task("urgent-small", Priority::High, 1.0),
        ]);

        assert_eq!(
            pop_ids(&mut queue),
            vec!["urgent-small", "large", "medium", "small"]
        );
    }

    #[test]
    fn test_equal_rank_is_fifo() {
        let mut queue = PendingQueue::new();
        queue.enqueue(task("first", Priority::Normal, 3.0));
        queue.enqueue(task("second", Priority::Normal, 3.0));
        queue.enqueue(task("third", Priority::Normal, 3.0));

        assert_eq!(pop_ids(&mut queue), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_requeue_front() {
        let mut queue = PendingQueue::new();
        queue.enqueue(task("high", Priority::High, 1.0));
        queue.requeue_front(task("retry", Priority::Low, 1.0));

        assert_eq!(queue.len(), 2);
        assert!(queue.contains("high"));
        assert!(queue.contains("retry"));
        assert!(!queue.contains("missing"));

        assert_eq!(queue.pop().map(|t| t.id), Some("retry".to_string()));
        assert!(!queue.contains("retry"));
        assert_eq!(queue.pop().map(|t| t.id), Some("high".to_string()));
        assert!(!queue.contains("high"));
    }

    #[test]
    fn test_drain() {
        let mut queue = PendingQueue::new();
        queue.enqueue(task("a", Priority::Normal, 1.0));
        queue.enqueue(task("b", Priority::High, 1.0));
        queue.requeue_front(task("r", Priority::Low, 1.0));

        let drained: Vec<String> = queue.drain().into_iter().map(|t| t.id).collect();
        assert_eq!(drained, vec!["r", "b", "a"]);
        assert!(queue.is_empty());
        assert!(!queue.contains("a"));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_large_batch_keeps_dispatch_order() {
        const N: usize = 100_000;
        let priorities = [Priority::Low, Priority::Normal, Priority::High];

        let mut queue = PendingQueue::new();
        queue.enqueue_batch((0..N).map(|i| {
            task(
                &format!("t-{:06}", i),
                priorities[i % 3],
                (i % 7) as f64 + 1.0,
            )
        }));
        assert_eq!(queue.len(), N);
        assert!(queue.contains("t-000000"));
        assert!(queue.contains(&format!("t-{:06}", N - 1)));

        let popped: Vec<Task> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(popped.len(), N);
        assert!(queue.is_empty());

        for pair in popped.windows(2) {
            match pair[0].schedule_cmp(&pair[1]) {
                Ordering::Greater => {}
                // Equal rank: zero-padded ids encode submission order.
                Ordering::Equal => assert!(pair[0].id < pair[1].id),
                Ordering::Less => panic!("{} dispatched before {}", pair[0].id, pair[1].id),
            }
        }
    }
}
