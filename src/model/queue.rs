use std::collections::VecDeque;

/// A task tagged with the sequence number that was current when it was
/// submitted.
#[derive(Debug)]
pub struct Sequenced<T> {
    pub sequence: u64,
    pub task: T,
}

impl<T> Sequenced<T> {
    /// A task is stale once a newer request bumped the sequence.
    pub fn is_stale(&self, current: u64) -> bool {
        self.sequence != current
    }
}

/// Runs tasks one at a time in submission order.
///
/// The queue never drives the tasks itself: `push` and `complete` hand back
/// the task that should start now, and the owner reports back with
/// `complete` once that task has finished all of its asynchronous steps.
#[derive(Debug)]
pub struct SequencedTaskQueue<T> {
    waiting: VecDeque<Sequenced<T>>,
    running: bool,
}

impl<T> Default for SequencedTaskQueue<T> {
    fn default() -> Self {
        Self {
            waiting: VecDeque::new(),
            running: false,
        }
    }
}

impl<T> SequencedTaskQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit `task`. Returns it straight back if nothing is running.
    #[must_use]
    pub fn push(&mut self, sequence: u64, task: T) -> Option<Sequenced<T>> {
        let item = Sequenced { sequence, task };
        if self.running {
            self.waiting.push_back(item);
            None
        } else {
            self.running = true;
            Some(item)
        }
    }

    /// Mark the running task finished and return the next one to start.
    #[must_use]
    pub fn complete(&mut self) -> Option<Sequenced<T>> {
        let next = self.waiting.pop_front();
        self.running = next.is_some();
        next
    }

    pub fn is_idle(&self) -> bool {
        !self.running
    }

    /// Tasks waiting behind the running one.
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_push_starts_immediately() {
        let mut queue = SequencedTaskQueue::new();
        let started = queue.push(1, "a").unwrap();
        assert_eq!(started.task, "a");
        assert!(!queue.is_idle());
    }

    #[test]
    fn tasks_run_in_submission_order() {
        let mut queue = SequencedTaskQueue::new();
        assert!(queue.push(1, "a").is_some());
        assert!(queue.push(2, "b").is_none());
        assert!(queue.push(3, "c").is_none());
        assert_eq!(queue.waiting(), 2);

        assert_eq!(queue.complete().unwrap().task, "b");
        assert_eq!(queue.complete().unwrap().task, "c");
        assert!(queue.complete().is_none());
        assert!(queue.is_idle());
    }

    #[test]
    fn staleness_compares_sequence() {
        let mut queue = SequencedTaskQueue::new();
        let task = queue.push(4, ()).unwrap();
        assert!(!task.is_stale(4));
        assert!(task.is_stale(5));
    }

    #[test]
    fn idle_queue_restarts_on_push() {
        let mut queue = SequencedTaskQueue::new();
        assert!(queue.push(1, 1).is_some());
        assert!(queue.complete().is_none());
        assert!(queue.push(2, 2).is_some());
    }
}
