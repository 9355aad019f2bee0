//! One guest's FIFO task queue.

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::task::BoxedJob;

/// Pending tasks of one guest plus whether a worker is draining them.
pub struct Execution {
    guest_id: String,
    queue: Mutex<Queue>,
}

#[derive(Default)]
struct Queue {
    tasks: VecDeque<BoxedJob>,
    started: bool,
}

impl Execution {
    pub fn new(guest_id: impl Into<String>) -> Self {
        Self {
            guest_id: guest_id.into(),
            queue: Mutex::new(Queue::default()),
        }
    }

    pub fn guest_id(&self) -> &str {
        &self.guest_id
    }

    /// Append a task. Returns true when the caller must start a worker.
    pub fn push(&self, task: BoxedJob) -> bool {
        let mut queue = self.queue.lock();
        queue.tasks.push_back(task);
        if queue.started {
            return false;
        }
        queue.started = true;
        true
    }

    /// Take the next task, or mark the worker stopped when none is left.
    pub fn next(&self) -> Option<BoxedJob> {
        let mut queue = self.queue.lock();
        let task = queue.tasks.pop_front();
        if task.is_none() {
            queue.started = false;
        }
        task
    }

    /// Remove every pending task.
    pub fn drain(&self) -> Vec<BoxedJob> {
        self.queue.lock().tasks.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().tasks.len()
    }

    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        let queue = self.queue.lock();
        queue.tasks.is_empty() && !queue.started
    }
}
