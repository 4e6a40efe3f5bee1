//! Task queue: an ordered FIFO group of tasks handed to a pool.

use std::collections::VecDeque;

use crate::task::Task;

/// Ordered, mutable container of tasks.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    name: String,
    tasks: VecDeque<Task>,
}

impl TaskQueue {
    /// Create an empty queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: VecDeque::new(),
        }
    }

    /// Queue name, used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a task.
    pub fn enqueue(&mut self, task: Task) {
        tracing::trace!(queue = %self.name, key = %task.key, "Task enqueued");
        self.tasks.push_back(task);
    }

    /// Remove and return the earliest task.
    pub fn dequeue(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    /// Look at the earliest task without removing it.
    pub fn peek(&self) -> Option<&Task> {
        self.tasks.front()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Snapshot copy of the queued tasks, in order.
    pub fn all_tasks(&self) -> Vec<Task> {
        self.tasks.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
    }

    /// Take every task out, in order.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Task> + '_ {
        self.tasks.drain(..)
    }
}

impl Extend<Task> for TaskQueue {
    fn extend<I: IntoIterator<Item = Task>>(&mut self, iter: I) {
        for task in iter {
            self.enqueue(task);
        }
    }
}
