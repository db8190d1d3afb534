use std::{collections::VecDeque, time::Duration};

use metrics::counter;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    sync::Notify,
    time::{timeout_at, Instant},
};
use tracing::trace;

/// One unit of outbound work for the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// A statement the browser evaluates verbatim.
    Statement(String),
    /// Tells the poll loop to stop.
    End,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("timeout inserting task: {statement}")]
pub struct QueueFull {
    pub statement: String,
}

/// Per-session FIFO of statements waiting for the browser's next poll.
///
/// Producers wait for space once `capacity` statements are pending; the poll side
/// waits for work. Both waits are bounded by the caller.
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    capacity: usize,
    ready: Notify,
    space: Notify,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            ready: Notify::new(),
            space: Notify::new(),
        }
    }

    /// Appends `statement`, waiting up to `budget` for room. On timeout the
    /// statement is handed back inside the error and nothing is queued.
    pub async fn enqueue(&self, statement: String, budget: Duration) -> Result<(), QueueFull> {
        let deadline = Instant::now() + budget;
        loop {
            {
                let mut tasks = self.tasks.lock();
                if tasks.len() < self.capacity {
                    trace!(pending = tasks.len(), statement = %statement, "task queued");
                    tasks.push_back(Task::Statement(statement));
                    drop(tasks);
                    counter!("riptide_tasks_enqueued_total", 1);
                    self.ready.notify_one();
                    return Ok(());
                }
            }
            if timeout_at(deadline, self.space.notified()).await.is_err() {
                counter!("riptide_tasks_dropped_total", 1);
                return Err(QueueFull { statement });
            }
        }
    }

    /// Appends without honouring the capacity. Used for the end sentinel and for
    /// statements flushed from contexts that cannot wait.
    pub fn push_unchecked(&self, task: Task) {
        self.tasks.lock().push_back(task);
        self.ready.notify_one();
    }

    pub fn push_end(&self) {
        self.push_unchecked(Task::End);
    }

    /// Waits up to `wait` for the next task. `None` means nothing arrived in time.
    pub async fn dequeue(&self, wait: Duration) -> Option<Task> {
        let deadline = Instant::now() + wait;
        loop {
            let next = self.tasks.lock().pop_front();
            if let Some(task) = next {
                self.space.notify_one();
                return Some(task);
            }
            if timeout_at(deadline, self.ready.notified()).await.is_err() {
                return None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}
