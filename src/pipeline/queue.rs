//! Two-level priority queue with per-component coalescing (`spec.md` §4.4).
//!
//! Workers poll the high-priority FIFO first, then normal. Enqueuing a task
//! for a component already queued replaces the queued one; enqueuing while
//! that component is in flight just marks it dirty so a follow-up build is
//! queued on completion. This bounds queue length by the number of distinct
//! components.

use crate::types::{BuildTask, Priority};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::Notify;

struct State {
    high: VecDeque<BuildTask>,
    normal: VecDeque<BuildTask>,
    queued_names: HashSet<String>,
    in_flight: HashSet<String>,
    dirty_while_in_flight: HashSet<String>,
}

pub struct TaskQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                queued_names: HashSet::new(),
                in_flight: HashSet::new(),
                dirty_while_in_flight: HashSet::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue `task`. If a task for the same component is already queued,
    /// it is replaced in place (keeping its original queue position). If the
    /// component is currently in flight, no new task is queued — the
    /// component is marked dirty so `complete` re-queues it.
    pub fn enqueue(&self, task: BuildTask) {
        let mut state = self.state.lock().expect("queue poisoned");
        let name = task.component.name.clone();

        if state.in_flight.contains(&name) {
            state.dirty_while_in_flight.insert(name);
            return;
        }

        if state.queued_names.contains(&name) {
            let queue = match task.priority {
                Priority::High => &mut state.high,
                Priority::Normal => &mut state.normal,
            };
            if let Some(existing) = queue.iter_mut().find(|t| t.component.name == name) {
                *existing = task;
                self.notify.notify_one();
                return;
            }
            // Task was in the other priority queue — remove it there and
            // re-insert at the new priority.
            let other = match task.priority {
                Priority::High => &mut state.normal,
                Priority::Normal => &mut state.high,
            };
            other.retain(|t| t.component.name != name);
        } else {
            state.queued_names.insert(name);
        }

        match task.priority {
            Priority::High => state.high.push_back(task),
            Priority::Normal => state.normal.push_back(task),
        }
        self.notify.notify_one();
    }

    /// Pop the next task to run, marking its component in-flight. High
    /// priority is polled before normal.
    pub async fn pop(&self) -> BuildTask {
        loop {
            {
                let mut state = self.state.lock().expect("queue poisoned");
                let task = state.high.pop_front().or_else(|| state.normal.pop_front());
                if let Some(task) = task {
                    state.queued_names.remove(&task.component.name);
                    state.in_flight.insert(task.component.name.clone());
                    return task;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark `name` no longer in flight. Returns `true` if a dirty flag was
    /// set while it ran, meaning the caller should re-enqueue it.
    pub fn complete(&self, name: &str) -> bool {
        let mut state = self.state.lock().expect("queue poisoned");
        state.in_flight.remove(name);
        state.dirty_while_in_flight.remove(name)
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().expect("queue poisoned");
        state.high.len() + state.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ComponentInfo;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::SystemTime;

    fn component(name: &str) -> ComponentInfo {
        ComponentInfo {
            name: name.to_string(),
            package: "pkg".to_string(),
            file_path: PathBuf::from(format!("{name}.tmpl")),
            parameters: vec![],
            references: vec![],
            last_modified: SystemTime::now(),
            content_hash: "h".to_string(),
            metadata: HashMap::new(),
        }
    }

    fn task(name: &str, priority: Priority) -> BuildTask {
        BuildTask {
            component: component(name),
            priority,
            enqueued_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn high_priority_polled_before_normal() {
        let queue = TaskQueue::new();
        queue.enqueue(task("Normal1", Priority::Normal));
        queue.enqueue(task("High1", Priority::High));

        let first = queue.pop().await;
        assert_eq!(first.component.name, "High1");
    }

    #[tokio::test]
    async fn coalesces_repeated_enqueue_of_same_component() {
        let queue = TaskQueue::new();
        queue.enqueue(task("A", Priority::Normal));
        queue.enqueue(task("A", Priority::Normal));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn in_flight_enqueue_marks_dirty_instead_of_requeueing() {
        let queue = TaskQueue::new();
        queue.enqueue(task("A", Priority::Normal));
        let popped = queue.pop().await;
        assert_eq!(popped.component.name, "A");
        assert_eq!(queue.len(), 0);

        // A new change arrives while "A" is in flight.
        queue.enqueue(task("A", Priority::Normal));
        assert_eq!(queue.len(), 0, "dirty components don't grow the queue");

        let should_requeue = queue.complete("A");
        assert!(should_requeue);
    }
}
