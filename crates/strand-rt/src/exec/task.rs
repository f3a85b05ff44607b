// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Units of deferred work and their priority classes.

/// Dequeue preference class. Workers drain `High` before `Normal` before
/// `Low`; within a class, FIFO per producer holds. A steady stream of
/// `High` work can starve `Low` work indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Priority {
    High = 0,
    #[default]
    Normal = 1,
    Low = 2,
}

/// Number of priority classes, used to size the global queue array.
pub(crate) const PRIORITY_CLASSES: usize = 3;

impl Priority {
    /// Index into the priority-ordered global queue array.
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// An owned, nullary action plus its priority class. Submitters hand
/// ownership to the executor; a worker takes it back exactly once to run it.
pub(crate) struct Task {
    action: Box<dyn FnOnce() + Send + 'static>,
    priority: Priority,
}

impl Task {
    pub(crate) fn new<F>(action: F, priority: Priority) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            action: Box::new(action),
            priority,
        }
    }

    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }

    /// Consume the task, yielding the action to run.
    pub(crate) fn into_action(self) -> Box<dyn FnOnce() + Send + 'static> {
        self.action
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_high_first() {
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::High.index(), 0);
        assert_eq!(Priority::Low.index(), 2);
    }

    #[test]
    fn default_priority_is_normal() {
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn task_runs_once() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let task = Task::new(|| {}, Priority::Low);
        assert_eq!(task.priority(), Priority::Low);

        let hit = Arc::new(AtomicBool::new(false));
        let task = Task::new(
            {
                let hit = hit.clone();
                move || hit.store(true, Ordering::Relaxed)
            },
            Priority::Normal,
        );
        (task.into_action())();
        assert!(hit.load(Ordering::Relaxed));
    }
}
