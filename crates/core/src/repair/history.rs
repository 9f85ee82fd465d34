//! Bounded record of finished repair tasks.

use std::collections::VecDeque;
use std::sync::Mutex;

use super::types::RepairTask;

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

pub struct RepairHistory {
    tasks: Mutex<VecDeque<RepairTask>>,
    capacity: usize,
}

impl RepairHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Record a task, dropping the oldest one when full.
    pub fn push(&self, task: RepairTask) {
        let mut tasks = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if tasks.len() == self.capacity {
            tasks.pop_front();
        }
        tasks.push_back(task);
    }

    /// Up to `limit` tasks, newest first.
    pub fn recent(&self, limit: usize) -> Vec<RepairTask> {
        let tasks = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RepairHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
