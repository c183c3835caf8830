//! Bounded memory of retired run ids

use std::collections::{HashSet, VecDeque};

use collab_core::RunId;

pub const DEFAULT_RETIRED_CAPACITY: usize = 1024;

/// Most recently retired run ids, oldest evicted first
#[derive(Clone, Debug)]
pub struct RetiredRuns {
    order: VecDeque<RunId>,
    members: HashSet<RunId>,
    capacity: usize,
}

impl RetiredRuns {
    pub fn new(capacity: usize) -> Self {
        RetiredRuns {
            order: VecDeque::with_capacity(capacity.min(DEFAULT_RETIRED_CAPACITY)),
            members: HashSet::new(),
            capacity,
        }
    }

    pub fn insert(&mut self, run_id: RunId) {
        if self.capacity == 0 || self.members.contains(&run_id) {
            return;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.members.insert(run_id.clone());
        self.order.push_back(run_id);
    }

    pub fn remove(&mut self, run_id: &RunId) -> bool {
        if self.members.remove(run_id) {
            self.order.retain(|r| r != run_id);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, run_id: &RunId) -> bool {
        self.members.contains(run_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for RetiredRuns {
    fn default() -> Self {
        RetiredRuns::new(DEFAULT_RETIRED_CAPACITY)
    }
}
