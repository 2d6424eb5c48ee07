//! Pending operation queue
//!
//! Normal-priority operations are always admitted before low-priority ones.
//! Within a priority class the execution order decides: FIFO appends to the
//! tail, LIFO inserts at the head, and admission pops from the head.

use crate::operation::DownloadOperation;
use imgfetch_types::{ExecutionOrder, Priority};
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    normal: VecDeque<Arc<DownloadOperation>>,
    low: VecDeque<Arc<DownloadOperation>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, operation: Arc<DownloadOperation>, order: ExecutionOrder) {
        let lane = match operation.priority() {
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        };
        match order {
            ExecutionOrder::Fifo => lane.push_back(operation),
            ExecutionOrder::Lifo => lane.push_front(operation),
        }
    }

    /// Next operation to admit
    pub fn pop(&mut self) -> Option<Arc<DownloadOperation>> {
        self.normal.pop_front().or_else(|| self.low.pop_front())
    }

    pub fn remove(&mut self, id: Uuid) -> Option<Arc<DownloadOperation>> {
        for lane in [&mut self.normal, &mut self.low] {
            if let Some(pos) = lane.iter().position(|op| op.id() == id) {
                return lane.remove(pos);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.normal.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.normal.is_empty() && self.low.is_empty()
    }

    /// Remove and return everything, in admission order
    pub fn drain(&mut self) -> Vec<Arc<DownloadOperation>> {
        self.normal.drain(..).chain(self.low.drain(..)).collect()
    }
}
