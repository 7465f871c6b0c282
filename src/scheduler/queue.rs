//! Priority request queue
//!
//! One FIFO per priority tier. A request becomes eligible at its `ready_at`
//! time; retries are pushed back with a later `ready_at` instead of being
//! held by a timer.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::types::{Discovery, Priority, Result};

/// A pending provider lookup and the continuation that receives its result
#[derive(Debug)]
pub struct QueueRequest {
    pub id: Uuid,
    pub name: String,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub ready_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    responder: oneshot::Sender<Result<Discovery>>,
}

impl QueueRequest {
    pub fn new(
        name: impl Into<String>,
        priority: Priority,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> (Self, oneshot::Receiver<Result<Discovery>>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            id: Uuid::new_v4(),
            name: name.into(),
            priority,
            enqueued_at: now,
            ready_at: now,
            retry_count: 0,
            max_retries,
            responder: tx,
        };
        (request, rx)
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Deliver the result; a caller that stopped waiting is ignored
    pub fn resolve(self, result: Result<Discovery>) {
        let _ = self.responder.send(result);
    }
}

#[derive(Debug, Default)]
pub struct RequestQueue {
    high: VecDeque<QueueRequest>,
    normal: VecDeque<QueueRequest>,
    low: VecDeque<QueueRequest>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn tier(&self, priority: Priority) -> &VecDeque<QueueRequest> {
        match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }

    fn tier_mut(&mut self, priority: Priority) -> &mut VecDeque<QueueRequest> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    pub fn push(&mut self, request: QueueRequest) {
        self.tier_mut(request.priority).push_back(request);
    }

    /// Oldest ready request from the highest non-empty tier
    pub fn pop_ready(&mut self, now: DateTime<Utc>) -> Option<QueueRequest> {
        for priority in Priority::ALL {
            let tier = self.tier_mut(priority);
            if let Some(idx) = tier.iter().position(|r| r.ready_at <= now) {
                return tier.remove(idx);
            }
        }
        None
    }

    /// Earliest time any queued request becomes ready
    pub fn next_ready_at(&self) -> Option<DateTime<Utc>> {
        Priority::ALL
            .iter()
            .flat_map(|p| self.tier(*p).iter().map(|r| r.ready_at))
            .min()
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    pub fn len_of(&self, priority: Priority) -> usize {
        self.tier(priority).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove everything, highest priority first
    pub fn drain(&mut self) -> Vec<QueueRequest> {
        let mut all = Vec::with_capacity(self.len());
        all.extend(self.high.drain(..));
        all.extend(self.normal.drain(..));
        all.extend(self.low.drain(..));
        all
    }
}
