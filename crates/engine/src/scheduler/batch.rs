use std::time::Duration;
use uuid::Uuid;

use super::request::{Priority, QueryRequest};

/// Batch-eligible requests of one priority executed as a single unit of work.
#[derive(Debug)]
pub(crate) struct QueryBatch {
    pub id: Uuid,
    pub priority: Priority,
    pub requests: Vec<QueryRequest>,
    pub estimated_duration: Duration,
}

impl QueryBatch {
    pub(crate) fn new(priority: Priority, requests: Vec<QueryRequest>, efficiency: f64) -> Self {
        let total: Duration = requests.iter().map(|r| r.estimated_duration).sum();
        Self {
            id: Uuid::new_v4(),
            priority,
            requests,
            estimated_duration: total.mul_f64(efficiency),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }
}
