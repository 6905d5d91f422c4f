use std::{sync::Arc, time::Duration};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{PipelineError, PipelineResult};

/// Bounded pool of pipeline slots shared by all requests.
#[derive(Clone, Debug)]
pub struct Admission {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    wait: Duration,
}

/// A held slot; released on drop.
#[derive(Debug)]
pub struct Permit(#[allow(dead_code)] OwnedSemaphorePermit);

impl Admission {
    /// `wait` is how long a request may queue for a slot before `Busy`.
    pub fn new(capacity: usize, wait: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            wait,
        }
    }

    pub async fn admit(&self) -> PipelineResult<Permit> {
        let acquire = self.semaphore.clone().acquire_owned();
        match tokio::time::timeout(self.wait, acquire).await {
            Ok(Ok(permit)) => Ok(Permit(permit)),
            Ok(Err(_)) => Err(PipelineError::Busy),
            Err(_) => {
                log::warn!(
                    "admission: all {} slots busy after waiting {:?}",
                    self.capacity,
                    self.wait
                );
                Err(PipelineError::Busy)
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}
