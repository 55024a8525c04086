//! Execution slot accounting across the local host and Active slaves.

use serde::Serialize;

/// Slots of one Active slave at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerCapacity {
    pub host: String,
    pub slots: usize,
    pub outstanding: usize,
}

impl WorkerCapacity {
    pub fn free(&self) -> usize {
        self.slots.saturating_sub(self.outstanding)
    }
}

/// Capacity of the pool, derived from registry state on demand.
///
/// Workers appear in declaration order; only Active slaves are included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapacitySnapshot {
    pub local: usize,
    pub workers: Vec<WorkerCapacity>,
}

impl CapacitySnapshot {
    /// Local parallelism plus the slots of every Active slave.
    pub fn total(&self) -> usize {
        self.local + self.remote()
    }

    pub fn remote(&self) -> usize {
        self.workers.iter().map(|w| w.slots).sum()
    }

    /// Remote slots not currently running a job.
    pub fn remote_free(&self) -> usize {
        self.workers.iter().map(WorkerCapacity::free).sum()
    }

    pub fn per_worker_free(&self) -> Vec<(String, usize)> {
        self.workers
            .iter()
            .map(|w| (w.host.clone(), w.free()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals() {
        let snapshot = CapacitySnapshot {
            local: 4,
            workers: vec![
                WorkerCapacity {
                    host: "a".to_string(),
                    slots: 4,
                    outstanding: 1,
                },
                WorkerCapacity {
                    host: "b".to_string(),
                    slots: 2,
                    outstanding: 2,
                },
            ],
        };
        assert_eq!(snapshot.total(), 10);
        assert_eq!(snapshot.remote(), 6);
        assert_eq!(snapshot.remote_free(), 3);
        assert_eq!(
            snapshot.per_worker_free(),
            vec![("a".to_string(), 3), ("b".to_string(), 0)]
        );
    }
}
