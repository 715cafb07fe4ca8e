use crate::error::Result;

use super::{tally_objects, CountJob, Tally};

/// Unaccelerated counting routine. Slow but never exhausts.
pub trait Counter: Send + Sync {
    fn count(&self, job: &CountJob) -> Result<Tally>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuCounter;

impl Counter for CpuCounter {
    fn count(&self, job: &CountJob) -> Result<Tally> {
        tally_objects(job)
    }
}
