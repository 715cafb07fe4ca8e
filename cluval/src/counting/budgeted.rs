use tracing::debug;

use crate::error::Result;

use super::{tally_objects, Accelerator, AcceleratorOutput, CountJob};

/// In-process accelerator with a fixed voxel budget standing in for device
/// memory. Jobs above the budget exhaust it.
#[derive(Debug, Clone)]
pub struct BudgetedAccelerator {
    voxel_budget: usize,
}

impl BudgetedAccelerator {
    /// A budget of zero exhausts on every job.
    pub fn new(voxel_budget: usize) -> Self {
        Self { voxel_budget }
    }

    pub fn voxel_budget(&self) -> usize {
        self.voxel_budget
    }
}

impl Accelerator for BudgetedAccelerator {
    fn name(&self) -> &str {
        "budgeted"
    }

    fn count(&mut self, job: &CountJob) -> Result<AcceleratorOutput> {
        let voxels = job.segmentation.len();
        if self.voxel_budget == 0 || voxels > self.voxel_budget {
            debug!(voxels, budget = self.voxel_budget, "Job exceeds voxel budget");
            return Ok(AcceleratorOutput::without_tally(format!(
                "allocating {voxels} voxels with budget {}: out of memory",
                self.voxel_budget
            )));
        }

        let tally = tally_objects(job)?;
        let log = format!("counted {} objects in {voxels} voxels", tally.objects);
        Ok(AcceleratorOutput::counted(tally, log))
    }
}
