use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::volume::{label_components, Connectivity, ValueMode, Volume};

use super::objects::{object_shares, region_inputs, share_fractions};
use super::{
    AcceleratorHandle, CountJob, CountMode, CountResult, CountStats, Counter, EdgePolicy,
    ExhaustionDetector, Outcome, Provenance, RegionWeighting, SubdivisionParams, Tally,
};

/// Co-cropped volumes of one (subject, cluster) unit.
#[derive(Debug, Clone, Copy)]
pub struct CountInput<'a> {
    pub cluster_mask: &'a Volume<u8>,
    pub segmentation: &'a Volume<u32>,
    pub regions: Option<&'a Volume<u32>>,
    pub intensity: Option<&'a Volume<f32>>,
}

impl CountInput<'_> {
    fn validate(&self, mode: CountMode) -> Result<()> {
        let dims = self.cluster_mask.dims();
        self.segmentation.check_shape(dims)?;
        if let Some(regions) = self.regions {
            regions.check_shape(dims)?;
        }
        if let Some(intensity) = self.intensity {
            intensity.check_shape(dims)?;
        }
        if let CountMode::RegionFractions { weighting } = mode {
            if self.regions.is_none() {
                return Err(Error::Config("region fraction counting needs a region map".into()));
            }
            if weighting == RegionWeighting::Intensity && self.intensity.is_none() {
                return Err(Error::Config("intensity weighting needs an intensity volume".into()));
            }
        }
        Ok(())
    }
}

/// Counts objects with the accelerator when it copes and degrades to slabs
/// and then to the unaccelerated counter when it does not.
pub struct AdaptiveObjectCounter {
    accelerator: Option<AcceleratorHandle>,
    fallback: Box<dyn Counter>,
    detector: ExhaustionDetector,
    params: SubdivisionParams,
    connectivity: Connectivity,
    mode: CountMode,
}

/// Slices a partition is cut from: `[z0, z1)` plus the overlap slice when
/// another partition lies above it.
#[derive(Debug, Clone, Copy)]
struct SlabView {
    z0: usize,
    end: usize,
    policy: EdgePolicy,
}

impl SlabView {
    fn new(z0: usize, z1: usize, total: usize) -> Self {
        if z1 == total {
            Self {
                z0,
                end: z1,
                policy: EdgePolicy::inclusive(),
            }
        } else {
            Self {
                z0,
                end: z1 + 1,
                policy: EdgePolicy::below_cut(),
            }
        }
    }
}

/// Accumulated state of one unit's count.
#[derive(Debug, Default)]
struct Run {
    tally: Tally,
    deepest: Option<Provenance>,
    stats: CountStats,
    failure: Option<String>,
    /// Counted partitions whose lower face is a cut.
    above_cuts: Vec<SlabView>,
}

impl Run {
    fn reached(&mut self, provenance: Provenance) {
        self.deepest = Some(self.deepest.map_or(provenance, |p| p.max(provenance)));
    }

    fn counted(&mut self, view: SlabView) {
        if view.z0 > 0 {
            self.above_cuts.push(view);
        }
    }
}

impl AdaptiveObjectCounter {
    /// Without an accelerator every unit goes straight to `fallback`.
    pub fn new(accelerator: Option<AcceleratorHandle>, fallback: Box<dyn Counter>) -> Self {
        Self {
            accelerator,
            fallback,
            detector: ExhaustionDetector::default(),
            params: SubdivisionParams::default(),
            connectivity: Connectivity::default(),
            mode: CountMode::default(),
        }
    }

    pub fn with_params(mut self, params: SubdivisionParams) -> Result<Self> {
        params.validate()?;
        self.params = params;
        Ok(self)
    }

    pub fn with_detector(mut self, detector: ExhaustionDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_mode(mut self, mode: CountMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn params(&self) -> &SubdivisionParams {
        &self.params
    }

    pub fn mode(&self) -> CountMode {
        self.mode
    }

    pub fn count(&self, input: &CountInput) -> Result<CountResult> {
        input.validate(self.mode)?;

        if input.segmentation.mask(input.cluster_mask)?.max() == 0 {
            debug!("No objects under the cluster mask");
            return Ok(CountResult {
                tally: Tally::default(),
                provenance: Provenance::EmptyInput,
                stats: CountStats::default(),
                failure: None,
            });
        }

        let depth = input.segmentation.depth();
        let mut run = Run::default();
        let job = self.job(input, 0, depth, EdgePolicy::inclusive())?;

        let Some(accelerator) = &self.accelerator else {
            self.fall_back(&job, 0, &mut run)?;
            return Ok(self.finish(run));
        };

        match self.accelerate(accelerator, &job, &mut run) {
            Outcome::Counted(tally) => {
                run.tally = tally;
                run.stats.leaves = 1;
                run.reached(Provenance::FullVolumeAccelerated);
                return Ok(self.finish(run));
            }
            Outcome::Exhausted => {
                warn!(
                    slices = depth,
                    chunk_slices = self.params.chunk_slices,
                    "Accelerator exhausted on whole crop, subdividing"
                );
            }
            Outcome::Failed(reason) => {
                warn!(reason = %reason, "Accelerator failed on whole crop");
                self.fall_back(&job, 0, &mut run)?;
                return Ok(self.finish(run));
            }
        }

        if depth <= self.params.chunk_slices {
            // The only chunk is the crop that just exhausted.
            run.stats.max_depth_reached = 1;
            self.subdivide(accelerator, input, job, 0, depth, 1, &mut run)?;
        } else {
            drop(job);
            let mut z0 = 0;
            while z0 < depth && run.failure.is_none() {
                let z1 = (z0 + self.params.chunk_slices).min(depth);
                self.count_slab(accelerator, input, z0, z1, 1, &mut run)?;
                z0 = z1;
            }
        }

        self.restore_cut_fractions(input, &mut run)?;
        Ok(self.finish(run))
    }

    /// Counts the partition `[z0, z1)`, bisecting on exhaustion.
    fn count_slab(
        &self,
        accelerator: &AcceleratorHandle,
        input: &CountInput,
        z0: usize,
        z1: usize,
        depth: usize,
        run: &mut Run,
    ) -> Result<()> {
        if run.failure.is_some() {
            return Ok(());
        }
        run.stats.max_depth_reached = run.stats.max_depth_reached.max(depth);

        let view = SlabView::new(z0, z1, input.segmentation.depth());
        let job = self.job(input, view.z0, view.end, view.policy)?;
        if job.segmentation.max() == 0 {
            debug!(z0, z1, depth, "Skipping empty slab");
            return Ok(());
        }

        match self.accelerate(accelerator, &job, run) {
            Outcome::Counted(tally) => {
                run.tally.merge(&tally);
                run.stats.leaves += 1;
                run.reached(Provenance::SubdividedAccelerated);
                run.counted(view);
                Ok(())
            }
            Outcome::Exhausted => self.subdivide(accelerator, input, job, z0, z1, depth, run),
            Outcome::Failed(reason) => {
                warn!(z0, z1, depth, reason = %reason, "Accelerator failed on slab");
                self.fall_back_slab(&job, view, depth, run)
            }
        }
    }

    /// Bisects the exhausted partition `[z0, z1)` whose job is `job`, or
    /// counts it unaccelerated once it is at the subdivision limit.
    #[allow(clippy::too_many_arguments)]
    fn subdivide(
        &self,
        accelerator: &AcceleratorHandle,
        input: &CountInput,
        job: CountJob,
        z0: usize,
        z1: usize,
        depth: usize,
        run: &mut Run,
    ) -> Result<()> {
        let slices = z1 - z0;
        if depth < self.params.max_depth && slices >= 2 * self.params.min_slab_slices {
            let mid = z0 + slices / 2;
            warn!(z0, z1, depth, slices, "Accelerator exhausted on slab, bisecting");
            drop(job);
            self.count_slab(accelerator, input, z0, mid, depth + 1, run)?;
            self.count_slab(accelerator, input, mid, z1, depth + 1, run)
        } else {
            warn!(z0, z1, depth, slices, "Accelerator exhausted at subdivision limit");
            let view = SlabView::new(z0, z1, input.segmentation.depth());
            self.fall_back_slab(&job, view, depth, run)
        }
    }

    fn fall_back_slab(&self, job: &CountJob, view: SlabView, depth: usize, run: &mut Run) -> Result<()> {
        self.fall_back(job, depth, run)?;
        if run.failure.is_none() {
            run.counted(view);
        }
        Ok(())
    }

    /// A partition above a cut sees only the part of an object above it, so
    /// region fractions of objects counted across a cut are replaced by the
    /// fractions of the whole object in the crop.
    fn restore_cut_fractions(&self, input: &CountInput, run: &mut Run) -> Result<()> {
        let CountMode::RegionFractions { weighting } = self.mode else {
            return Ok(());
        };
        if run.above_cuts.is_empty() || run.failure.is_some() {
            return Ok(());
        }

        let whole = self.job(input, 0, input.segmentation.depth(), EdgePolicy::inclusive())?;
        let objects = label_components(&whole.segmentation, self.connectivity, ValueMode::MatchValues);
        let (regions, intensity) = region_inputs(&whole, weighting)?;
        let whole_shares = object_shares(
            objects.labels(),
            &vec![true; objects.num_labels() + 1],
            regions,
            intensity,
        );
        let slice_len = whole.segmentation.slice_len();

        let mut restored = 0;
        for view in &run.above_cuts {
            let slab = self.job(input, view.z0, view.end, view.policy)?;
            let pieces = label_components(&slab.segmentation, self.connectivity, ValueMode::MatchValues);
            let last_slice = slab.slices() - 1;

            // Piece label -> whole-object label, for pieces that continue
            // below the cut.
            let mut whole_label = vec![0u32; pieces.num_labels() + 1];
            for piece in pieces.components() {
                if piece.bbox.min()[2] != 0 || !view.policy.keeps(&piece.bbox, last_slice) {
                    continue;
                }
                let label = objects.labels().voxels()[piece.first_voxel + view.z0 * slice_len];
                if label != 0 && objects.components()[label as usize - 1].bbox.min()[2] < view.z0 {
                    whole_label[piece.label as usize] = label;
                }
            }
            let straddling: Vec<bool> = whole_label.iter().map(|&l| l != 0).collect();
            if !straddling.contains(&true) {
                continue;
            }

            let (slab_regions, slab_intensity) = region_inputs(&slab, weighting)?;
            let partial = object_shares(pieces.labels(), &straddling, slab_regions, slab_intensity);
            for (piece, &label) in whole_label.iter().enumerate().filter(|(_, l)| **l != 0) {
                for (region, fraction) in share_fractions(&partial[piece]) {
                    *run.tally.regions.entry(region).or_insert(0.0) -= fraction;
                }
                for (region, fraction) in share_fractions(&whole_shares[label as usize]) {
                    *run.tally.regions.entry(region).or_insert(0.0) += fraction;
                }
                restored += 1;
            }
        }

        if restored > 0 {
            debug!(objects = restored, "Restored whole-object region fractions across cuts");
        }
        Ok(())
    }

    fn accelerate(&self, accelerator: &AcceleratorHandle, job: &CountJob, run: &mut Run) -> Outcome {
        run.stats.accelerator_calls += 1;
        self.detector.classify(accelerator.count(job.clone()))
    }

    fn fall_back(&self, job: &CountJob, depth: usize, run: &mut Run) -> Result<()> {
        if !self.params.allow_fallback {
            run.failure = Some(format!(
                "accelerator could not count {} slices at depth {depth} and fallback is disabled",
                job.slices()
            ));
            return Ok(());
        }
        let tally = self.fallback.count(job)?;
        run.tally.merge(&tally);
        run.stats.leaves += 1;
        run.stats.fallback_leaves += 1;
        run.reached(Provenance::UnacceleratedFallback);
        Ok(())
    }

    fn finish(&self, run: Run) -> CountResult {
        let provenance = if run.failure.is_some() {
            Provenance::Failed
        } else {
            // Every slab was empty after masking.
            run.deepest.unwrap_or(Provenance::SubdividedAccelerated)
        };
        CountResult {
            tally: run.tally,
            provenance,
            stats: run.stats,
            failure: run.failure,
        }
    }

    /// Cuts slices `[z0, z1)` of every input afresh and masks the
    /// segmentation to the cluster.
    fn job(&self, input: &CountInput, z0: usize, z1: usize, policy: EdgePolicy) -> Result<CountJob> {
        let whole = z0 == 0 && z1 == input.segmentation.depth();
        let cut = |v: &Volume<u32>| if whole { v.clone() } else { v.slab(z0, z1) };
        let mask = if whole {
            input.cluster_mask.clone()
        } else {
            input.cluster_mask.slab(z0, z1)
        };
        let segmentation = cut(input.segmentation).mask(&mask)?;
        let regions = input.regions.map(cut);
        let intensity = input.intensity.map(|v| if whole { v.clone() } else { v.slab(z0, z1) });

        Ok(CountJob {
            segmentation,
            regions,
            intensity,
            policy,
            mode: self.mode,
            connectivity: self.connectivity,
        })
    }
}
