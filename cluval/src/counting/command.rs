use std::path::PathBuf;
use std::process::Command;

use tracing::debug;

use crate::error::{Error, Result};
use crate::volume::io::write_volume;

use super::{Accelerator, AcceleratorOutput, CountJob, CountMode, Tally};

/// Accelerator backed by an external program.
///
/// The job is written as NIfTI files to a scratch directory and the program
/// is invoked as:
///
/// ```text
/// <program> <args..> <segmentation.nii.gz> --edges <lower>,<upper>
///     [--regions <regions.nii.gz> --weighting <voxels|intensity>]
///     [--intensity <intensity.nii.gz>]
/// ```
///
/// Stdout and stderr together form the log. A count is read from
/// `objects=<n>` and `region=<id>:<fraction>` lines of stdout.
#[derive(Debug, Clone)]
pub struct CommandAccelerator {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandAccelerator {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Accelerator for CommandAccelerator {
    fn name(&self) -> &str {
        "command"
    }

    fn count(&mut self, job: &CountJob) -> Result<AcceleratorOutput> {
        let scratch = tempfile::Builder::new()
            .prefix("cluval-job-")
            .tempdir()
            .map_err(|e| Error::io(std::env::temp_dir(), e))?;

        let segmentation = scratch.path().join("segmentation.nii.gz");
        write_volume(&segmentation, &job.segmentation)?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(&segmentation)
            .arg("--edges")
            .arg(format!("{},{}", job.policy.lower, job.policy.upper));

        if let CountMode::RegionFractions { weighting } = job.mode {
            if let Some(regions) = &job.regions {
                let path = scratch.path().join("regions.nii.gz");
                write_volume(&path, regions)?;
                command.arg("--regions").arg(path);
            }
            command.arg("--weighting").arg(weighting.to_string());
        }
        if let Some(intensity) = &job.intensity {
            let path = scratch.path().join("intensity.nii.gz");
            write_volume(&path, intensity)?;
            command.arg("--intensity").arg(path);
        }

        debug!(program = %self.program.display(), slices = job.slices(), "Running accelerator");
        let output = command.output().map_err(|e| {
            Error::AcceleratorUnavailable(format!("{}: {e}", self.program.display()))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut log = format!("{stdout}{stderr}");
        if !output.status.success() {
            log.push_str(&format!("\nexited with {}", output.status));
            return Ok(AcceleratorOutput::without_tally(log));
        }

        Ok(AcceleratorOutput {
            tally: parse_output(&stdout),
            log,
        })
    }
}

/// Reads a tally from program output. Returns `None` without an
/// `objects=` line. Unrecognized lines are ignored.
pub fn parse_output(stdout: &str) -> Option<Tally> {
    let mut objects = None;
    let mut tally = Tally::default();
    for line in stdout.lines().map(str::trim) {
        if let Some(n) = line.strip_prefix("objects=") {
            objects = Some(n.trim().parse::<u64>().ok()?);
        } else if let Some(rest) = line.strip_prefix("region=") {
            let (id, fraction) = rest.split_once(':')?;
            let id = id.trim().parse::<u32>().ok()?;
            let fraction = fraction.trim().parse::<f64>().ok()?;
            *tally.regions.entry(id).or_insert(0.0) += fraction;
        }
    }
    tally.objects = objects?;
    Some(tally)
}
