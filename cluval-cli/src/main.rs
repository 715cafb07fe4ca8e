use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use cluval::{
    discover_subjects, AcceleratorKind, BatchSummary, ClusterIndex, ClusterSelection, Pipeline,
    PipelineConfig, Significance, SubjectOutcome,
};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "cluval-cli")]
#[command(version, about = "Validate statistic clusters by counting objects in native space", long_about = None)]
struct Cli {
    /// Configuration file (otherwise $CLUVAL_CONFIG, ./cluval.yml, ./config/cluval.yml)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Settings that replace their configuration file counterparts.
#[derive(Args)]
struct Overrides {
    /// Statistic threshold for significant voxels
    #[arg(long, global = true, value_name = "FLOAT", conflicts_with = "fdr")]
    threshold: Option<f32>,

    /// False discovery rate target instead of a fixed threshold
    #[arg(long, global = true, value_name = "Q")]
    fdr: Option<f64>,

    /// Smallest cluster kept, in voxels
    #[arg(long, global = true, value_name = "VOXELS")]
    min_size: Option<usize>,

    /// Counting accelerator (budgeted, command or none)
    #[arg(long, global = true, value_name = "KIND")]
    accelerator: Option<AcceleratorKind>,

    /// Directory for per-subject artifacts
    #[arg(long, global = true, value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Directory for the cluster index and tables
    #[arg(short, long, global = true, value_name = "DIR")]
    out: Option<PathBuf>,
}

impl Overrides {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(threshold) = self.threshold {
            config.cluster.significance = Significance::Statistic(threshold);
        }
        if let Some(q) = self.fdr {
            config.cluster.significance = Significance::Fdr(q);
        }
        if let Some(min_size) = self.min_size {
            config.cluster.min_cluster_size = min_size;
        }
        if let Some(kind) = self.accelerator {
            config.accelerator.kind = kind;
        }
        if let Some(dir) = &self.work_dir {
            config.output.work_dir = dir.clone();
        }
        if let Some(dir) = &self.out {
            config.output.output_dir = dir.clone();
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build the reference-space cluster index from a statistic map
    Index {
        /// Statistic map (NIfTI)
        #[arg(value_name = "STATISTIC")]
        statistic: PathBuf,

        /// Brain mask restricting significant voxels
        #[arg(long, value_name = "FILE")]
        mask: Option<PathBuf>,
    },

    /// Count objects per cluster for subjects and write the tables
    Run {
        /// Subject or experiment directories
        #[arg(value_name = "SUBJECTS", required = true)]
        subjects: Vec<PathBuf>,

        /// Clusters to process: all, 3-7, 1,4,9 or 1-3,8
        #[arg(long, value_name = "SELECTION", default_value = "all")]
        clusters: ClusterSelection,

        /// Build the index from this statistic map instead of loading it
        #[arg(long, value_name = "FILE")]
        statistic: Option<PathBuf>,

        /// Brain mask used with --statistic
        #[arg(long, value_name = "FILE", requires = "statistic")]
        mask: Option<PathBuf>,
    },

    /// Regenerate the tables from existing artifacts
    Tables {
        /// Subject or experiment directories
        #[arg(value_name = "SUBJECTS", required = true)]
        subjects: Vec<PathBuf>,

        /// Clusters to include
        #[arg(long, value_name = "SELECTION", default_value = "all")]
        clusters: ClusterSelection,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let (mut config, notes) = match PipelineConfig::resolve(cli.config.as_deref()) {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(2);
        }
    };
    cli.overrides.apply(&mut config);

    let log_dir = config.output.work_dir.join("logs");
    if let Err(e) = common::log_setup::setup_logging(&cli.log_level, &log_dir, "cluval") {
        eprintln!("Error: {e}");
        return ExitCode::from(2);
    }
    for note in &notes {
        info!("{note}");
    }

    match run(cli.command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            let config_error = e
                .downcast_ref::<cluval::Error>()
                .is_some_and(cluval::Error::is_config);
            ExitCode::from(if config_error { 2 } else { 1 })
        }
    }
}

fn run(command: Commands, config: PipelineConfig) -> anyhow::Result<()> {
    let pipeline = Pipeline::new(config)?;

    match command {
        Commands::Index { statistic, mask } => {
            if let Some(index) = build_index(&pipeline, &statistic, mask.as_deref())? {
                println!(
                    "{} clusters written to {}",
                    index.num_clusters(),
                    pipeline.index_path().display()
                );
            }
        }
        Commands::Run {
            subjects,
            clusters,
            statistic,
            mask,
        } => {
            let index = match statistic {
                Some(statistic) => match build_index(&pipeline, &statistic, mask.as_deref())? {
                    Some(index) => index,
                    None => return Ok(()),
                },
                None => load_index(&pipeline.index_path())?,
            };
            let subjects = discover_subjects(&subjects)?;
            let summary = pipeline.run(&index, &subjects, &clusters)?;
            print_summary(&summary);
        }
        Commands::Tables { subjects, clusters } => {
            let index = load_index(&pipeline.index_path())?;
            let subjects = discover_subjects(&subjects)?;
            let written =
                pipeline.write_tables(&index, &subjects, &clusters.resolve(index.num_clusters()))?;
            for path in written {
                println!("{}", path.display());
            }
        }
    }
    Ok(())
}

/// `None` when no cluster survives; that is reported, not an error.
fn build_index(
    pipeline: &Pipeline,
    statistic: &Path,
    mask: Option<&Path>,
) -> anyhow::Result<Option<ClusterIndex>> {
    match pipeline.build_index(statistic, mask) {
        Ok(index) => Ok(Some(index)),
        Err(cluval::Error::InsufficientSignal { reason }) => {
            warn!(statistic = %statistic.display(), reason = %reason, "No significant clusters");
            println!("No significant clusters in {}: {reason}", statistic.display());
            Ok(None)
        }
        Err(e) => Err(e)
            .with_context(|| format!("Failed to build cluster index from {}", statistic.display())),
    }
}

fn load_index(path: &Path) -> anyhow::Result<ClusterIndex> {
    ClusterIndex::load(path).with_context(|| {
        format!(
            "Failed to load cluster index {} (run the index command or pass --statistic)",
            path.display()
        )
    })
}

fn print_summary(summary: &BatchSummary) {
    for (subject, outcome) in &summary.outcomes {
        match outcome {
            SubjectOutcome::Processed {
                counted,
                reused,
                failed,
            } => println!("{subject}: {counted} counted, {reused} reused, {failed} failed"),
            SubjectOutcome::Skipped { reason } => println!("{subject}: skipped ({reason})"),
            SubjectOutcome::Failed { reason } => println!("{subject}: failed ({reason})"),
        }
    }
    if summary.failed() > 0 || summary.skipped() > 0 {
        warn!(
            skipped = summary.skipped(),
            failed = summary.failed(),
            "Some subjects were not fully processed"
        );
    }
    println!(
        "{} processed, {} skipped, {} failed over {} clusters",
        summary.processed(),
        summary.skipped(),
        summary.failed(),
        summary.clusters.len()
    );
    for path in &summary.tables {
        println!("{}", path.display());
    }
}
