// Staged orchestration from paired reads to the variable-site matrix.
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use futures::future::join_all;
use log::{debug, info, warn};

use crate::config::defs::{
    PipelineError, RunConfig, Toolchain, ASSEMBLY_LOG, BOWTIE2_BUILD_TAG, BOWTIE2_TAG, MATRIX_LOG,
    REFERENCE_LOG, SAMTOOLS_TAG, TARGET_COVERAGE, VELVETG_TAG, VELVETH_TAG, VERSION_ARGS,
};
use crate::utils::command::{
    bowtie2, check_version, collaborators, locate_executable, samtools, velvet, ToolCommand,
};
use crate::utils::fastx::interleave_pair;
use crate::utils::file::{file_path_manipulator, link_or_copy, partial_path, remove_if_exists};
use crate::utils::pileup::derive_private_contigs;
use crate::utils::pool::run_bounded;
use crate::utils::runlog::RunLog;
use crate::utils::streams::{run_chain, run_command};
use crate::utils::subsample::{subsample_taxon, target_reads_per_taxon};
use crate::utils::system::{derive_seed, generate_rng};
use crate::utils::taxa::{ReadLibrary, Taxon};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Assembly,
    Alignment,
    Pileup,
    SiteCalling,
    Matrix,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Assembly,
        Stage::Alignment,
        Stage::Pileup,
        Stage::SiteCalling,
        Stage::Matrix,
    ];

    pub fn index(self) -> u8 {
        match self {
            Stage::Assembly => 0,
            Stage::Alignment => 1,
            Stage::Pileup => 2,
            Stage::SiteCalling => 3,
            Stage::Matrix => 4,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::Assembly => "composite assembly",
            Stage::Alignment => "per-taxon alignment",
            Stage::Pileup => "pileup and reference mapping",
            Stage::SiteCalling => "site calling",
            Stage::Matrix => "matrix building",
        }
    }

    /// A stage runs unless the skip level is past it. The matrix always runs.
    pub fn is_enabled(self, skip_level: u8) -> bool {
        self == Stage::Matrix || skip_level <= self.index()
    }

    /// External programs the stage spawns under this configuration.
    pub fn required_tools(self, config: &RunConfig) -> Vec<String> {
        let mut tools: Vec<&str> = match self {
            Stage::Assembly => vec![VELVETH_TAG, VELVETG_TAG, BOWTIE2_BUILD_TAG, SAMTOOLS_TAG],
            Stage::Alignment => vec![BOWTIE2_TAG, SAMTOOLS_TAG],
            Stage::Pileup => vec![SAMTOOLS_TAG],
            Stage::SiteCalling => vec![config.toolchain.site_caller.as_str()],
            Stage::Matrix => vec![config.toolchain.matrix_builder.as_str()],
        };
        if self == Stage::Alignment && config.refine_repeats {
            tools.push(BOWTIE2_BUILD_TAG);
        }
        if self == Stage::Pileup && config.reference.is_some() {
            tools.push(BOWTIE2_TAG);
            tools.push(BOWTIE2_BUILD_TAG);
        }
        tools.into_iter().map(String::from).collect()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {} ({})", self.index(), self.label())
    }
}

pub fn planned_stages(skip_level: u8) -> Vec<Stage> {
    Stage::ALL.into_iter().filter(|s| s.is_enabled(skip_level)).collect()
}

/// Union of the tools the given stages need, in first-use order.
pub fn required_tools(config: &RunConfig, stages: &[Stage]) -> Vec<String> {
    let mut tools: Vec<String> = Vec::new();
    for stage in stages {
        for tool in stage.required_tools(config) {
            if !tools.contains(&tool) {
                tools.push(tool);
            }
        }
    }
    tools
}

pub async fn run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    let run_log = RunLog::open(&config.run_log);
    record_configuration(&config, &run_log);

    let stages = planned_stages(config.skip_level);
    if config.skip_level > 0 {
        info!("Skip level {}: resuming at {}", config.skip_level, stages[0]);
    }
    preflight(&config, &stages, &run_log).await?;

    for stage in stages {
        run_log.record(&format!("Starting {}", stage));
        info!("Starting {}", stage);
        let stage_start = Instant::now();

        let result = match stage {
            Stage::Assembly => composite_assembly(&config).await,
            Stage::Alignment => alignment(&config).await,
            Stage::Pileup => pileup(&config).await,
            Stage::SiteCalling => site_calling(&config).await,
            Stage::Matrix => matrix(&config).await,
        };
        if let Err(e) = result {
            run_log.record(&format!("Failed {}: {}", stage, e));
            return Err(e);
        }

        info!("Finished {} in {} seconds", stage, stage_start.elapsed().as_secs());
    }

    run_log.record("Run complete");
    Ok(())
}

fn record_configuration(config: &RunConfig, run_log: &RunLog) {
    let names: Vec<&str> = config.taxa.taxa().iter().map(|t| t.name.as_str()).collect();
    run_log.record("Run started");
    run_log.record(&format!("Input directory: {}", config.root.display()));
    run_log.record(&format!("Taxa ({}): {}", names.len(), names.join(", ")));
    run_log.record(&format!(
        "k-mer {}, processors {}, format {}, dispatch {:?}",
        config.kmer,
        config.processors,
        config.format.tag(),
        config.dispatch
    ));
    run_log.record(&format!(
        "Missing allowance {}, minimum reads {}, threshold {}",
        config.missing, config.min_reads, config.threshold
    ));
    run_log.record(&format!(
        "Genome size {}, reference {}, skip level {}, repeat refinement {}",
        config.genome_size.map_or("unset".to_string(), |g| g.to_string()),
        config
            .reference
            .as_ref()
            .map_or("none".to_string(), |r| r.display().to_string()),
        config.skip_level,
        if config.refine_repeats { "on" } else { "off" }
    ));
    if let Some(seed) = config.seed {
        run_log.record(&format!("Seed {}", seed));
    }
}

/// Locates every tool the planned stages need before anything runs, and
/// records the versions that can be probed.
async fn preflight(config: &RunConfig, stages: &[Stage], run_log: &RunLog) -> Result<(), PipelineError> {
    let mut located: Vec<(String, PathBuf)> = Vec::new();
    for tool in required_tools(config, stages) {
        let program = config.toolchain.program(&tool);
        let path = locate_executable(&program).ok_or_else(|| PipelineError::MissingTool {
            tool: tool.clone(),
            location: if program.components().count() > 1 {
                format!("looked for {}", program.display())
            } else {
                "searched PATH".to_string()
            },
        })?;
        debug!("Found {} at {}", tool, path.display());
        located.push((tool, path));
    }

    let probes = join_all(located.iter().map(|(tool, path)| async move {
        if VERSION_ARGS.contains_key(tool.as_str()) {
            Some(check_version(tool, path).await)
        } else {
            None
        }
    }))
    .await;

    for ((tool, path), probe) in located.iter().zip(probes) {
        match probe {
            None => run_log.record(&format!("Tool {}: {}", tool, path.display())),
            Some(Ok(version)) => {
                info!("{}: {}", tool, version);
                run_log.record(&format!("Tool {}: {} ({})", tool, version, path.display()));
            }
            Some(Err(e)) => {
                warn!("Could not determine the {} version: {}", tool, e);
                run_log.record(&format!("Tool {}: version unknown ({})", tool, path.display()));
            }
        }
    }
    Ok(())
}

async fn composite_assembly(config: &Arc<RunConfig>) -> Result<(), PipelineError> {
    let read_streams = match config.genome_size {
        Some(genome_size) => subsample_reads(config, genome_size).await?,
        None => shuffle_reads(config).await?,
    };

    let asm_dir = config.assembly_dir();
    fs::create_dir_all(&asm_dir).map_err(|e| io_error(&asm_dir, e))?;
    let log = asm_dir.join(ASSEMBLY_LOG);

    run_tool(&velvet::velveth(config, &read_streams), Some(&log), Some(&log)).await?;
    run_tool(&velvet::velvetg(config), Some(&log), Some(&log)).await?;

    let contigs = config.composite_contigs();
    require_artifact("composite contigs", &contigs)?;
    run_tool(
        &bowtie2::build(config, &contigs, &config.composite_index()),
        Some(&log),
        Some(&log),
    )
    .await?;
    run_tool(
        &samtools::command(&config.toolchain, &samtools::faidx(&contigs)),
        None,
        Some(&log),
    )
    .await
}

async fn subsample_reads(config: &Arc<RunConfig>, genome_size: u64) -> Result<Vec<PathBuf>, PipelineError> {
    let target = target_reads_per_taxon(genome_size, config.taxa.taxa().len());
    info!(
        "Subsampling {} read pairs per taxon for ~{}x coverage of {} bp",
        target, TARGET_COVERAGE, genome_size
    );
    if target == 0 {
        warn!("Genome size {} is too small to keep any reads per taxon", genome_size);
    }

    let items: Vec<(usize, Taxon)> = config.taxa.taxa().iter().cloned().enumerate().collect();
    dispatch(config, "subsampling", items, move |config: Arc<RunConfig>, (i, taxon): (usize, Taxon)| async move {
        let out = taxon.subsampled(config.format);
        let format = config.format;
        let seed = derive_seed(config.seed, i);
        let name = taxon.name.clone();
        let written = tokio::task::spawn_blocking(move || {
            let mut rng = generate_rng(seed);
            subsample_taxon(&taxon, target, &out, format, &mut rng)
        })
        .await
        .map_err(|e| anyhow!("Subsampling task for {} failed: {}", name, e))??;
        debug!("{}: wrote {} subsampled pairs", name, written);
        Ok(())
    })
    .await?;

    Ok(config.taxa.taxa().iter().map(|t| t.subsampled(config.format)).collect())
}

async fn shuffle_reads(config: &Arc<RunConfig>) -> Result<Vec<PathBuf>, PipelineError> {
    let libraries: Vec<ReadLibrary> = config.taxa.libraries().cloned().collect();
    dispatch(config, "shuffling", libraries, |config: Arc<RunConfig>, library: ReadLibrary| async move {
        let format = config.format;
        let shuffled = library.shuffled.clone();
        let pairs = tokio::task::spawn_blocking(move || {
            interleave_pair(&library.r1, &library.r2, &library.shuffled, format)
        })
        .await
        .map_err(|e| anyhow!("Shuffling task for {} failed: {}", shuffled.display(), e))??;
        debug!("{}: {} pairs", shuffled.display(), pairs);
        Ok(())
    })
    .await?;

    Ok(config.taxa.libraries().map(|l| l.shuffled.clone()).collect())
}

async fn alignment(config: &Arc<RunConfig>) -> Result<(), PipelineError> {
    require_artifact("composite contigs", &config.composite_contigs())?;
    require_bowtie2_index("composite contig index", &config.composite_index())?;

    let libraries: Vec<ReadLibrary> = config.taxa.libraries().cloned().collect();
    let aligned = dispatch(config, "alignment", libraries, |config: Arc<RunConfig>, library: ReadLibrary| async move {
        align_library(&config, &library, &config.composite_index()).await
    })
    .await?;
    info!("Aligned {} read libraries to the composite contigs", aligned);

    if config.refine_repeats {
        let taxa: Vec<Taxon> = config.taxa.taxa().to_vec();
        dispatch(config, "repeat refinement", taxa, |config: Arc<RunConfig>, taxon: Taxon| async move {
            refine_taxon(&config, &taxon).await
        })
        .await?;
    }
    Ok(())
}

/// `bowtie2 | samtools view | samtools sort` into the library's `.bam`.
async fn align_library(config: &RunConfig, library: &ReadLibrary, index: &Path) -> Result<()> {
    let bam = library.alignment();
    let partial = partial_path(&bam);
    let chain = [
        bowtie2::align_pair(config, index, &library.r1, &library.r2),
        samtools::command(&config.toolchain, &samtools::view_mapped()),
        samtools::command(&config.toolchain, &samtools::sort_to(&partial)),
    ];
    let result = run_chain(&chain, Some(&library.stdout_log()), Some(&library.stderr_log())).await;
    settle_partial(result, &partial, &bam).map_err(|e| anyhow!("Aligning {}: {}", library.base.display(), e))
}

/// Rebuilds a taxon's contigs from its own reads and realigns its libraries
/// to them, so repeats collapsed in the composite map to the taxon's copy.
async fn refine_taxon(config: &RunConfig, taxon: &Taxon) -> Result<()> {
    let log = taxon.refinement_log();
    let merged = taxon.merged_alignment();
    merge_alignment_records(&config.toolchain, &taxon.alignments(), &merged, &log).await?;

    let pileup = taxon.merged_pileup();
    let composite = config.composite_contigs();
    let mpileup = samtools::command(&config.toolchain, &samtools::mpileup(&composite, &merged));
    run_command(&mpileup, Some(&pileup), Some(&log)).await?;

    let private = taxon.private_contigs();
    let (c, p, o) = (composite.clone(), pileup.clone(), private.clone());
    let changed = tokio::task::spawn_blocking(move || derive_private_contigs(&c, &p, &o))
        .await
        .map_err(|e| anyhow!("Private contig task for {} failed: {}", taxon.name, e))??;
    info!("{}: private contigs differ from the composite at {} positions", taxon.name, changed);

    let index = taxon.private_index();
    run_command(&bowtie2::build(config, &private, &index), Some(&log), Some(&log)).await?;
    for library in &taxon.libraries {
        align_library(config, library, &index).await?;
    }

    remove_if_exists(&merged)?;
    remove_if_exists(&pileup)?;
    Ok(())
}

/// Merges a taxon's alignment records into `out`. A single record set is
/// linked (or copied) instead of merged.
pub async fn merge_alignment_records(
    toolchain: &Toolchain,
    inputs: &[PathBuf],
    out: &Path,
    log: &Path,
) -> Result<()> {
    match inputs {
        [] => Err(anyhow!("No alignment records to merge into {}", out.display())),
        [single] => {
            link_or_copy(single, out)?;
            Ok(())
        }
        _ => {
            let merge = samtools::command(toolchain, &samtools::merge(out, inputs));
            run_command(&merge, None, Some(log)).await
        }
    }
}

async fn pileup(config: &Arc<RunConfig>) -> Result<(), PipelineError> {
    let mut items: Vec<(ReadLibrary, PathBuf)> = Vec::new();
    for taxon in config.taxa.taxa() {
        let contigs = if config.refine_repeats {
            require_artifact("private contigs", &taxon.private_contigs())?;
            taxon.private_contigs()
        } else {
            config.composite_contigs()
        };
        for library in &taxon.libraries {
            require_artifact("alignment records", &library.alignment())?;
            items.push((library.clone(), contigs.clone()));
        }
    }

    // Always re-index before the fan-out: refinement rewrites the private contigs.
    let distinct: BTreeSet<PathBuf> = items.iter().map(|(_, c)| c.clone()).collect();
    for contigs in &distinct {
        run_tool(&samtools::command(&config.toolchain, &samtools::faidx(contigs)), None, None).await?;
    }

    let piled = dispatch(config, "pileup", items, |config: Arc<RunConfig>, (library, contigs): (ReadLibrary, PathBuf)| async move {
        pileup_library(&config, &library, &contigs).await
    })
    .await?;
    info!("Generated {} pileups", piled);

    if let Some(reference) = &config.reference {
        map_contigs_to_reference(config, reference).await?;
    }
    Ok(())
}

async fn pileup_library(config: &RunConfig, library: &ReadLibrary, contigs: &Path) -> Result<()> {
    let bam = library.alignment();
    let stderr_log = library.stderr_log();
    run_command(&samtools::command(&config.toolchain, &samtools::index(&bam)), None, Some(&stderr_log)).await?;
    let mpileup = samtools::command(&config.toolchain, &samtools::mpileup(contigs, &bam));
    let pileup = library.pileup();
    let partial = partial_path(&pileup);
    let result = run_command(&mpileup, Some(&partial), Some(&stderr_log)).await;
    settle_partial(result, &partial, &pileup).map_err(|e| anyhow!("Pileup of {}: {}", bam.display(), e))
}

/// Places the composite contigs on the reference so the matrix can be
/// reported in reference coordinates.
async fn map_contigs_to_reference(config: &RunConfig, reference: &Path) -> Result<(), PipelineError> {
    require_artifact("composite contigs", &config.composite_contigs())?;
    let index = config.reference_index();
    if let Some(dir) = index.parent() {
        fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
    }
    let log = config.root.join(REFERENCE_LOG);
    run_tool(&bowtie2::build(config, reference, &index), Some(&log), Some(&log)).await?;

    let mapping = config.contig_mapping();
    let partial = partial_path(&mapping);
    let chain = [
        bowtie2::align_contigs(config, &index, &config.composite_contigs()),
        samtools::command(&config.toolchain, &samtools::view_mapped()),
        samtools::command(&config.toolchain, &samtools::sort_to(&partial)),
    ];
    let result = run_chain(&chain, Some(&log), Some(&log)).await;
    settle_partial(result, &partial, &mapping).map_err(|e| PipelineError::ToolExecution {
        tool: BOWTIE2_TAG.to_string(),
        error: format!("mapping contigs to {}: {:#}", reference.display(), e),
    })?;
    run_tool(&samtools::command(&config.toolchain, &samtools::index(&mapping)), Some(&log), Some(&log)).await
}

async fn site_calling(config: &Arc<RunConfig>) -> Result<(), PipelineError> {
    let taxa: Vec<Taxon> = config.taxa.taxa().to_vec();
    dispatch(config, "site calling", taxa, |config: Arc<RunConfig>, taxon: Taxon| async move {
        let log = taxon.site_calling_log();
        let command = collaborators::site_caller(&config, &taxon.dir);
        run_command(&command, Some(&log), Some(&log))
            .await
            .map_err(|e| anyhow!("Site calling for {}: {}", taxon.name, e))?;
        if !taxon.dictionary().exists() {
            warn!("{} finished without writing {}", command.tool, taxon.dictionary().display());
        }
        Ok(())
    })
    .await?;
    Ok(())
}

async fn matrix(config: &Arc<RunConfig>) -> Result<(), PipelineError> {
    let log = config.root.join(MATRIX_LOG);
    info!("Building the matrix with up to {} missing taxa per site", config.missing);
    run_tool(&collaborators::matrix_builder(config), Some(&log), Some(&log)).await
}

/// Fans a stage's work items out over the job pool and folds any failure into
/// a PipelineError once every item has finished.
async fn dispatch<T, F, Fut>(
    config: &Arc<RunConfig>,
    job: &str,
    items: Vec<T>,
    worker: F,
) -> Result<usize, PipelineError>
where
    T: Send + 'static,
    F: Fn(Arc<RunConfig>, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let shared = config.clone();
    run_bounded(items, config.processors, config.dispatch, move |item| worker(shared.clone(), item))
        .await
        .map_err(|e| PipelineError::ToolExecution {
            tool: job.to_string(),
            error: format!("{:#}", e),
        })
}

async fn run_tool(command: &ToolCommand, stdout: Option<&Path>, stderr: Option<&Path>) -> Result<(), PipelineError> {
    run_command(command, stdout, stderr)
        .await
        .map_err(|e| PipelineError::ToolExecution {
            tool: command.tool.clone(),
            error: format!("{:#}", e),
        })
}

/// Moves a finished output into place, or discards it when the step that
/// wrote it failed.
fn settle_partial(result: Result<()>, partial: &Path, out: &Path) -> Result<()> {
    match result {
        Ok(()) => fs::rename(partial, out)
            .map_err(|e| anyhow!("Renaming {} to {}: {}", partial.display(), out.display(), e)),
        Err(e) => {
            let _ = fs::remove_file(partial);
            Err(e)
        }
    }
}

fn require_artifact(what: &str, path: &Path) -> Result<(), PipelineError> {
    if path.exists() {
        Ok(())
    } else {
        Err(PipelineError::MissingArtifact {
            what: what.to_string(),
            path: path.to_path_buf(),
        })
    }
}

fn require_bowtie2_index(what: &str, prefix: &Path) -> Result<(), PipelineError> {
    let small = file_path_manipulator(prefix, None, None, Some("1.bt2"), ".");
    let large = file_path_manipulator(prefix, None, None, Some("1.bt2l"), ".");
    if large.exists() {
        return Ok(());
    }
    require_artifact(what, &small)
}

fn io_error(path: &Path, e: std::io::Error) -> PipelineError {
    PipelineError::IOError(format!("{}: {}", path.display(), e))
}
