use std::collections::HashMap;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use thiserror::Error;

use crate::cli::{Arguments, DispatchMode, ReadFormat};
use crate::utils::taxa::TaxonRegistry;

// External software
pub const VELVETH_TAG: &str = "velveth";
pub const VELVETG_TAG: &str = "velvetg";
pub const BOWTIE2_TAG: &str = "bowtie2";
pub const BOWTIE2_BUILD_TAG: &str = "bowtie2-build";
pub const SAMTOOLS_TAG: &str = "samtools";

lazy_static! {
    /// Arguments that make a tool print its version on the first line of stdout.
    /// Tools without an entry are only located, never probed.
    pub static ref VERSION_ARGS: HashMap<&'static str, &'static [&'static str]> = {
        let mut m: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
        m.insert(SAMTOOLS_TAG, &["--version"]);
        m.insert(BOWTIE2_TAG, &["--version"]);
        m.insert(BOWTIE2_BUILD_TAG, &["--version"]);
        m
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamtoolsSubcommand {
    View,
    Sort,
    Index,
    Merge,
    Mpileup,
    Faidx,
}

impl SamtoolsSubcommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamtoolsSubcommand::Faidx => "faidx",
            SamtoolsSubcommand::View => "view",
            SamtoolsSubcommand::Sort => "sort",
            SamtoolsSubcommand::Index => "index",
            SamtoolsSubcommand::Merge => "merge",
            SamtoolsSubcommand::Mpileup => "mpileup",
        }
    }
}

// Static Filenames
pub const ASSEMBLY_DIR: &str = "composite_assembly";
pub const CONTIGS_FASTA: &str = "contigs.fa";
pub const CONTIGS_INDEX: &str = "contigs";
pub const REFERENCE_INDEX_DIR: &str = "reference_index";
pub const REFERENCE_INDEX: &str = "reference";
pub const CONTIG_MAPPING: &str = "contigs_to_reference.bam";
pub const MERGED_ALIGNMENT: &str = "merged.bam";
pub const MERGED_PILEUP: &str = "merged.pileups";
pub const SITE_DICTIONARY: &str = "site_dictionary";
pub const RUN_LOG: &str = "pipeline_run.log";
pub const ASSEMBLY_LOG: &str = "assembly.log";
pub const REFERENCE_LOG: &str = "reference_mapping.log";
pub const REFINEMENT_LOG: &str = "refinement.log";
pub const SITE_CALLING_LOG: &str = "site_calling.log";
pub const MATRIX_LOG: &str = "matrix.log";
pub const SHUFFLED_TAG: &str = "shuffled";
pub const SUBSAMPLED_TAG: &str = "subsampled";
pub const R1_TAG: &str = "R1";
pub const R2_TAG: &str = "R2";
pub const NO_REFERENCE: &str = "none";

// Static Parameters
pub const TARGET_COVERAGE: u64 = 10;
pub const ASSUMED_READ_LENGTH: u64 = 100;
pub const SEED_MISMATCHES: usize = 1;
pub const ALIGNER_THREADS: usize = 1;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Required tool '{tool}' was not found ({location}). Is it installed?")]
    MissingTool { tool: String, location: String },

    #[error("No R2 mate for {}: expected {}", .r1.display(), .expected.display())]
    UnpairedReads { r1: PathBuf, expected: PathBuf },

    #[error("No paired {format} read files found in the taxon directories under {}", .root.display())]
    NoTaxa { root: PathBuf, format: String },

    #[error("Missing {what}: {}", .path.display())]
    MissingArtifact { what: String, path: PathBuf },

    #[error("{tool} failed: {error}")]
    ToolExecution { tool: String, error: String },

    #[error("I/O error: {0}")]
    IOError(String),
}

/// Where the external executables live.
#[derive(Debug, Clone, Default)]
pub struct Toolchain {
    pub bin_dir: Option<PathBuf>,
    pub site_caller: String,
    pub matrix_builder: String,
}

impl Toolchain {
    /// Resolves a tool tag or script name to the program that gets spawned.
    /// Anything that already carries a directory component is used as given.
    pub fn program(&self, tool: &str) -> PathBuf {
        let candidate = Path::new(tool);
        if candidate.components().count() > 1 {
            return candidate.to_path_buf();
        }
        match &self.bin_dir {
            Some(dir) => dir.join(tool),
            None => candidate.to_path_buf(),
        }
    }
}

/// Resolved, immutable run settings shared by every stage.
#[derive(Debug)]
pub struct RunConfig {
    pub root: PathBuf,
    pub kmer: usize,
    pub processors: usize,
    pub format: ReadFormat,
    pub genome_size: Option<u64>,
    pub reference: Option<PathBuf>,
    pub missing: usize,
    pub min_reads: usize,
    pub threshold: f64,
    pub skip_level: u8,
    pub refine_repeats: bool,
    pub dispatch: DispatchMode,
    pub seed: Option<u64>,
    pub toolchain: Toolchain,
    pub run_log: PathBuf,
    pub taxa: TaxonRegistry,
}

impl RunConfig {
    /// Validates the parsed arguments, discovers the taxa and fills in defaults
    /// that depend on them.
    pub fn resolve(args: Arguments, cwd: &Path) -> Result<Self, PipelineError> {
        if args.kmer == 0 {
            return Err(PipelineError::InvalidConfig("k-mer size (-k) must be positive".to_string()));
        }
        if args.processors == 0 {
            return Err(PipelineError::InvalidConfig("processor count (-p) must be positive".to_string()));
        }
        if args.min_reads == 0 {
            return Err(PipelineError::InvalidConfig("minimum read count (-n) must be positive".to_string()));
        }
        if !(args.threshold > 0.0 && args.threshold <= 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "call threshold (-t) must be in (0, 1], got {}",
                args.threshold
            )));
        }
        if args.skip_level > 4 {
            return Err(PipelineError::InvalidConfig(format!(
                "skip level (-s) must be between 0 and 4, got {}",
                args.skip_level
            )));
        }
        if args.genome_size == Some(0) {
            return Err(PipelineError::InvalidConfig("genome size (-g) must be positive".to_string()));
        }

        let root = match &args.input_dir {
            Some(dir) => absolutize(Path::new(dir), cwd),
            None => cwd.to_path_buf(),
        };
        if !root.is_dir() {
            return Err(PipelineError::InvalidConfig(format!(
                "input directory {} does not exist",
                root.display()
            )));
        }

        let reference = match &args.reference {
            Some(r) => {
                let path = absolutize(Path::new(r), cwd);
                if !path.is_file() {
                    return Err(PipelineError::InvalidConfig(format!(
                        "reference genome {} does not exist",
                        path.display()
                    )));
                }
                Some(path)
            }
            None => None,
        };

        let taxa = TaxonRegistry::discover(&root, args.format)?;
        let missing = args.missing.unwrap_or_else(|| default_missing(taxa.taxa().len()));

        let run_log = match &args.run_log {
            Some(p) => absolutize(Path::new(p), cwd),
            None => root.join(RUN_LOG),
        };

        let toolchain = Toolchain {
            bin_dir: args.bin_dir.as_ref().map(|d| absolutize(Path::new(d), cwd)),
            site_caller: args.site_caller.clone(),
            matrix_builder: args.matrix_builder.clone(),
        };

        Ok(RunConfig {
            root,
            kmer: args.kmer,
            processors: args.processors,
            format: args.format,
            genome_size: args.genome_size,
            reference,
            missing,
            min_reads: args.min_reads,
            threshold: args.threshold,
            skip_level: args.skip_level,
            refine_repeats: args.refine_repeats,
            dispatch: args.dispatch,
            seed: args.seed,
            toolchain,
            run_log,
            taxa,
        })
    }

    pub fn assembly_dir(&self) -> PathBuf {
        self.root.join(ASSEMBLY_DIR)
    }

    pub fn composite_contigs(&self) -> PathBuf {
        self.assembly_dir().join(CONTIGS_FASTA)
    }

    pub fn composite_index(&self) -> PathBuf {
        self.assembly_dir().join(CONTIGS_INDEX)
    }

    pub fn reference_index(&self) -> PathBuf {
        self.root.join(REFERENCE_INDEX_DIR).join(REFERENCE_INDEX)
    }

    pub fn contig_mapping(&self) -> PathBuf {
        self.assembly_dir().join(CONTIG_MAPPING)
    }
}

/// All but two taxa may be missing at a site unless told otherwise.
pub fn default_missing(taxon_count: usize) -> usize {
    taxon_count.saturating_sub(2)
}

fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}
