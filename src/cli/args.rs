use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum ReadFormat {
    #[default]
    Fastq,
    Fasta,
}

impl ReadFormat {
    /// Tag used on the assembler command line and for written files.
    pub fn tag(&self) -> &'static str {
        match self {
            ReadFormat::Fastq => "fastq",
            ReadFormat::Fasta => "fasta",
        }
    }

    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            ReadFormat::Fastq => &["fastq", "fq"],
            ReadFormat::Fasta => &["fasta", "fa", "fna", "fas"],
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// Refill a slot as soon as any job finishes
    #[default]
    Pool,
    /// Launch up to N jobs, wait for all of them, repeat
    Batched,
}

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "sitematrix",
    version,
    about = "Reference-free variable-site discovery across taxa from paired short reads"
)]
pub struct Arguments {
    #[arg(short = 'g', long = "genome-size", help = "Target genome size in bp; enables subsampling to ~10x coverage")]
    pub genome_size: Option<u64>,

    #[arg(short = 'r', long = "reference", help = "Reference genome used to seed assembly and orient the final matrix")]
    pub reference: Option<String>,

    #[arg(short = 'k', long = "kmer", default_value_t = 21)]
    pub kmer: usize,

    #[arg(short = 'p', long = "processors", default_value_t = 1)]
    pub processors: usize,

    #[arg(short = 'f', long = "format", default_value = "fastq", value_enum)]
    pub format: ReadFormat,

    #[arg(short = 'm', long = "missing", help = "Taxa allowed to lack a call at a site [default: taxon count - 2]")]
    pub missing: Option<usize>,

    #[arg(short = 'a', long = "input-dir", help = "Directory holding one sub-directory of paired reads per taxon [default: current directory]")]
    pub input_dir: Option<String>,

    #[arg(short = 'n', long = "min-reads", default_value_t = 3)]
    pub min_reads: usize,

    #[arg(short = 't', long = "threshold", default_value_t = 1.0)]
    pub threshold: f64,

    #[arg(
        short = 's',
        long = "skip",
        default_value_t = 0,
        value_parser = clap::value_parser!(u8).range(0..=4),
        help = "Resume by skipping stages below this level (0-4)"
    )]
    pub skip_level: u8,

    #[arg(short = 'q', long = "refine-repeats", action, help = "Realign each taxon against its own consensus contigs")]
    pub refine_repeats: bool,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[clap(long, help = "Optional fixed seed for reproducible subsampling; defaults to OS entropy")]
    pub seed: Option<u64>,

    #[arg(long = "dispatch", default_value = "pool", value_enum)]
    pub dispatch: DispatchMode,

    #[arg(long = "bin-dir", help = "Directory containing the external tool executables; defaults to PATH lookup")]
    pub bin_dir: Option<String>,

    #[arg(long = "site-caller", default_value = "call_sites")]
    pub site_caller: String,

    #[arg(long = "matrix-builder", default_value = "build_matrix")]
    pub matrix_builder: String,

    #[arg(long = "run-log", help = "Run log path [default: <input-dir>/pipeline_run.log]")]
    pub run_log: Option<String>,
}
