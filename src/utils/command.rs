/// Functions and structs for working with creating command-line arguments

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Result};
use tokio::process::Command;

use crate::config::defs::{Toolchain, VERSION_ARGS};
use crate::utils::streams::{read_child_output_to_vec, ChildStream};

/// A fully resolved external invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCommand {
    /// Short name used in logs and errors.
    pub tool: String,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(toolchain: &Toolchain, tool: &str, args: Vec<String>) -> Self {
        ToolCommand {
            tool: tool.to_string(),
            program: toolchain.program(tool),
            args,
        }
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

pub mod velvet {
    use std::path::PathBuf;

    use super::{path_arg, ToolCommand};
    use crate::config::defs::{RunConfig, VELVETG_TAG, VELVETH_TAG};

    /// velveth hashing of every shuffled pair file, with the reference genome
    /// as an extra read category when one was given.
    pub fn velveth_arg_generator(config: &RunConfig, shuffled: &[PathBuf]) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push(path_arg(&config.assembly_dir()));
        args_vec.push(config.kmer.to_string());
        if let Some(reference) = &config.reference {
            args_vec.push("-fasta".to_string());
            args_vec.push("-reference".to_string());
            args_vec.push(path_arg(reference));
        }
        args_vec.push(format!("-{}", config.format.tag()));
        args_vec.push("-shortPaired".to_string());
        args_vec.extend(shuffled.iter().map(|p| path_arg(p)));
        args_vec
    }

    pub fn velvetg_arg_generator(config: &RunConfig) -> Vec<String> {
        vec![
            path_arg(&config.assembly_dir()),
            "-exp_cov".to_string(),
            "auto".to_string(),
            "-cov_cutoff".to_string(),
            "auto".to_string(),
        ]
    }

    pub fn velveth(config: &RunConfig, shuffled: &[PathBuf]) -> ToolCommand {
        ToolCommand::new(&config.toolchain, VELVETH_TAG, velveth_arg_generator(config, shuffled))
    }

    pub fn velvetg(config: &RunConfig) -> ToolCommand {
        ToolCommand::new(&config.toolchain, VELVETG_TAG, velvetg_arg_generator(config))
    }
}

pub mod bowtie2 {
    use std::path::Path;

    use super::{path_arg, ToolCommand};
    use crate::cli::ReadFormat;
    use crate::config::defs::{RunConfig, ALIGNER_THREADS, BOWTIE2_BUILD_TAG, BOWTIE2_TAG, SEED_MISMATCHES};

    pub fn build(config: &RunConfig, fasta: &Path, index: &Path) -> ToolCommand {
        ToolCommand::new(
            &config.toolchain,
            BOWTIE2_BUILD_TAG,
            vec![path_arg(fasta), path_arg(index)],
        )
    }

    /// Local paired-end alignment; one aligner thread per job since the job
    /// pool already fans out across libraries.
    pub fn pair_arg_generator(config: &RunConfig, index: &Path, r1: &Path, r2: &Path) -> Vec<String> {
        let mut args_vec: Vec<String> = vec![
            "-p".to_string(),
            ALIGNER_THREADS.to_string(),
            "-N".to_string(),
            SEED_MISMATCHES.to_string(),
            "--local".to_string(),
        ];
        if config.format == ReadFormat::Fasta {
            args_vec.push("-f".to_string());
        }
        args_vec.push("-x".to_string());
        args_vec.push(path_arg(index));
        args_vec.push("-1".to_string());
        args_vec.push(path_arg(r1));
        args_vec.push("-2".to_string());
        args_vec.push(path_arg(r2));
        args_vec
    }

    pub fn align_pair(config: &RunConfig, index: &Path, r1: &Path, r2: &Path) -> ToolCommand {
        ToolCommand::new(&config.toolchain, BOWTIE2_TAG, pair_arg_generator(config, index, r1, r2))
    }

    /// Unpaired FASTA alignment of the composite contigs to the reference.
    pub fn align_contigs(config: &RunConfig, index: &Path, contigs: &Path) -> ToolCommand {
        let args_vec = vec![
            "-p".to_string(),
            config.processors.to_string(),
            "-N".to_string(),
            SEED_MISMATCHES.to_string(),
            "--local".to_string(),
            "-f".to_string(),
            "-x".to_string(),
            path_arg(index),
            "-U".to_string(),
            path_arg(contigs),
        ];
        ToolCommand::new(&config.toolchain, BOWTIE2_TAG, args_vec)
    }
}

pub mod samtools {
    use std::path::{Path, PathBuf};

    use super::{path_arg, ToolCommand};
    use crate::config::defs::{SamtoolsSubcommand, Toolchain, SAMTOOLS_TAG};

    /// Ordered flag/value pairs after the subcommand; positional arguments
    /// are entries without a value.
    #[derive(Debug, Clone)]
    pub struct SamtoolsConfig {
        pub subcommand: SamtoolsSubcommand,
        pub subcommand_fields: Vec<(String, Option<String>)>,
    }

    pub fn arg_generator(config: &SamtoolsConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = vec![config.subcommand.as_str().to_string()];
        for (flag, value) in &config.subcommand_fields {
            args_vec.push(flag.clone());
            if let Some(value) = value {
                args_vec.push(value.clone());
            }
        }
        args_vec
    }

    pub fn command(toolchain: &Toolchain, config: &SamtoolsConfig) -> ToolCommand {
        ToolCommand::new(toolchain, SAMTOOLS_TAG, arg_generator(config))
    }

    /// Uncompressed BAM of mapped reads only, from SAM on stdin.
    pub fn view_mapped() -> SamtoolsConfig {
        SamtoolsConfig {
            subcommand: SamtoolsSubcommand::View,
            subcommand_fields: vec![
                ("-u".to_string(), None),
                ("-F".to_string(), Some("4".to_string())),
                ("-".to_string(), None),
            ],
        }
    }

    /// Coordinate sort of stdin into `out` as BAM whatever its extension.
    pub fn sort_to(out: &Path) -> SamtoolsConfig {
        SamtoolsConfig {
            subcommand: SamtoolsSubcommand::Sort,
            subcommand_fields: vec![
                ("-O".to_string(), Some("bam".to_string())),
                ("-o".to_string(), Some(path_arg(out))),
                ("-".to_string(), None),
            ],
        }
    }

    pub fn index(bam: &Path) -> SamtoolsConfig {
        SamtoolsConfig {
            subcommand: SamtoolsSubcommand::Index,
            subcommand_fields: vec![(path_arg(bam), None)],
        }
    }

    pub fn faidx(fasta: &Path) -> SamtoolsConfig {
        SamtoolsConfig {
            subcommand: SamtoolsSubcommand::Faidx,
            subcommand_fields: vec![(path_arg(fasta), None)],
        }
    }

    pub fn merge(out: &Path, inputs: &[PathBuf]) -> SamtoolsConfig {
        let mut subcommand_fields = vec![("-f".to_string(), None), (path_arg(out), None)];
        subcommand_fields.extend(inputs.iter().map(|p| (path_arg(p), None)));
        SamtoolsConfig {
            subcommand: SamtoolsSubcommand::Merge,
            subcommand_fields,
        }
    }

    /// Per-position pileup without BAQ and with no base-quality floor.
    pub fn mpileup(contigs: &Path, bam: &Path) -> SamtoolsConfig {
        SamtoolsConfig {
            subcommand: SamtoolsSubcommand::Mpileup,
            subcommand_fields: vec![
                ("-B".to_string(), None),
                ("-Q".to_string(), Some("0".to_string())),
                ("-f".to_string(), Some(path_arg(contigs))),
                (path_arg(bam), None),
            ],
        }
    }
}

/// The two downstream programs that turn pileups into a matrix.
pub mod collaborators {
    use std::path::Path;

    use super::{path_arg, ToolCommand};
    use crate::config::defs::{RunConfig, NO_REFERENCE};

    /// `<site_caller> <taxon_dir> <min_reads> <threshold>`
    pub fn site_caller(config: &RunConfig, taxon_dir: &Path) -> ToolCommand {
        let tool = &config.toolchain.site_caller;
        ToolCommand::new(
            &config.toolchain,
            tool,
            vec![path_arg(taxon_dir), config.min_reads.to_string(), config.threshold.to_string()],
        )
    }

    /// `<matrix_builder> <missing> <reference|none> <root>`
    pub fn matrix_builder(config: &RunConfig) -> ToolCommand {
        let tool = &config.toolchain.matrix_builder;
        let reference = match &config.reference {
            Some(reference) => path_arg(reference),
            None => NO_REFERENCE.to_string(),
        };
        ToolCommand::new(
            &config.toolchain,
            tool,
            vec![config.missing.to_string(), reference, path_arg(&config.root)],
        )
    }
}

/// Finds the file that would be spawned for `program`: a path with a
/// directory component is checked as is, a bare name is searched on PATH.
pub fn locate_executable(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return is_executable(program).then(|| program.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Asks a located tool for its version. Only tools listed in VERSION_ARGS are
/// probed; the first line of stdout is returned verbatim.
///
/// # Arguments
///
/// * `tool` - Tool tag.
/// * `program` - Executable from locate_executable.
///
/// # Returns
/// Version line, or an error if the tool cannot be probed.
pub async fn check_version(tool: &str, program: &Path) -> Result<String> {
    let args = VERSION_ARGS
        .get(tool)
        .ok_or_else(|| anyhow!("No version probe for {}", tool))?;

    let mut child = Command::new(program)
        .args(args.iter())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| anyhow!("Failed to spawn {}: {}. Is {} installed?", program.display(), e, tool))?;

    let lines = read_child_output_to_vec(&mut child, ChildStream::Stdout).await?;
    child.wait().await?;
    let first_line = lines
        .first()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .ok_or_else(|| anyhow!("No output from {} {}", tool, args.join(" ")))?;
    Ok(first_line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defs::SamtoolsSubcommand;

    #[test]
    fn test_samtools_arg_generator_keeps_order() {
        let config = samtools::mpileup(Path::new("/a/contigs.fa"), Path::new("/a/t/reads.bam"));
        assert_eq!(
            samtools::arg_generator(&config),
            vec!["mpileup", "-B", "-Q", "0", "-f", "/a/contigs.fa", "/a/t/reads.bam"]
        );

        let merge = samtools::merge(
            Path::new("m.bam"),
            &[PathBuf::from("x.bam"), PathBuf::from("y.bam")],
        );
        assert_eq!(merge.subcommand, SamtoolsSubcommand::Merge);
        assert_eq!(samtools::arg_generator(&merge), vec!["merge", "-f", "m.bam", "x.bam", "y.bam"]);

        assert_eq!(
            samtools::arg_generator(&samtools::view_mapped()),
            vec!["view", "-u", "-F", "4", "-"]
        );
        assert_eq!(
            samtools::arg_generator(&samtools::sort_to(Path::new("o.bam.partial"))),
            vec!["sort", "-O", "bam", "-o", "o.bam.partial", "-"]
        );
    }

    #[test]
    fn test_samtools_command_uses_bin_dir() {
        let toolchain = Toolchain {
            bin_dir: Some(PathBuf::from("/opt/bin")),
            ..Default::default()
        };
        let command = samtools::command(&toolchain, &samtools::index(Path::new("r.bam")));
        assert_eq!(command.program, PathBuf::from("/opt/bin/samtools"));
        assert_eq!(command.to_string(), "/opt/bin/samtools index r.bam");
    }

    #[cfg(unix)]
    #[test]
    fn test_locate_executable() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::TempDir::new().unwrap();
        let script = tmp.path().join("tool");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        assert_eq!(locate_executable(&script), None);
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(locate_executable(&script), Some(script.clone()));
        assert_eq!(locate_executable(&tmp.path().join("absent")), None);
        assert!(locate_executable(Path::new("sh")).is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_check_version_reads_first_line() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::TempDir::new().unwrap();
        let script = tmp.path().join("samtools");
        fs::write(&script, "#!/bin/sh\necho 'samtools 1.19'\necho 'Using htslib 1.19'\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let version = check_version("samtools", &script).await.unwrap();
        assert_eq!(version, "samtools 1.19");
        assert!(check_version("velveth", &script).await.is_err());
    }
}
