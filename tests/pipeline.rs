// End-to-end runs against stub tools that record their invocations.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tempfile::TempDir;

use sitematrix_pipelines::config::defs::{PipelineError, RunConfig};
use sitematrix_pipelines::pipelines::site_matrix;
use sitematrix_pipelines::Arguments;

const TAXA: [&str; 4] = ["taxonA", "taxonB", "taxonC", "taxonD"];

struct Workspace {
    _tmp: TempDir,
    root: PathBuf,
    bin: PathBuf,
    calls: PathBuf,
}

impl Workspace {
    fn new() -> Result<Self> {
        Self::with_reads(
            "fastq",
            "@p1/1\nACGTACGTAA\n+\nIIIIIIIIII\n@p2/1\nTTGCAACGTA\n+\nIIIIIIIIII\n",
            "@p1/2\nTTACGTACGT\n+\nIIIIIIIIII\n@p2/2\nTACGTTGCAA\n+\nIIIIIIIIII\n",
        )
    }

    fn with_fasta_reads() -> Result<Self> {
        Self::with_reads(
            "fasta",
            ">p1/1\nACGTACGTAA\n>p2/1\nTTGCAACGTA\n",
            ">p1/2\nTTACGTACGT\n>p2/2\nTACGTTGCAA\n",
        )
    }

    fn with_reads(ext: &str, r1: &str, r2: &str) -> Result<Self> {
        let tmp = TempDir::new()?;
        let root = tmp.path().join("reads");
        let bin = tmp.path().join("bin");
        let calls = tmp.path().join("calls.log");
        fs::create_dir_all(&root)?;
        fs::create_dir_all(&bin)?;
        for taxon in TAXA {
            let dir = root.join(taxon);
            fs::create_dir_all(&dir)?;
            fs::write(dir.join(format!("reads_R1.{}", ext)), r1)?;
            fs::write(dir.join(format!("reads_R2.{}", ext)), r2)?;
        }
        Ok(Workspace { _tmp: tmp, root, bin, calls })
    }

    fn stub(&self, name: &str, body: &str) -> Result<()> {
        let path = self.bin.join(name);
        let script = format!(
            "#!/bin/sh\nCALLS='{}'\n{}\n",
            self.calls.display(),
            body
        );
        fs::write(&path, script)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    fn install_tools(&self) -> Result<()> {
        self.install_tools_failing_at("")
    }

    /// Installs every tool; naming a samtools subcommand (`sort`, `mpileup`)
    /// makes it write its output and then exit 1.
    fn install_tools_failing_at(&self, failing: &str) -> Result<()> {
        self.stub("velveth", "echo \"velveth $*\" >> \"$CALLS\"\nmkdir -p \"$1\"")?;
        self.stub(
            "velvetg",
            "echo \"velvetg $*\" >> \"$CALLS\"\nprintf '>NODE_1_length_10\\nACGTACGTAA\\n' > \"$1/contigs.fa\"",
        )?;
        self.stub(
            "bowtie2-build",
            "if [ \"$1\" = \"--version\" ]; then echo 'bowtie2-build version 2.5.1'; exit 0; fi\n\
             echo \"bowtie2-build $*\" >> \"$CALLS\"\ntouch \"$2.1.bt2\"",
        )?;
        self.stub(
            "bowtie2",
            "if [ \"$1\" = \"--version\" ]; then echo 'bowtie2 version 2.5.1'; exit 0; fi\n\
             echo \"bowtie2 $*\" >> \"$CALLS\"\nprintf '@HD\\tVN:1.6\\n'\necho 'alignment summary' >&2",
        )?;
        self.stub(
            "samtools",
            &format!(
                "FAIL='{}'\n\
                 case \"$1\" in\n\
                 --version) echo 'samtools 1.19'; exit 0 ;;\n\
                 esac\n\
                 echo \"samtools $*\" >> \"$CALLS\"\n\
                 case \"$1\" in\n\
                 view) cat ;;\n\
                 sort) cat > \"$5\"; if [ \"$FAIL\" = sort ]; then exit 1; fi ;;\n\
                 index) touch \"$2.bai\" ;;\n\
                 faidx) touch \"$2.fai\" ;;\n\
                 merge) shift 2; out=\"$1\"; shift; cat \"$@\" > \"$out\" ;;\n\
                 mpileup) printf 'NODE_1_length_10\\t1\\tA\\t3\\tAAA\\tIII\\n'\n\
                 if [ \"$FAIL\" = mpileup ]; then exit 1; fi ;;\n\
                 esac",
                failing
            ),
        )?;
        self.stub("call_sites", "echo \"call_sites $*\" >> \"$CALLS\"\ntouch \"$1/site_dictionary\"")?;
        self.stub("build_matrix", "echo \"build_matrix $*\" >> \"$CALLS\"")?;
        Ok(())
    }

    fn config(&self, extra: &[&str]) -> Result<RunConfig> {
        let root = self.root.to_string_lossy().to_string();
        let bin = self.bin.to_string_lossy().to_string();
        let mut argv = vec!["sitematrix", "-a", root.as_str(), "--bin-dir", bin.as_str(), "-p", "2"];
        argv.extend_from_slice(extra);
        Ok(RunConfig::resolve(Arguments::parse_from(argv), &self.root)?)
    }

    fn calls(&self) -> Vec<String> {
        fs::read_to_string(&self.calls)
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    fn taxon_file(&self, taxon: &str, name: &str) -> PathBuf {
        self.root.join(taxon).join(name)
    }
}

fn position(calls: &[String], prefix: &str) -> Option<usize> {
    calls.iter().position(|c| c.starts_with(prefix))
}

fn count(calls: &[String], prefix: &str) -> usize {
    calls.iter().filter(|c| c.starts_with(prefix)).count()
}

/// Files left under an in-progress name anywhere below `dir`.
fn partial_files(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).into_iter().flatten().flatten() {
        let path = entry.path();
        if path.is_dir() {
            found.extend(partial_files(&path));
        } else if path.to_string_lossy().ends_with(".partial") {
            found.push(path);
        }
    }
    found
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(String::from)
        .collect()
}

#[tokio::test]
async fn test_full_run_over_four_taxa() -> Result<()> {
    let ws = Workspace::new()?;
    ws.install_tools()?;
    let config = ws.config(&["--seed", "7"])?;
    assert_eq!(config.missing, 2);

    site_matrix::run(Arc::new(config)).await?;

    let calls = ws.calls();
    let assembled = position(&calls, "velveth").expect("velveth never ran");
    let first_alignment = position(&calls, "bowtie2 -p").expect("no alignments ran");
    assert!(assembled < first_alignment, "alignment started before assembly: {:?}", calls);
    assert!(position(&calls, "velvetg").unwrap() < first_alignment);
    assert_eq!(count(&calls, "bowtie2 -p 1 -N 1 --local"), 4);
    assert_eq!(count(&calls, "samtools index"), 4);
    assert_eq!(count(&calls, "samtools mpileup"), 4);
    assert_eq!(count(&calls, "call_sites"), 4);

    let velveth = &calls[assembled];
    for taxon in TAXA {
        let shuffled = ws.taxon_file(taxon, "reads_shuffled.fastq");
        assert!(velveth.contains(&shuffled.to_string_lossy().to_string()));
        assert_eq!(read_lines(&shuffled).len(), 16);
        assert!(ws.taxon_file(taxon, "reads.bam").exists());
        assert!(ws.taxon_file(taxon, "reads.pileups").exists());
        assert!(ws.taxon_file(taxon, "site_dictionary").exists());
        assert!(ws.taxon_file(taxon, "reads.stderr.log").exists());
    }

    let matrix = calls.last().unwrap();
    assert_eq!(matrix, &format!("build_matrix 2 none {}", ws.root.display()));
    assert!(partial_files(&ws.root).is_empty(), "{:?}", partial_files(&ws.root));

    let run_log = read_lines(&ws.root.join("pipeline_run.log"));
    let starts: Vec<&String> = run_log.iter().filter(|l| l.contains("] Starting stage")).collect();
    assert_eq!(starts.len(), 5);
    assert!(starts[0].contains("stage 0"));
    assert!(starts[4].contains("stage 4"));
    assert!(run_log.iter().any(|l| l.contains("Tool samtools: samtools 1.19")));
    assert!(run_log.last().unwrap().ends_with("Run complete"));
    Ok(())
}

#[tokio::test]
async fn test_genome_size_subsamples_each_taxon() -> Result<()> {
    let ws = Workspace::new()?;
    ws.install_tools()?;
    // floor(10 * 80 / (200 * 4)) = 1 pair per taxon
    let config = ws.config(&["-g", "80", "--seed", "3", "-s", "0", "--dispatch", "batched"])?;
    site_matrix::run(Arc::new(config)).await?;

    let calls = ws.calls();
    let velveth = &calls[position(&calls, "velveth").unwrap()];
    for taxon in TAXA {
        let subsampled = ws.taxon_file(taxon, &format!("{}_subsampled.fastq", taxon));
        assert_eq!(read_lines(&subsampled).len(), 8);
        assert!(velveth.contains(&subsampled.to_string_lossy().to_string()));
        assert!(!ws.taxon_file(taxon, "reads_shuffled.fastq").exists());
    }
    Ok(())
}

#[tokio::test]
async fn test_resume_at_pileup_skips_assembly_and_alignment() -> Result<()> {
    let ws = Workspace::new()?;
    ws.install_tools()?;
    let asm_dir = ws.root.join("composite_assembly");
    fs::create_dir_all(&asm_dir)?;
    fs::write(asm_dir.join("contigs.fa"), ">NODE_1_length_10\nACGTACGTAA\n")?;
    for taxon in TAXA {
        fs::write(ws.taxon_file(taxon, "reads.bam"), "bam")?;
    }

    let config = ws.config(&["-s", "2"])?;
    site_matrix::run(Arc::new(config)).await?;

    let calls = ws.calls();
    assert_eq!(count(&calls, "velveth"), 0);
    assert_eq!(count(&calls, "bowtie2"), 0);
    assert_eq!(count(&calls, "samtools mpileup"), 4);
    assert_eq!(count(&calls, "call_sites"), 4);
    assert_eq!(count(&calls, "build_matrix"), 1);
    Ok(())
}

#[tokio::test]
async fn test_resume_without_alignments_fails_before_tools_run() -> Result<()> {
    let ws = Workspace::new()?;
    ws.install_tools()?;
    let config = ws.config(&["-s", "2"])?;
    let result = site_matrix::run(Arc::new(config)).await;
    assert!(matches!(result, Err(PipelineError::MissingArtifact { .. })));
    assert!(ws.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_missing_tool_stops_before_any_stage() -> Result<()> {
    let ws = Workspace::new()?;
    ws.install_tools()?;
    fs::remove_file(ws.bin.join("velvetg"))?;

    let config = ws.config(&[])?;
    let result = site_matrix::run(Arc::new(config)).await;
    match result {
        Err(PipelineError::MissingTool { tool, .. }) => assert_eq!(tool, "velvetg"),
        other => panic!("expected a missing tool, got {:?}", other),
    }
    assert!(ws.calls().is_empty());
    let run_log = read_lines(&ws.root.join("pipeline_run.log"));
    assert!(!run_log.iter().any(|l| l.contains("Starting stage")));
    Ok(())
}

#[tokio::test]
async fn test_failed_tool_stops_the_run_after_its_stage() -> Result<()> {
    let ws = Workspace::new()?;
    ws.install_tools_failing_at("mpileup")?;
    let config = ws.config(&[])?;

    let result = site_matrix::run(Arc::new(config)).await;
    assert!(matches!(result, Err(PipelineError::ToolExecution { .. })));

    let calls = ws.calls();
    assert_eq!(count(&calls, "samtools mpileup"), 4, "every pileup job should still run");
    assert_eq!(count(&calls, "call_sites"), 0);
    assert_eq!(count(&calls, "build_matrix"), 0);
    for taxon in TAXA {
        assert!(!ws.taxon_file(taxon, "reads.pileups").exists());
        assert!(!ws.taxon_file(taxon, "reads.pileups.partial").exists());
    }
    Ok(())
}

#[tokio::test]
async fn test_failed_sort_leaves_no_alignment_to_resume_from() -> Result<()> {
    let ws = Workspace::new()?;
    ws.install_tools_failing_at("sort")?;

    let result = site_matrix::run(Arc::new(ws.config(&[])?)).await;
    assert!(matches!(result, Err(PipelineError::ToolExecution { .. })));
    let calls = ws.calls();
    assert_eq!(count(&calls, "samtools sort -O bam -o"), 4);
    assert_eq!(count(&calls, "samtools mpileup"), 0);
    for taxon in TAXA {
        assert!(!ws.taxon_file(taxon, "reads.bam").exists());
        assert!(!ws.taxon_file(taxon, "reads.bam.partial").exists());
    }

    let resumed = site_matrix::run(Arc::new(ws.config(&["-s", "2"])?)).await;
    match resumed {
        Err(PipelineError::MissingArtifact { what, .. }) => assert_eq!(what, "alignment records"),
        other => panic!("expected a missing alignment, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_repeat_refinement_realigns_against_private_contigs() -> Result<()> {
    let ws = Workspace::new()?;
    ws.install_tools()?;
    let config = ws.config(&["-q"])?;
    site_matrix::run(Arc::new(config)).await?;

    let calls = ws.calls();
    assert_eq!(count(&calls, "bowtie2 -p 1 -N 1 --local"), 8);
    for taxon in TAXA {
        let private = ws.taxon_file(taxon, "contigs.fa");
        assert_eq!(fs::read_to_string(&private)?, ">NODE_1_length_10\nACGTACGTAA\n");
        let index = ws.taxon_file(taxon, "contigs");
        assert!(calls.iter().any(|c| c.starts_with("bowtie2-build") && c.ends_with(&index.to_string_lossy().to_string())));
        assert!(!ws.taxon_file(taxon, "merged.bam").exists());
        assert!(!ws.taxon_file(taxon, "merged.pileups").exists());
        let mpileup = format!("samtools mpileup -B -Q 0 -f {}", private.display());
        assert!(calls.iter().any(|c| c.starts_with(&mpileup)));
    }
    Ok(())
}

#[tokio::test]
async fn test_refinement_rerun_reindexes_rewritten_private_contigs() -> Result<()> {
    let ws = Workspace::new()?;
    ws.install_tools()?;
    site_matrix::run(Arc::new(ws.config(&["-q"])?)).await?;

    ws.stub(
        "velvetg",
        "echo \"velvetg $*\" >> \"$CALLS\"\nprintf '>NODE_7_length_12\\nGGGGACGTACGT\\n' > \"$1/contigs.fa\"",
    )?;
    fs::write(&ws.calls, "")?;
    site_matrix::run(Arc::new(ws.config(&["-q", "-s", "0"])?)).await?;

    let calls = ws.calls();
    for taxon in TAXA {
        let private = ws.taxon_file(taxon, "contigs.fa");
        assert!(fs::read_to_string(&private)?.starts_with(">NODE_7_length_12"));
        let faidx = position(&calls, &format!("samtools faidx {}", private.display()))
            .expect("rewritten private contigs were not re-indexed");
        let mpileup = position(&calls, &format!("samtools mpileup -B -Q 0 -f {}", private.display()))
            .expect("no pileup against the private contigs");
        assert!(faidx < mpileup, "{:?}", calls);
    }
    Ok(())
}

#[tokio::test]
async fn test_reference_places_contigs_and_reaches_the_matrix() -> Result<()> {
    let ws = Workspace::new()?;
    ws.install_tools()?;
    let reference = ws.root.parent().unwrap().join("ref.fa");
    fs::write(&reference, ">chr1\nACGTACGTAAACGTACGTAA\n")?;
    let config = ws.config(&["-r", reference.to_str().unwrap()])?;
    site_matrix::run(Arc::new(config)).await?;

    let calls = ws.calls();
    let velveth = &calls[position(&calls, "velveth").unwrap()];
    assert!(
        velveth.contains(&format!("-fasta -reference {} -fastq -shortPaired", reference.display())),
        "{}",
        velveth
    );

    let index = ws.root.join("reference_index").join("reference");
    let contigs = ws.root.join("composite_assembly").join("contigs.fa");
    let build = position(&calls, &format!("bowtie2-build {} {}", reference.display(), index.display()))
        .expect("reference was never indexed");
    let mapped = position(
        &calls,
        &format!("bowtie2 -p 2 -N 1 --local -f -x {} -U {}", index.display(), contigs.display()),
    )
    .expect("contigs were never mapped to the reference");
    assert!(build < mapped);

    let mapping = ws.root.join("composite_assembly").join("contigs_to_reference.bam");
    assert!(mapping.exists());
    assert!(position(&calls, &format!("samtools index {}", mapping.display())).unwrap() > mapped);
    assert!(ws.root.join("composite_assembly").join("contigs_to_reference.bam.bai").exists());

    assert_eq!(
        calls.last().unwrap(),
        &format!("build_matrix 2 {} {}", reference.display(), ws.root.display())
    );
    Ok(())
}

#[tokio::test]
async fn test_fasta_reads_run_end_to_end() -> Result<()> {
    let ws = Workspace::with_fasta_reads()?;
    ws.install_tools()?;
    site_matrix::run(Arc::new(ws.config(&["-f", "fasta"])?)).await?;

    let calls = ws.calls();
    let velveth = &calls[position(&calls, "velveth").unwrap()];
    assert!(velveth.contains(" -fasta -shortPaired "), "{}", velveth);
    assert!(!velveth.contains("-fastq"));
    assert_eq!(count(&calls, "bowtie2 -p 1 -N 1 --local -f -x"), 4);
    for taxon in TAXA {
        let shuffled = ws.taxon_file(taxon, "reads_shuffled.fasta");
        assert_eq!(read_lines(&shuffled).len(), 8);
        assert!(ws.taxon_file(taxon, "reads.pileups").exists());
    }
    assert_eq!(count(&calls, "build_matrix"), 1);
    Ok(())
}
