// Taxon discovery and the per-taxon artifact registry.
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::cli::ReadFormat;
use crate::config::defs::{
    PipelineError, CONTIGS_FASTA, CONTIGS_INDEX, MERGED_ALIGNMENT, MERGED_PILEUP, REFINEMENT_LOG,
    SITE_CALLING_LOG, SITE_DICTIONARY, SUBSAMPLED_TAG,
};
use crate::utils::fastx::r1r2_base;
use crate::utils::file::file_path_manipulator;

/// One R1/R2 pair and every artifact derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadLibrary {
    pub r1: PathBuf,
    pub r2: PathBuf,
    /// `<taxon_dir>/<R1 name without the R1 token and extension>`; every
    /// per-library artifact hangs off this path.
    pub base: PathBuf,
    pub shuffled: PathBuf,
}

impl ReadLibrary {
    /// Builds the library for an R1 file, or None if the name has no R1 token.
    pub fn from_r1(taxon: &str, r1: &Path, format: ReadFormat) -> Result<Option<Self>, PipelineError> {
        let dir = r1.parent().map(Path::to_path_buf).unwrap_or_default();
        let file_name = match r1.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => return Ok(None),
        };
        let naming = match r1r2_base(file_name, format) {
            Some(naming) => naming,
            None => return Ok(None),
        };

        let r2 = dir.join(naming.mate_file_name());
        if !r2.is_file() {
            return Err(PipelineError::UnpairedReads { r1: r1.to_path_buf(), expected: r2 });
        }

        let mut base_name = naming.base_name();
        if base_name.is_empty() {
            base_name = taxon.to_string();
        }

        Ok(Some(ReadLibrary {
            r1: r1.to_path_buf(),
            r2,
            base: dir.join(base_name),
            shuffled: dir.join(naming.shuffled_file_name(format)),
        }))
    }

    pub fn alignment(&self) -> PathBuf {
        file_path_manipulator(&self.base, None, None, Some("bam"), ".")
    }

    pub fn pileup(&self) -> PathBuf {
        file_path_manipulator(&self.base, None, None, Some("pileups"), ".")
    }

    pub fn stdout_log(&self) -> PathBuf {
        file_path_manipulator(&self.base, None, None, Some("stdout.log"), ".")
    }

    pub fn stderr_log(&self) -> PathBuf {
        file_path_manipulator(&self.base, None, None, Some("stderr.log"), ".")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Taxon {
    pub name: String,
    pub dir: PathBuf,
    pub libraries: Vec<ReadLibrary>,
}

impl Taxon {
    pub fn subsampled(&self, format: ReadFormat) -> PathBuf {
        let suffix = format!("{}.{}", SUBSAMPLED_TAG, format.tag());
        file_path_manipulator(Path::new(&self.name), Some(&self.dir), None, Some(&suffix), "_")
    }

    pub fn merged_alignment(&self) -> PathBuf {
        self.dir.join(MERGED_ALIGNMENT)
    }

    pub fn merged_pileup(&self) -> PathBuf {
        self.dir.join(MERGED_PILEUP)
    }

    pub fn private_contigs(&self) -> PathBuf {
        self.dir.join(CONTIGS_FASTA)
    }

    pub fn private_index(&self) -> PathBuf {
        self.dir.join(CONTIGS_INDEX)
    }

    pub fn dictionary(&self) -> PathBuf {
        self.dir.join(SITE_DICTIONARY)
    }

    pub fn site_calling_log(&self) -> PathBuf {
        self.dir.join(SITE_CALLING_LOG)
    }

    pub fn refinement_log(&self) -> PathBuf {
        self.dir.join(REFINEMENT_LOG)
    }

    pub fn alignments(&self) -> Vec<PathBuf> {
        self.libraries.iter().map(ReadLibrary::alignment).collect()
    }
}

/// Every taxon in the run, sorted by directory name. Fixed once discovered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaxonRegistry {
    taxa: Vec<Taxon>,
}

impl TaxonRegistry {
    /// Scans each immediate sub-directory of `root` for R1 read files of the
    /// configured format. Directories without any are not taxa.
    ///
    /// # Arguments
    ///
    /// * `root` - Input directory.
    /// * `format` - Configured read format.
    ///
    /// # Returns
    /// The registry, or an error for an R1 without an R2 or an empty root.
    pub fn discover(root: &Path, format: ReadFormat) -> Result<Self, PipelineError> {
        let mut dirs: Vec<PathBuf> = fs::read_dir(root)
            .map_err(|e| PipelineError::IOError(format!("{}: {}", root.display(), e)))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        dirs.dedup();

        let mut taxa = Vec::new();
        for dir in dirs {
            let name = match dir.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };

            let mut files: Vec<PathBuf> = fs::read_dir(&dir)
                .map_err(|e| PipelineError::IOError(format!("{}: {}", dir.display(), e)))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file())
                .collect();
            files.sort();

            let mut libraries = Vec::new();
            for file in &files {
                if let Some(library) = ReadLibrary::from_r1(&name, file, format)? {
                    debug!("{}: {} + {}", name, library.r1.display(), library.r2.display());
                    libraries.push(library);
                }
            }

            if !libraries.is_empty() {
                taxa.push(Taxon { name, dir, libraries });
            }
        }

        if taxa.is_empty() {
            return Err(PipelineError::NoTaxa {
                root: root.to_path_buf(),
                format: format.tag().to_string(),
            });
        }
        info!("Discovered {} taxa under {}", taxa.len(), root.display());
        Ok(TaxonRegistry { taxa })
    }

    pub fn taxa(&self) -> &[Taxon] {
        &self.taxa
    }

    pub fn libraries(&self) -> impl Iterator<Item = &ReadLibrary> {
        self.taxa.iter().flat_map(|t| t.libraries.iter())
    }
}
