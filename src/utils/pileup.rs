// mpileup parsing and taxon-specific contig derivation.
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Result};
use fxhash::FxHashMap as HashMap;
use log::{debug, warn};

use crate::cli::ReadFormat;
use crate::utils::fastx::{sequence_reader, write_fasta_record, SequenceRecord};
use crate::utils::file::partial_path;

const BASES: [u8; 4] = [b'A', b'C', b'G', b'T'];

/// One line of single-sample `samtools mpileup` output.
#[derive(Debug, Clone, PartialEq)]
pub struct PileupRecord<'a> {
    pub contig: &'a str,
    pub position: usize,
    pub reference: u8,
    pub depth: u32,
    pub bases: &'a str,
}

impl<'a> PileupRecord<'a> {
    pub fn parse_line(line: &'a str) -> Result<Self> {
        let mut fields = line.split('\t');
        let contig = fields.next().ok_or_else(|| anyhow!("Missing contig"))?;
        let position = fields.next().ok_or_else(|| anyhow!("Missing position"))?.parse()?;
        let reference = fields
            .next()
            .ok_or_else(|| anyhow!("Missing reference base"))?
            .bytes()
            .next()
            .ok_or_else(|| anyhow!("Empty reference base"))?
            .to_ascii_uppercase();
        let depth = fields.next().ok_or_else(|| anyhow!("Missing depth"))?.parse()?;
        let bases = fields.next().unwrap_or("");
        Ok(Self { contig, position, reference, depth, bases })
    }

    /// Counts A, C, G, T read bases. Match symbols count as the reference base;
    /// indels, deletions, read starts/ends and reference skips are ignored.
    pub fn base_counts(&self) -> [u32; 4] {
        let mut counts = [0u32; 4];
        let bytes = self.bases.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'^' => i += 1, // next char is the mapping quality
                b'+' | b'-' => {
                    let mut j = i + 1;
                    let mut len = 0usize;
                    while j < bytes.len() && bytes[j].is_ascii_digit() {
                        len = len * 10 + (bytes[j] - b'0') as usize;
                        j += 1;
                    }
                    i = j + len;
                    continue;
                }
                b'.' | b',' => add_base(&mut counts, self.reference),
                b => add_base(&mut counts, b.to_ascii_uppercase()),
            }
            i += 1;
        }
        counts
    }

    /// The strictly most frequent base, or None if uncovered or tied.
    pub fn majority_base(&self) -> Option<u8> {
        let counts = self.base_counts();
        let max = *counts.iter().max()?;
        if max == 0 || counts.iter().filter(|&&c| c == max).count() > 1 {
            return None;
        }
        counts.iter().position(|&c| c == max).map(|i| BASES[i])
    }
}

fn add_base(counts: &mut [u32; 4], base: u8) {
    if let Some(i) = BASES.iter().position(|&b| b == base) {
        counts[i] += 1;
    }
}

/// Rewrites the composite contigs with the taxon's majority base at every
/// covered position. Contig lengths never change, so coordinates stay shared
/// with the composite assembly.
///
/// # Arguments
///
/// * `composite` - Composite contigs FASTA.
/// * `pileup` - The taxon's mpileup against `composite`.
/// * `out` - Destination FASTA.
///
/// # Returns
/// Number of positions that differ from the composite.
pub fn derive_private_contigs(composite: &Path, pileup: &Path, out: &Path) -> Result<u64> {
    let mut contigs: Vec<(String, Option<String>, Vec<u8>)> = Vec::new();
    let mut lookup: HashMap<String, usize> = HashMap::default();
    for record in sequence_reader(composite, ReadFormat::Fasta)?.into_records() {
        if let SequenceRecord::Fasta { id, desc, seq } = record? {
            lookup.insert(id.clone(), contigs.len());
            contigs.push((id, desc, seq));
        }
    }

    let reader = BufReader::new(File::open(pileup)?);
    let mut changed = 0u64;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let record = PileupRecord::parse_line(&line)
            .map_err(|e| anyhow!("{} line {}: {}", pileup.display(), line_no + 1, e))?;
        let Some(&idx) = lookup.get(record.contig) else {
            warn!("Pileup contig {} is not in {}", record.contig, composite.display());
            continue;
        };
        let seq = &mut contigs[idx].2;
        if record.position == 0 || record.position > seq.len() {
            warn!("Pileup position {}:{} is outside the contig", record.contig, record.position);
            continue;
        }
        if let Some(base) = record.majority_base() {
            let slot = &mut seq[record.position - 1];
            if slot.to_ascii_uppercase() != base {
                *slot = base;
                changed += 1;
            }
        }
    }

    let partial = partial_path(out);
    let mut writer = BufWriter::new(File::create(&partial)?);
    for (id, desc, seq) in &contigs {
        write_fasta_record(&mut writer, id, desc.as_deref(), seq)?;
    }
    writer.flush()?;
    drop(writer);
    fs::rename(&partial, out)?;
    debug!("{}: {} positions differ from the composite contigs", out.display(), changed);
    Ok(changed)
}
