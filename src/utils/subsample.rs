// Coverage-targeted read-pair subsampling.
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Result};
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::seq::index;

use crate::cli::ReadFormat;
use crate::config::defs::{ASSUMED_READ_LENGTH, TARGET_COVERAGE};
use crate::utils::fastx::{record_counter, sequence_reader};
use crate::utils::file::{partial_path, WriteToFile};
use crate::utils::taxa::Taxon;

/// Read pairs each taxon contributes so the pooled reads reach ~10x coverage
/// of `genome_size`, assuming ~100 bp reads.
///
/// `floor(10 * G / (100 * 2 * T))`
pub fn target_reads_per_taxon(genome_size: u64, taxon_count: usize) -> u64 {
    if taxon_count == 0 {
        return 0;
    }
    let numerator = TARGET_COVERAGE as u128 * genome_size as u128;
    let denominator = ASSUMED_READ_LENGTH as u128 * 2 * taxon_count as u128;
    (numerator / denominator) as u64
}

/// Uniformly draws `target` read pairs without replacement from all of a
/// taxon's libraries and writes them interleaved to `out`.
///
/// # Arguments
///
/// * `taxon` - Taxon whose libraries are sampled.
/// * `target` - Pairs to keep.
/// * `out` - Interleaved destination.
/// * `format` - Configured read format.
/// * `rng` - Seeded generator for this taxon.
///
/// # Returns
/// Number of pairs written.
pub fn subsample_taxon(
    taxon: &Taxon,
    target: u64,
    out: &Path,
    format: ReadFormat,
    rng: &mut StdRng,
) -> Result<u64> {
    let mut library_pairs = Vec::with_capacity(taxon.libraries.len());
    for library in &taxon.libraries {
        library_pairs.push(record_counter(&library.r1, format)?);
    }
    let total: u64 = library_pairs.iter().sum();

    let selected: Option<Vec<u64>> = if target >= total {
        if target > total {
            warn!(
                "{} has {} read pairs, fewer than the {} requested; keeping all of them",
                taxon.name, total, target
            );
        }
        None
    } else {
        let mut picks: Vec<u64> = index::sample(rng, total as usize, target as usize)
            .into_iter()
            .map(|i| i as u64)
            .collect();
        picks.sort_unstable();
        Some(picks)
    };
    debug!(
        "{}: keeping {} of {} read pairs",
        taxon.name,
        selected.as_ref().map_or(total, |s| s.len() as u64),
        total
    );

    let partial = partial_path(out);
    match write_selected_pairs(taxon, selected.as_deref(), &partial, format) {
        Ok(written) => {
            fs::rename(&partial, out)?;
            Ok(written)
        }
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e)
        }
    }
}

/// Streams the pairs whose global index is in `selected` (all pairs when
/// `None`) from the taxon's libraries into `dest`.
fn write_selected_pairs(
    taxon: &Taxon,
    selected: Option<&[u64]>,
    dest: &Path,
    format: ReadFormat,
) -> Result<u64> {
    let mut writer = BufWriter::new(File::create(dest)?);
    let mut wanted = selected.map(|s| s.iter().peekable());
    let mut pair_index = 0u64;
    let mut written = 0u64;

    for library in &taxon.libraries {
        if let Some(w) = wanted.as_mut() {
            if w.peek().is_none() {
                break;
            }
        }
        let mut records1 = sequence_reader(&library.r1, format)?.into_records();
        let mut records2 = sequence_reader(&library.r2, format)?.into_records();
        loop {
            let (a, b) = match (records1.next(), records2.next()) {
                (Some(a), Some(b)) => (a?, b?),
                (None, None) => break,
                _ => {
                    return Err(anyhow!(
                        "{} and {} hold different numbers of reads",
                        library.r1.display(),
                        library.r2.display()
                    ));
                }
            };
            let keep = match wanted.as_mut() {
                None => true,
                Some(w) => w.next_if_eq(&&pair_index).is_some(),
            };
            if keep {
                a.write_to_file(&mut writer)?;
                b.write_to_file(&mut writer)?;
                written += 1;
            }
            pair_index += 1;
        }
    }

    writer.flush()?;
    Ok(written)
}
