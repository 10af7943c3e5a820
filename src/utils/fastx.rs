use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Result};
use seq_io::fasta::{OwnedRecord as FastaOwnedRecord, Reader as FastaReader};
use seq_io::fastq::{OwnedRecord as FastqOwnedRecord, Reader as FastqReader};

use crate::cli::ReadFormat;
use crate::config::defs::{R1_TAG, R2_TAG, SHUFFLED_TAG};
use crate::utils::file::{file_reader, partial_path, split_extension, FileReader, WriteToFile};

/// Defines FASTA and FASTQ as part of a unified FASTX structure.
#[derive(Clone, Debug, PartialEq)]
pub enum SequenceRecord {
    Fasta {
        id: String,
        desc: Option<String>,
        seq: Vec<u8>,
    },
    Fastq {
        id: String,
        desc: Option<String>,
        seq: Vec<u8>,
        qual: Vec<u8>,
    },
}

/// Maps id to the correct file type.
impl SequenceRecord {
    pub fn id(&self) -> &str {
        match self {
            SequenceRecord::Fasta { id, .. } => id,
            SequenceRecord::Fastq { id, .. } => id,
        }
    }
}

impl From<FastaOwnedRecord> for SequenceRecord {
    fn from(record: FastaOwnedRecord) -> Self {
        let (id, desc) = parse_header(&record.head, '>');
        SequenceRecord::Fasta {
            id,
            desc,
            seq: record.seq,
        }
    }
}

impl From<FastqOwnedRecord> for SequenceRecord {
    fn from(record: FastqOwnedRecord) -> Self {
        let (id, desc) = parse_header(&record.head, '@');
        SequenceRecord::Fastq {
            id,
            desc,
            seq: record.seq,
            qual: record.qual,
        }
    }
}

impl WriteToFile for SequenceRecord {
    fn write_to_file<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            SequenceRecord::Fastq { id, desc, seq, qual } => {
                write_fastq_record(writer, id, desc.as_deref(), seq, qual)
            }
            SequenceRecord::Fasta { id, desc, seq } => {
                write_fasta_record(writer, id, desc.as_deref(), seq)
            }
        }
    }
}

pub type RecordIter = Box<dyn Iterator<Item = Result<SequenceRecord>> + Send>;

/// Enum to hold either FASTA or FASTQ reader
pub enum SequenceReader {
    Fasta(FastaReader<FileReader>),
    Fastq(FastqReader<FileReader>),
}

impl SequenceReader {
    pub fn into_records(self) -> RecordIter {
        match self {
            SequenceReader::Fasta(reader) => Box::new(
                reader
                    .into_records()
                    .map(|r| r.map(SequenceRecord::from).map_err(|e| anyhow!("Invalid FASTA record: {}", e))),
            ),
            SequenceReader::Fastq(reader) => Box::new(
                reader
                    .into_records()
                    .map(|r| r.map(SequenceRecord::from).map_err(|e| anyhow!("Invalid FASTQ record: {}", e))),
            ),
        }
    }
}

/// Creates a SequenceReader for a plain or gzipped read file.
///
/// # Arguments
///
/// * `path` - Valid path to a fastx file.
/// * `format` - Configured read format.
///
/// # Returns
/// io::Result<SequenceReader>
pub fn sequence_reader(path: &Path, format: ReadFormat) -> io::Result<SequenceReader> {
    let reader = file_reader(path)?;
    Ok(match format {
        ReadFormat::Fasta => SequenceReader::Fasta(FastaReader::new(reader)),
        ReadFormat::Fastq => SequenceReader::Fastq(FastqReader::new(reader)),
    })
}

pub fn write_fasta_record<W: Write>(
    writer: &mut W,
    id: &str,
    desc: Option<&str>,
    seq: &[u8],
) -> io::Result<()> {
    writer.write_all(b">")?;
    writer.write_all(id.as_bytes())?;
    if let Some(desc) = desc {
        writer.write_all(b" ")?;
        writer.write_all(desc.as_bytes())?;
    }
    writer.write_all(b"\n")?;

    for chunk in seq.chunks(80) {
        writer.write_all(chunk)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

pub fn write_fastq_record<W: Write>(
    writer: &mut W,
    id: &str,
    desc: Option<&str>,
    seq: &[u8],
    qual: &[u8],
) -> io::Result<()> {
    writer.write_all(b"@")?;
    writer.write_all(id.as_bytes())?;
    if let Some(desc) = desc {
        writer.write_all(b" ")?;
        writer.write_all(desc.as_bytes())?;
    }
    writer.write_all(b"\n")?;
    writer.write_all(seq)?;
    writer.write_all(b"\n+\n")?;
    writer.write_all(qual)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Parses a FASTX header.
///
/// # Arguments
///
/// * `head` - Header line of a FASTX record.
/// * 'prefix' - Leading, defining character of the header. > for FASTA, @ for FASTQ.
///
/// # Returns
/// Tuple: (id, desc) split of header on whitespace.
fn parse_header(head: &[u8], prefix: char) -> (String, Option<String>) {
    let head_str = String::from_utf8_lossy(head).into_owned();
    let parts: Vec<&str> = head_str.splitn(2, |c: char| c.is_whitespace()).collect();
    let id = parts[0].trim_start_matches(prefix).to_string();
    let desc = parts.get(1).map(|s| s.to_string()).filter(|s| !s.is_empty());
    (id, desc)
}

/// Where the R1 token sits in a read file name.
#[derive(Debug, Clone, PartialEq)]
pub struct R1R2Result {
    pub delimiter: char,
    pub parts: Vec<String>,
    pub index: usize,
    pub extension: String,
}

impl R1R2Result {
    /// Name with the R1 token (and its delimiter) removed and no extension.
    pub fn base_name(&self) -> String {
        self.parts
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != self.index)
            .map(|(_, p)| p.as_str())
            .collect::<Vec<_>>()
            .join(&self.delimiter.to_string())
    }

    /// Stem with the R1 token swapped for `tag`.
    pub fn retag(&self, tag: &str) -> String {
        self.parts
            .iter()
            .enumerate()
            .map(|(i, p)| if i == self.index { tag } else { p.as_str() })
            .collect::<Vec<_>>()
            .join(&self.delimiter.to_string())
    }

    pub fn mate_file_name(&self) -> String {
        format!("{}.{}", self.retag(R2_TAG), self.extension)
    }

    /// Interleaved output is always written uncompressed.
    pub fn shuffled_file_name(&self, format: ReadFormat) -> String {
        format!("{}.{}", self.retag(SHUFFLED_TAG), format.tag())
    }
}

/// Locates a delimited `R1` token in a read file name of the configured format.
///
/// # Arguments
///
/// * `file_name` - Bare file name, e.g. `reads_R1.fastq.gz`.
/// * `format` - Configured read format; other extensions never match.
///
/// # Returns
/// Some(R1R2Result) if the name carries an R1 token, else None.
pub fn r1r2_base(file_name: &str, format: ReadFormat) -> Option<R1R2Result> {
    let (stem, extension) = split_extension(file_name, format.extensions())?;

    for delimiter in ['_', '.', '-'] {
        let parts: Vec<&str> = stem.split(delimiter).collect();
        if let Some(index) = parts.iter().position(|p| *p == R1_TAG) {
            return Some(R1R2Result {
                delimiter,
                parts: parts.iter().map(|p| p.to_string()).collect(),
                index,
                extension: extension.to_string(),
            });
        }
    }
    None
}

/// Counts the records in a read file.
pub fn record_counter(path: &Path, format: ReadFormat) -> Result<u64> {
    let mut counter = 0;
    for record in sequence_reader(path, format)?.into_records() {
        record?;
        counter += 1;
    }
    Ok(counter)
}

/// Writes mate pairs from two files as one interleaved file (R1, R2, R1, R2...).
/// Output goes to a partial file that is renamed once complete.
///
/// # Arguments
///
/// * `r1` - Forward reads.
/// * `r2` - Reverse reads.
/// * `out` - Interleaved destination.
/// * `format` - Configured read format.
///
/// # Returns
/// Number of pairs written.
pub fn interleave_pair(r1: &Path, r2: &Path, out: &Path, format: ReadFormat) -> Result<u64> {
    let mut records1 = sequence_reader(r1, format)?.into_records();
    let mut records2 = sequence_reader(r2, format)?.into_records();

    let partial = partial_path(out);
    let mut writer = BufWriter::new(File::create(&partial)?);
    let mut pairs = 0u64;
    loop {
        match (records1.next(), records2.next()) {
            (Some(a), Some(b)) => {
                a?.write_to_file(&mut writer)?;
                b?.write_to_file(&mut writer)?;
                pairs += 1;
            }
            (None, None) => break,
            _ => {
                drop(writer);
                let _ = fs::remove_file(&partial);
                return Err(anyhow!(
                    "{} and {} hold different numbers of reads (mismatch after {} pairs)",
                    r1.display(),
                    r2.display(),
                    pairs
                ));
            }
        }
    }
    writer.flush()?;
    drop(writer);
    fs::rename(&partial, out)?;
    Ok(pairs)
}
