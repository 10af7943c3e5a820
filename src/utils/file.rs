use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use log::debug;

pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Enum to hold either an uncompressed or gzipped file reader
pub enum FileReader {
    Uncompressed(BufReader<File>),
    Gzipped(GzDecoder<File>),
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FileReader::Uncompressed(r) => r.read(buf),
            FileReader::Gzipped(r) => r.read(buf),
        }
    }
}

pub fn file_reader(path: &Path) -> io::Result<FileReader> {
    let file = File::open(path)?;
    if is_gzipped(path)? {
        Ok(FileReader::Gzipped(GzDecoder::new(file)))
    } else {
        Ok(FileReader::Uncompressed(BufReader::new(file)))
    }
}

pub trait WriteToFile {
    fn write_to_file<W: Write>(&self, writer: &mut W) -> io::Result<()>;
}

/// Builds a sibling path by decorating a file name.
///
/// # Arguments
///
/// * `path` - Path whose file name is decorated.
/// * `dir` - Directory for the result; defaults to the parent of `path`.
/// * `prefix` - Optional text placed before the file name.
/// * `suffix` - Optional text placed after the file name.
/// * `delimiter` - Joins prefix, name and suffix.
///
/// # Returns
/// The decorated path.
pub fn file_path_manipulator(
    path: &Path,
    dir: Option<&Path>,
    prefix: Option<&str>,
    suffix: Option<&str>,
    delimiter: &str,
) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut new_name = String::new();
    if let Some(prefix) = prefix {
        new_name.push_str(prefix);
        new_name.push_str(delimiter);
    }
    new_name.push_str(&file_name);
    if let Some(suffix) = suffix {
        new_name.push_str(delimiter);
        new_name.push_str(suffix);
    }

    let parent = match dir {
        Some(d) => d.to_path_buf(),
        None => path.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    parent.join(new_name)
}

/// Splits `name` into (stem, extension) where the extension is one of `exts`,
/// optionally followed by `.gz`. Matching ignores case.
pub fn split_extension<'a>(name: &'a str, exts: &[&str]) -> Option<(&'a str, &'a str)> {
    let cut = name.len().saturating_sub(3);
    let without_gz = match name.get(cut..) {
        Some(tail) if cut > 0 && tail.eq_ignore_ascii_case(".gz") => &name[..cut],
        _ => name,
    };
    let dot = without_gz.rfind('.')?;
    let ext = &without_gz[dot + 1..];
    if dot == 0 || !exts.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
        return None;
    }
    Some((&name[..dot], &name[dot + 1..]))
}

/// In-progress name for an output that is renamed into place once complete.
pub fn partial_path(path: &Path) -> PathBuf {
    file_path_manipulator(path, None, None, Some("partial"), ".")
}

/// Opens a log file for appending, creating it if needed.
pub fn append_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Hard-links `src` to `dst`, copying when the filesystem refuses the link.
/// Any existing `dst` is replaced.
pub fn link_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    remove_if_exists(dst)?;
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("Hard link {} -> {} failed ({}); copying", src.display(), dst.display(), e);
            fs::copy(src, dst).map(|_| ())
        }
    }
}

pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
