//! Directory archiving: tar + gzip, split into numbered chunks.
//!
//! `archive_directory` writes `<name>.0`, `<name>.1`, … each at most
//! `chunk_size` bytes. `extract_parts` accepts the parts in any order,
//! concatenates them by numeric suffix and unpacks the result.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::TransferError;

/// Largest chunk produced by default: 20 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 20 * 1024 * 1024;

/// Writes a byte stream into consecutive chunk files.
struct ChunkWriter {
    dir: PathBuf,
    name: String,
    chunk_size: u64,
    current: Option<BufWriter<File>>,
    written: u64,
    parts: Vec<String>,
}

impl ChunkWriter {
    fn new(dir: &Path, name: &str, chunk_size: u64) -> Self {
        Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            chunk_size: chunk_size.max(1),
            current: None,
            written: 0,
            parts: Vec::new(),
        }
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.current.take() {
            file.flush()?;
        }
        let part = format!("{}.{}", self.name, self.parts.len());
        self.current = Some(BufWriter::new(File::create(self.dir.join(&part))?));
        self.parts.push(part);
        self.written = 0;
        Ok(())
    }

    fn finish(mut self) -> io::Result<Vec<String>> {
        if let Some(mut file) = self.current.take() {
            file.flush()?;
        }
        Ok(self.parts)
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.current.is_none() || self.written == self.chunk_size {
            self.rotate()?;
        }
        let room = usize::try_from(self.chunk_size - self.written).unwrap_or(usize::MAX);
        let take = room.min(buf.len());
        let file = self
            .current
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "chunk file not open"))?;
        file.write_all(&buf[..take])?;
        self.written += take as u64;
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Names of the top-level entries of `dir`.
///
/// # Errors
///
/// Returns an error if `dir` cannot be read.
pub fn list_entries(dir: &Path) -> io::Result<Vec<String>> {
    let mut entries = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

/// Archive the contents of `source` into chunk files in `out_dir`.
///
/// The entries of `source` are listed before any chunk is written, so
/// `out_dir` may be `source` itself. Returns the chunk file names in order,
/// or an empty list if `source` is empty.
///
/// # Errors
///
/// Returns an error if a file cannot be read or a chunk cannot be written.
pub fn archive_directory(
    source: &Path,
    out_dir: &Path,
    archive_name: &str,
    chunk_size: u64,
) -> Result<Vec<String>, TransferError> {
    let entries = list_entries(source)?;
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let writer = ChunkWriter::new(out_dir, archive_name, chunk_size);
    let mut builder = tar::Builder::new(GzEncoder::new(writer, Compression::best()));
    builder.follow_symlinks(false);

    for entry in &entries {
        let path = source.join(entry);
        if path.is_dir() {
            builder.append_dir_all(entry, &path)?;
        } else {
            builder.append_path_with_name(&path, entry)?;
        }
    }

    let parts = builder.into_inner()?.finish()?.finish()?;
    debug!(entries = entries.len(), parts = parts.len(), archive = %archive_name, "Archived directory");
    Ok(parts)
}

/// Numeric suffix of a chunk file name (`out.tar.gz.12` → 12).
#[must_use]
pub fn part_index(path: &Path) -> Option<u64> {
    path.extension()?.to_str()?.parse().ok()
}

/// Reassemble chunk files in suffix order and unpack them into `dest`.
///
/// # Errors
///
/// Returns [`TransferError::Archive`] if a part has no numeric suffix or the
/// concatenated stream is not a valid archive.
pub fn extract_parts(parts: &[PathBuf], dest: &Path) -> Result<(), TransferError> {
    let mut ordered = parts
        .iter()
        .map(|p| {
            part_index(p)
                .map(|i| (i, p))
                .ok_or_else(|| TransferError::Archive(format!("not a chunk file: {}", p.display())))
        })
        .collect::<Result<Vec<_>, _>>()?;
    ordered.sort_by_key(|(index, _)| *index);

    let mut stream: Box<dyn Read> = Box::new(io::empty());
    for (_, path) in ordered {
        stream = Box::new(stream.chain(File::open(path)?));
    }

    fs::create_dir_all(dest)?;
    tar::Archive::new(GzDecoder::new(stream))
        .unpack(dest)
        .map_err(|e| TransferError::Archive(e.to_string()))?;
    debug!(parts = parts.len(), dest = %dest.display(), "Extracted archive");
    Ok(())
}

/// [`archive_directory`] on the blocking pool.
///
/// # Errors
///
/// See [`archive_directory`].
pub async fn archive_directory_async(
    source: PathBuf,
    out_dir: PathBuf,
    archive_name: String,
    chunk_size: u64,
) -> Result<Vec<String>, TransferError> {
    tokio::task::spawn_blocking(move || {
        archive_directory(&source, &out_dir, &archive_name, chunk_size)
    })
    .await
    .map_err(|e| TransferError::Archive(e.to_string()))?
}

/// [`extract_parts`] on the blocking pool.
///
/// # Errors
///
/// See [`extract_parts`].
pub async fn extract_parts_async(parts: Vec<PathBuf>, dest: PathBuf) -> Result<(), TransferError> {
    tokio::task::spawn_blocking(move || extract_parts(&parts, &dest))
        .await
        .map_err(|e| TransferError::Archive(e.to_string()))?
}
