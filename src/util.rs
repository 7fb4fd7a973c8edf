use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use atomic_write_file::AtomicWriteFile;

use crate::constants::VECTOR_FILE_EXTENSION;
use crate::error::{ArchiveError, Result};

/// Write a file through a temporary sibling and rename it into place.
pub(crate) fn write_atomic<F>(path: &Path, write_fn: F) -> Result<()>
where
    F: FnOnce(&mut File) -> Result<()>,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|err| ArchiveError::io_at(err, parent))?;
    }
    let mut options = AtomicWriteFile::options();
    options.read(false);
    let mut atomic = options
        .open(path)
        .map_err(|err| ArchiveError::io_at(err, path))?;

    let file = atomic.as_file_mut();
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write_fn(file)?;
    file.flush()?;
    file.sync_all()?;
    atomic
        .commit()
        .map_err(|err| ArchiveError::io_at(err, path))?;
    Ok(())
}

pub(crate) fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    write_atomic(path, |file| Ok(file.write_all(bytes)?))
}

/// Path of the vector engine file that sits next to an index document.
#[must_use]
pub fn vector_path(index_path: &Path) -> PathBuf {
    index_path.with_extension(VECTOR_FILE_EXTENSION)
}
