use std::{
    fs::File,
    io::{self, Write},
    path::Path,
};

use tempfile::{Builder, TempPath};

use crate::{
    alloc::{HostBuf, SharedAllocator},
    internal::capture::read_to_fill,
};

const TEMP_PREFIX: &str = "exifbox_";

/// Extension of `filename` including the leading dot, if it has one.
///
/// A leading dot alone (`.hidden`) is a name, not an extension.
pub fn suffix_of(filename: &str) -> Option<&str> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let dot = name.rfind('.')?;
    (dot > 0 && dot + 1 < name.len()).then(|| &name[dot..])
}

/// Write `bytes` to a fresh file under `dir`, keeping `suffix` so the guest's
/// format sniffing still works. The file is removed when the path drops.
pub fn spill(dir: &Path, bytes: &[u8], suffix: Option<&str>) -> io::Result<TempPath> {
    let mut file = Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(suffix.unwrap_or(""))
        .tempfile_in(dir)?;
    // On error the NamedTempFile drops and takes the partial file with it.
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file.into_temp_path())
}

/// Reserve a unique output path under `dir` without leaving a file behind.
///
/// The guest refuses to write over an existing file, so only the name is
/// kept. The path is still removed on drop if the guest created it.
pub fn reserve_output(dir: &Path, suffix: Option<&str>) -> io::Result<TempPath> {
    let path = Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(suffix.unwrap_or(""))
        .tempfile_in(dir)?
        .into_temp_path();
    std::fs::remove_file(&path)?;
    Ok(path)
}

/// Read a whole file into a host buffer.
pub fn read_back(path: &Path, alloc: &SharedAllocator) -> io::Result<HostBuf> {
    let mut file = File::open(path)?;
    let size = usize::try_from(file.metadata()?.len())
        .map_err(|_| io::Error::new(io::ErrorKind::FileTooLarge, "output file too large"))?;
    let mut buf = HostBuf::zeroed(alloc, size)
        .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "host allocation failed"))?;
    let filled = read_to_fill(&mut file, buf.as_mut_slice())?;
    buf.truncate(filled);
    Ok(buf)
}
