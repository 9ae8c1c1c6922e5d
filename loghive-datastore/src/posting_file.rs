//! Streaming artifact writer for the second pass of the large index
//! builders (token, json).
//!
//! The final file size is known after the counting pass, so the writer
//! pre-allocates a temp file, maps it read-write and lets the builder
//! write each position directly at its computed offset. `commit` unmaps
//! and atomically renames the temp file over the final name; an aborted
//! build leaves only the temp file, which the sweep removes.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::file_formats::tmp_path;

pub struct PostingFileWriter {
    _file: File,
    filename: PathBuf,
    tmp_filename: PathBuf,
    size: usize,
    data: *mut u8,
}

// `data` is mmap()ed which cannot be thread-local so should be sendable
unsafe impl Send for PostingFileWriter {}

impl Drop for PostingFileWriter {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.tmp_filename); // ignore errors
        if let Err(err) = self.unmap() {
            log::error!("unable to unmap file {:?} - {err}", self.tmp_filename);
        }
    }
}

impl PostingFileWriter {
    /// Creates `<path>.tmp` pre-sized to `size` bytes and maps it
    /// read-write.
    pub fn create(path: &Path, size: usize) -> Result<Self> {
        let tmp_filename = tmp_path(path);

        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&tmp_filename)?;

        nix::unistd::ftruncate(file.as_raw_fd(), size as i64)?;

        let data = unsafe {
            nix::sys::mman::mmap(
                None,
                std::num::NonZeroUsize::new(size).ok_or(Error::IndexTooSmall { size: 0 })?,
                nix::sys::mman::ProtFlags::PROT_READ | nix::sys::mman::ProtFlags::PROT_WRITE,
                nix::sys::mman::MapFlags::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        }? as *mut u8;

        Ok(Self {
            _file: file,
            filename: path.to_owned(),
            tmp_filename,
            size,
            data,
        })
    }

    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        if offset + bytes.len() > self.size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "write beyond artifact bounds ({} + {} > {})",
                    offset,
                    bytes.len(),
                    self.size
                ),
            )
            .into());
        }
        if self.data.is_null() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "cannot write to closed artifact file",
            )
            .into());
        }

        unsafe {
            self.data
                .add(offset)
                .copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        }

        Ok(())
    }

    pub fn write_u32_at(&mut self, offset: usize, value: u32) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    fn unmap(&mut self) -> Result<()> {
        if self.data.is_null() {
            return Ok(());
        }

        unsafe { nix::sys::mman::munmap(self.data as *mut std::ffi::c_void, self.size) }?;
        self.data = std::ptr::null_mut();

        Ok(())
    }

    /// Unmaps and atomically publishes the artifact under its final name.
    pub fn commit(mut self) -> Result<()> {
        self.unmap()?;

        if let Err(err) = std::fs::rename(&self.tmp_filename, &self.filename) {
            log::error!("atomic rename of {:?} failed - {err}", self.filename);
            return Err(err.into());
        }

        Ok(())
    }
}
