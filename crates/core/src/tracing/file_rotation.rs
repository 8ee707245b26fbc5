use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Result as IoResult, Write};
use std::path::PathBuf;

use crate::tracing::config::LogFileConfig;

/// Size-based rolling file appender that rotates logs when they exceed a configured size.
///
/// This appender creates log files with the pattern: `{prefix}.log`, `{prefix}.1.log`, etc.
/// When the current log file exceeds the size limit:
/// 1. Current file is closed
/// 2. Existing files are rotated: the oldest is deleted, `.1.log` -> `.2.log`, etc.
/// 3. Current file becomes .1.log
/// 4. New current file is created
///
/// Only keeps up to `max_files` total files. The appender is owned by the
/// non-blocking writer's worker thread, so it needs no locking of its own.
#[derive(Debug)]
pub struct SizeBasedAppender {
    directory: PathBuf,
    file_prefix: String,
    max_size_bytes: u64,
    max_files: usize,
    current: Option<BufWriter<File>>,
    current_size: u64,
}

impl SizeBasedAppender {
    /// Create a new size-based appender, creating `directory` if needed
    pub fn new(
        directory: PathBuf,
        file_prefix: String,
        max_size_mb: u64,
        max_files: usize,
    ) -> IoResult<Self> {
        std::fs::create_dir_all(&directory)?;

        let current_path = directory.join(format!("{file_prefix}.log"));
        let current_size = match current_path.metadata() {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };

        Ok(Self {
            directory,
            file_prefix,
            max_size_bytes: max_size_mb.saturating_mul(1024 * 1024),
            max_files: max_files.max(1),
            current: None,
            current_size,
        })
    }

    pub fn from_config(config: &LogFileConfig) -> IoResult<Self> {
        Self::new(
            config.directory.clone(),
            config.file_prefix.clone(),
            config.max_file_size_mb,
            config.max_files,
        )
    }

    /// Override the rotation threshold with an exact byte count
    pub fn with_max_size_bytes(mut self, max_size_bytes: u64) -> Self {
        self.max_size_bytes = max_size_bytes;
        self
    }

    fn path(&self, index: usize) -> PathBuf {
        if index == 0 {
            self.directory.join(format!("{}.log", self.file_prefix))
        } else {
            self.directory
                .join(format!("{}.{index}.log", self.file_prefix))
        }
    }

    fn rotate(&mut self) -> IoResult<()> {
        if let Some(mut writer) = self.current.take() {
            writer.flush()?;
        }

        for i in (1..self.max_files).rev() {
            let old_path = self.path(i);
            if !old_path.exists() {
                continue;
            }
            if i + 1 >= self.max_files {
                std::fs::remove_file(old_path)?;
            } else {
                std::fs::rename(old_path, self.path(i + 1))?;
            }
        }

        let current_path = self.path(0);
        if current_path.exists() {
            if self.max_files > 1 {
                std::fs::rename(current_path, self.path(1))?;
            } else {
                std::fs::remove_file(current_path)?;
            }
        }

        self.current_size = 0;
        Ok(())
    }

    fn writer(&mut self) -> IoResult<&mut BufWriter<File>> {
        if self.current.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path(0))?;
            self.current = Some(BufWriter::new(file));
        }
        self.current
            .as_mut()
            .ok_or_else(|| std::io::Error::other("log file not open"))
    }
}

impl Write for SizeBasedAppender {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        if self.current_size > 0 && self.current_size >= self.max_size_bytes {
            self.rotate()?;
        }

        let writer = self.writer()?;
        let written = writer.write(buf)?;
        writer.flush()?;

        self.current_size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> IoResult<()> {
        match self.current.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}
