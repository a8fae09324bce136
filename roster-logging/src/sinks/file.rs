use super::{LogSink, SinkError};
use crate::formatter::FormattedRecord;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Append-only JSON-lines file with size based rotation.
///
/// Rotated generations are `<file>.1` (newest) to `<file>.<max_files>`.
pub struct RotatingFileSink {
    path: PathBuf,
    max_size: Option<u64>,
    max_files: usize,
    state: Mutex<FileState>,
}

struct FileState {
    writer: BufWriter<File>,
    current_size: u64,
}

impl RotatingFileSink {
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let (writer, current_size) = open_append(&path)?;

        Ok(Self {
            path,
            max_size: None,
            max_files: 1,
            state: Mutex::new(FileState {
                writer,
                current_size,
            }),
        })
    }

    /// Rotate once the active file would grow past `max_size` bytes, keeping
    /// `max_files` previous generations (at least one).
    pub fn with_rotation(mut self, max_size: u64, max_files: usize) -> Self {
        self.max_size = Some(max_size);
        self.max_files = max_files.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of rotated generation `n` (1 is the most recent)
    pub fn generation_path(&self, n: usize) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}", n));
        self.path.with_file_name(name)
    }

    fn rotate_locked(&self, state: &mut FileState) -> std::io::Result<()> {
        state.writer.flush()?;

        let oldest = self.generation_path(self.max_files);
        if oldest.exists() {
            std::fs::remove_file(&oldest)?;
        }
        for n in (1..self.max_files).rev() {
            let from = self.generation_path(n);
            if from.exists() {
                std::fs::rename(&from, self.generation_path(n + 1))?;
            }
        }
        std::fs::rename(&self.path, self.generation_path(1))?;

        let (writer, current_size) = open_append(&self.path)?;
        state.writer = writer;
        state.current_size = current_size;

        tracing::debug!(path = %self.path.display(), "Rotated log file");
        Ok(())
    }
}

fn open_append(path: &Path) -> std::io::Result<(BufWriter<File>, u64)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let current_size = file.metadata()?.len();
    Ok((BufWriter::new(file), current_size))
}

impl LogSink for RotatingFileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    fn write(&self, record: &FormattedRecord) -> Result<(), SinkError> {
        let mut line = record.to_line();
        line.push('\n');
        let bytes = line.as_bytes();

        let mut state = self.state.lock();

        // Size check, rotation and the write share one critical section
        if let Some(max_size) = self.max_size {
            if state.current_size > 0 && state.current_size + bytes.len() as u64 > max_size {
                self.rotate_locked(&mut state)?;
            }
        }

        state.writer.write_all(bytes)?;
        state.writer.flush()?;
        state.current_size += bytes.len() as u64;
        Ok(())
    }

    fn flush(&self) -> Result<(), SinkError> {
        self.state.lock().writer.flush()?;
        Ok(())
    }

    fn rotate(&self) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        if state.current_size > 0 {
            self.rotate_locked(&mut state)?;
        }
        Ok(())
    }
}
