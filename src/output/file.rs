use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Error, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::output::Output;
use crate::record::Message;

/// Appends all messages to a single file.
///
/// Writes are buffered; the buffer is flushed when the destination is
/// stopped or the dispatcher flushes. Rotation, retention and compression
/// policies belong to an external output built on top of this one.
pub struct FileOutput {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
}

impl FileOutput {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<FileOutput, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().append(true).create(true).open(&path)?;

        Ok(FileOutput {
            path,
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Output for FileOutput {
    fn write(&self, message: &Message) -> Result<(), Error> {
        self.file.lock().write_all(message.text().as_bytes())
    }

    fn stop(&self) -> Result<(), Error> {
        self.file.lock().flush()
    }

    fn complete(&self) -> Result<(), Error> {
        self.file.lock().flush()
    }
}
