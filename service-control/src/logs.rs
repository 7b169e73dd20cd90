use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use insightwatch_core::CoreError;

/// Reads the tail of the daemon log and, when following, what is appended after.
pub struct LogTail {
    path: PathBuf,
    offset: u64,
}

impl LogTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last `count` lines; positions the follow cursor at end of file.
    pub fn last_lines(&mut self, count: usize) -> Result<Vec<String>, CoreError> {
        let contents = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        self.offset = contents.len() as u64;

        let text = String::from_utf8_lossy(&contents);
        let lines: Vec<&str> = text.lines().collect();
        let skip = lines.len().saturating_sub(count);
        Ok(lines[skip..].iter().map(|l| l.to_string()).collect())
    }

    /// Text appended since the previous call. A truncated file is read from the start.
    pub fn read_new(&mut self) -> Result<String, CoreError> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();
        if len < self.offset {
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(String::new());
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        file.read_to_end(&mut buf)?;
        self.offset += buf.len() as u64;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
