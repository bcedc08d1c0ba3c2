//! Console capture store
//!
//! Local, append-only, binary-safe mirror of a remote console. Offsets
//! into this file are what detection contexts track; the file keeps
//! growing across console generations so those offsets stay valid.

use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the capture file for a console of a target
///
/// Reports reference captures by this name, so it must not change.
pub fn capture_file_name(role: &str, id: &str, console: &str) -> String {
    format!("console-{role}.{id}.{console}.txt")
}

/// Append-only capture file
///
/// File system work runs on the blocking pool so a slow disk never
/// stalls the waiters sharing the runtime.
#[derive(Debug)]
pub struct CaptureStore {
    path: PathBuf,
    file: Arc<File>,
    len: u64,
}

impl CaptureStore {
    /// Create a fresh capture, replacing any file left at `path`
    pub async fn create(path: &Path) -> io::Result<Self> {
        let path = path.to_path_buf();
        let open_path = path.clone();
        let file = tokio::task::spawn_blocking(move || {
            match std::fs::remove_file(&open_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            OpenOptions::new()
                .create(true)
                .append(true)
                .read(true)
                .open(&open_path)
        })
        .await
        .map_err(io::Error::other)??;
        Ok(Self {
            path,
            file: Arc::new(file),
            len: 0,
        })
    }

    /// Append bytes at the end, synced to disk on return
    pub async fn append(&mut self, data: Bytes) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let len = data.len() as u64;
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || {
            let mut writer: &File = &file;
            writer.write_all(&data)?;
            writer.sync_data()
        })
        .await
        .map_err(io::Error::other)??;
        self.len += len;
        Ok(())
    }

    /// Bytes captured so far
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Nothing captured yet
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the capture file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read `[from, to)` from a capture file
///
/// Uses its own file handle; readers never share a file position with
/// the writer or each other.
pub fn read_range(path: &Path, from: u64, to: u64) -> io::Result<Vec<u8>> {
    if to <= from {
        return Ok(Vec::new());
    }
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(from))?;
    let mut data = Vec::with_capacity((to - from) as usize);
    file.take(to - from).read_to_end(&mut data)?;
    Ok(data)
}

/// A range of a capture file, read lazily
///
/// Cheap to clone and hand around in reports; every call to
/// [`CaptureSlice::lines`] starts over from the beginning of the range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureSlice {
    path: PathBuf,
    from: u64,
    to: u64,
}

impl CaptureSlice {
    /// Range `[from, to)` of the capture at `path`
    pub fn new(path: &Path, from: u64, to: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            from,
            to: to.max(from),
        }
    }

    /// Capture file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start offset
    pub fn from(&self) -> u64 {
        self.from
    }

    /// End offset (exclusive)
    pub fn to(&self) -> u64 {
        self.to
    }

    /// Number of bytes in the range
    pub fn len(&self) -> u64 {
        self.to - self.from
    }

    /// Empty range
    pub fn is_empty(&self) -> bool {
        self.to == self.from
    }

    /// Read the whole range
    pub fn read(&self) -> io::Result<Vec<u8>> {
        read_range(&self.path, self.from, self.to)
    }

    /// Read the whole range as lossy UTF-8
    pub fn text(&self) -> io::Result<String> {
        Ok(String::from_utf8_lossy(&self.read()?).into_owned())
    }

    /// Iterate over the lines in the range, as lossy UTF-8
    ///
    /// A missing capture file yields no lines.
    pub fn lines(&self) -> io::Result<CaptureLines> {
        let reader = match File::open(&self.path) {
            Ok(mut file) => {
                file.seek(SeekFrom::Start(self.from))?;
                Some(BufReader::new(file.take(self.len())))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };
        Ok(CaptureLines { reader })
    }
}

/// Line iterator over a [`CaptureSlice`]
pub struct CaptureLines {
    reader: Option<BufReader<io::Take<File>>>,
}

impl Iterator for CaptureLines {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => None,
            Ok(_) => Some(Ok(String::from_utf8_lossy(&line).into_owned())),
            Err(e) => Some(Err(e)),
        }
    }
}
