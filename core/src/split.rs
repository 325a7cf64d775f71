//! Reading and writing a byte stream chunked across numbered segment files
//! (`<prefix>.0`, `<prefix>.1`, ...).

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default maximum segment size, 1 GiB.
pub const DEFAULT_SPLIT_SIZE: u64 = 1024 * 1024 * 1024;

/// Reads an ordered list of segment files as one stream.
pub struct SplitReader {
    files: Vec<PathBuf>,
    next: usize,
    current: Option<File>,
}

impl SplitReader {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self {
            files,
            next: 0,
            current: None,
        }
    }
}

impl Read for SplitReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.current.is_none() {
                let Some(path) = self.files.get(self.next) else {
                    return Ok(0);
                };
                self.current = Some(File::open(path)?);
                self.next += 1;
            }
            if let Some(file) = self.current.as_mut() {
                let n = file.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
            }
            self.current = None;
        }
    }
}

/// Writes a stream into `<dir>/<prefix>.<n>` files of at most `max_size` bytes.
pub struct SplitWriter {
    dir: PathBuf,
    prefix: String,
    max_size: u64,
    written: u64,
    current: Option<File>,
    files: Vec<PathBuf>,
}

impl SplitWriter {
    pub fn new<P: AsRef<Path>>(dir: P, prefix: impl Into<String>, max_size: u64) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            prefix: prefix.into(),
            max_size: max_size.max(1),
            written: 0,
            current: None,
            files: Vec::new(),
        }
    }

    pub fn segment_name(prefix: &str, index: usize) -> String {
        format!("{}.{}", prefix, index)
    }

    fn open_next(&mut self) -> io::Result<()> {
        let path = self.dir.join(Self::segment_name(&self.prefix, self.files.len()));
        debug!("Opening segment {}", path.display());
        self.current = Some(File::create(&path)?);
        self.files.push(path);
        self.written = 0;
        Ok(())
    }

    /// Flushes the last segment and returns every segment path, in order.
    pub fn finish(mut self) -> io::Result<Vec<PathBuf>> {
        if let Some(file) = self.current.take() {
            file.sync_all()?;
        }
        Ok(std::mem::take(&mut self.files))
    }
}

impl Write for SplitWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.current.is_none() || self.written >= self.max_size {
            if let Some(file) = self.current.take() {
                file.sync_all()?;
            }
            self.open_next()?;
        }
        let room = (self.max_size - self.written).min(buf.len() as u64) as usize;
        let n = match self.current.as_mut() {
            Some(file) => file.write(&buf[..room])?,
            None => return Err(io::Error::other("no open segment")),
        };
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Sorts segment paths by their numeric suffix, so `.10` follows `.9`.
pub fn sort_segments(files: &mut [PathBuf]) {
    fn index(path: &Path) -> (String, u64) {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        match name.rsplit_once('.') {
            Some((stem, suffix)) => match suffix.parse() {
                Ok(n) => (stem.to_string(), n),
                Err(_) => (name, 0),
            },
            None => (name, 0),
        }
    }
    files.sort_by_key(|p| index(p));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_and_rejoin() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 256) as u8).collect();

        let mut writer = SplitWriter::new(dir.path(), "data0.tar.gz", 1000);
        writer.write_all(&data).unwrap();
        let files = writer.finish().unwrap();

        assert_eq!(files.len(), 3);
        assert_eq!(files[0].file_name().unwrap(), "data0.tar.gz.0");
        assert_eq!(std::fs::metadata(&files[0]).unwrap().len(), 1000);
        assert_eq!(std::fs::metadata(&files[2]).unwrap().len(), 500);

        let mut rejoined = Vec::new();
        SplitReader::new(files).read_to_end(&mut rejoined).unwrap();
        assert_eq!(rejoined, data);
    }

    #[test]
    fn test_exact_multiple_does_not_leave_empty_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SplitWriter::new(dir.path(), "source.tar.gz", 10);
        writer.write_all(&[1u8; 20]).unwrap();
        assert_eq!(writer.finish().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_segment_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = SplitReader::new(vec![dir.path().join("nope.0")]);
        let mut buf = Vec::new();
        assert!(reader.read_to_end(&mut buf).is_err());
    }

    #[test]
    fn test_sort_segments_numeric() {
        let mut files: Vec<PathBuf> = ["x.10", "x.2", "x.0", "x.1"].iter().map(PathBuf::from).collect();
        sort_segments(&mut files);
        let names: Vec<_> = files.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        assert_eq!(names, ["x.0", "x.1", "x.2", "x.10"]);
    }
}
