use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use futures::{stream, TryStreamExt};
use tokio::fs::File;

use crate::body::Blob;
use crate::error::{Error, Result};
use crate::range::Range;
use crate::stream::{ByteStream, RangedStream};

/// What is known about a file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// Not looked at yet.
    Unknown,
    Absent,
    Present { size: u64, modified: Option<SystemTime> },
}

/// A file served by path, opened lazily when its contents are streamed.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    name: Option<String>,
    content_type: Option<String>,
    state: FileState,
}

impl FileSource {
    /// The content type is guessed from the extension.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.file_name().map(|name| name.to_string_lossy().into_owned());
        let content_type = mime_guess::from_path(&path).first_raw().map(str::to_owned);

        FileSource { path, name, content_type, state: FileState::Unknown }
    }

    /// Creates the source and resolves its state.
    pub async fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let mut file = FileSource::new(path);
        file.stat().await?;
        Ok(file)
    }

    /// Looks the file up on disk. A missing file, or a path that is not a
    /// regular file, is [`FileState::Absent`]; other failures are errors.
    pub async fn stat(&mut self) -> io::Result<FileState> {
        self.state = match tokio::fs::metadata(&self.path).await {
            Ok(meta) if meta.is_file() => FileState::Present { size: meta.len(), modified: meta.modified().ok() },
            Ok(_) => FileState::Absent,
            Err(e) if e.kind() == io::ErrorKind::NotFound => FileState::Absent,
            Err(e) => return Err(e),
        };

        Ok(self.state)
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    /// `None` until [`stat`](Self::stat) has run.
    pub fn exists(&self) -> Option<bool> {
        match self.state {
            FileState::Unknown => None,
            FileState::Absent => Some(false),
            FileState::Present { .. } => Some(true),
        }
    }
}

impl Blob for FileSource {
    fn size(&self) -> Option<u64> {
        match self.state {
            FileState::Present { size, .. } => Some(size),
            _ => None,
        }
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn last_modified(&self) -> Option<SystemTime> {
        match self.state {
            FileState::Present { modified, .. } => modified,
            _ => None,
        }
    }

    /// Opens the file on first poll. Without a known size the range is
    /// resolved against the size of the opened file.
    fn stream(&self, range: &Range) -> Result<ByteStream> {
        let path = self.path.clone();

        let (window, size) = match self.size() {
            Some(size) => {
                let resolved = range.create_range(Some(size))?;
                let length = resolved.length().unwrap_or(0);
                (Ok((resolved.offset(), length)), Some(length))
            }
            None => (Err(range.clone()), None),
        };

        if size == Some(0) {
            return Ok(self.typed(ByteStream::empty()));
        }

        let opened = stream::once(async move {
            let file = File::open(&path).await?;

            let (start, length) = match window {
                Ok(window) => window,
                Err(range) => {
                    let size = file.metadata().await?.len();
                    let resolved = range.create_range(Some(size)).map_err(io::Error::other)?;
                    (resolved.offset(), resolved.length().unwrap_or(0))
                }
            };

            tracing::trace!(path = %path.display(), start, length, "streaming file");
            Ok::<_, io::Error>(RangedStream::new(file, start, length))
        })
        .try_flatten();

        Ok(self.typed(ByteStream::new(opened).with_size(size)))
    }
}

impl FileSource {
    fn typed(&self, stream: ByteStream) -> ByteStream {
        let stream = match &self.content_type {
            Some(content_type) => stream.with_content_type(content_type.clone()),
            None => stream,
        };

        match &self.name {
            Some(name) => stream.with_name(name.clone()),
            None => stream,
        }
    }

    /// Reads the selected window into memory.
    pub async fn read(&self, range: &Range) -> Result<bytes::Bytes> {
        self.stream(range)?.collect_bytes().await.map_err(Error::from_io)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::range::RangeSpec;
    use crate::stream::StreamMeta;
    use crate::tmp::TmpFile;

    async fn digits() -> TmpFile {
        let tmp = TmpFile::new().with_extension("txt");
        tokio::fs::write(tmp.path(), b"0123456789").await.unwrap();
        tmp
    }

    #[tokio::test]
    async fn test_stat() {
        let tmp = digits().await;

        let file = FileSource::open(tmp.path()).await.unwrap();
        assert_matches::assert_matches!(file.state(), FileState::Present { size: 10, .. });
        assert_eq!(file.content_type(), Some("text/plain"));
        assert!(file.last_modified().is_some());

        let missing = FileSource::open(tmp.path().with_extension("missing")).await.unwrap();
        assert_eq!(missing.state(), FileState::Absent);
        assert_eq!(missing.exists(), Some(false));

        assert_eq!(FileSource::new(tmp.path()).exists(), None);
    }

    // every start/end combination must read like a slice of the content
    #[tokio::test]
    async fn test_slices() {
        let tmp = digits().await;
        let file = FileSource::open(tmp.path()).await.unwrap();
        let unknown = FileSource::new(tmp.path());

        let offsets = [None, Some(0), Some(1), Some(3), Some(-3), Some(-7), Some(-8), Some(80)];
        let resolve = |offset: i64| if offset < 0 { (10 + offset).max(0) as usize } else { (offset as usize).min(10) };

        for start in offsets {
            for end in offsets {
                let range = RangeSpec { start, end, ..RangeSpec::default() }.build().unwrap();

                let from = start.map_or(0, resolve);
                let to = end.map_or(10, resolve).max(from);
                let expected = Bytes::copy_from_slice(&b"0123456789"[from..to]);

                let stream = file.stream(&range).unwrap();
                assert_eq!(stream.size(), Some(expected.len() as u64), "{start:?}..{end:?}");
                assert_eq!(stream.collect_bytes().await.unwrap(), expected, "{start:?}..{end:?}");

                assert_eq!(unknown.read(&range).await.unwrap(), expected, "unknown size {start:?}..{end:?}");
            }
        }
    }

    #[tokio::test]
    async fn test_missing_file_fails_on_read() {
        let file = FileSource::new("/nonexistent/file.bin");
        let err = file.read(&Range::full()).await.unwrap_err();
        assert_matches::assert_matches!(err, Error::Io(e) if e.kind() == io::ErrorKind::NotFound);
    }
}
