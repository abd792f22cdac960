//! Binary objects kept in an external store and addressed by chunks.
//!
//! The store only has to support bounded reads at an offset and chunk writes
//! inside a transaction. [`LargeObjects`] builds whole-object writes, ranged
//! reads and streaming on top of that.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;

use crate::body::{Blob, HttpBody};
use crate::error::{Error, Result};
use crate::range::Range;
use crate::stream::ByteStream;

/// Object identifier.
pub type Oid = u32;

/// Largest chunk read in one call, unless the store says otherwise.
pub const DEFAULT_READ_SIZE: u64 = 1024 * 1024;

#[async_trait]
pub trait LargeObjectStore: Send + Sync + 'static {
    type Transaction: LargeObjectTransaction;

    async fn begin(&self) -> Result<Self::Transaction>;

    /// Up to `length` bytes at `offset`. Fewer bytes are returned only at the
    /// end of the object.
    async fn read(&self, oid: Oid, offset: u64, length: u64) -> Result<Bytes>;

    async fn size(&self, oid: Oid) -> Result<u64>;

    async fn unlink(&self, oid: Oid) -> Result<()>;

    fn read_size(&self) -> u64 {
        DEFAULT_READ_SIZE
    }
}

/// Changes made through a transaction become visible on commit. Dropping it
/// uncommitted discards them.
#[async_trait]
pub trait LargeObjectTransaction: Send {
    /// Creates an empty object, under `oid` when given.
    async fn create(&mut self, oid: Option<Oid>) -> Result<Oid>;

    async fn write(&mut self, oid: Oid, offset: u64, data: Bytes) -> Result<()>;

    async fn unlink(&mut self, oid: Oid) -> Result<()>;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}

pub struct LargeObjects<S> {
    store: Arc<S>,
}

impl<S> Clone for LargeObjects<S> {
    fn clone(&self) -> Self {
        LargeObjects { store: self.store.clone() }
    }
}

impl<S: LargeObjectStore> LargeObjects<S> {
    pub fn new(store: S) -> Self {
        LargeObjects { store: Arc::new(store) }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Stores `body` as one object and returns its id. With an `oid` the
    /// existing object is replaced. Nothing is kept if any step fails.
    pub async fn write(&self, body: impl Into<HttpBody>, oid: Option<Oid>) -> Result<Oid> {
        let mut data = body.into().stream(None)?;
        let mut transaction = self.store.begin().await?;

        match write_object(&mut transaction, &mut data, oid).await {
            Ok(oid) => {
                transaction.commit().await?;
                tracing::debug!(oid, "large object written");
                Ok(oid)
            }
            Err(e) => {
                if let Err(rollback) = transaction.rollback().await {
                    tracing::warn!(error = %rollback, "large object rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Reads the selected window into memory.
    pub async fn read(&self, oid: Oid, range: Option<&Range>) -> Result<Bytes> {
        let size = self.store.size(oid).await?;
        let range = range.cloned().unwrap_or_default().create_range(Some(size))?;
        let length = range.length().unwrap_or(0);

        if length > self.store.read_size() {
            return read_window(self.store.clone(), oid, range).collect_bytes().await.map_err(Error::from_io);
        }

        let data = self.store.read(oid, range.offset(), length).await?;
        if data.len() as u64 != length {
            return Err(integrity_error(oid, data.len() as u64, length));
        }

        Ok(data)
    }

    pub async fn size(&self, oid: Oid) -> Result<u64> {
        self.store.size(oid).await
    }

    pub async fn unlink(&self, oid: Oid) -> Result<()> {
        self.store.unlink(oid).await
    }

    /// Streams the selected window in bounded reads. A relative range is
    /// resolved against the object size on first poll.
    ///
    /// The stream fails if the object holds less data than the window needs.
    pub fn read_stream(&self, oid: Oid, range: Option<Range>) -> ByteStream {
        let range = range.unwrap_or_default();
        let size = range.has_content_length().then(|| range.length().unwrap_or(0));
        read_window(self.store.clone(), oid, range).with_size(size)
    }

    /// A body source over the object.
    pub async fn blob(&self, oid: Oid) -> Result<LargeObjectBlob<S>> {
        let size = self.store.size(oid).await?;
        Ok(LargeObjectBlob { store: self.store.clone(), oid, size, content_type: None, last_modified: None })
    }
}

async fn write_object<T: LargeObjectTransaction>(transaction: &mut T, data: &mut ByteStream, oid: Option<Oid>) -> Result<Oid> {
    if let Some(oid) = oid {
        transaction.unlink(oid).await?;
    }

    let oid = transaction.create(oid).await?;
    let mut offset = 0;

    while let Some(chunk) = data.next().await {
        let chunk = chunk.map_err(Error::from_io)?;
        let length = chunk.len() as u64;

        transaction.write(oid, offset, chunk).await?;
        offset += length;
    }

    Ok(oid)
}

fn integrity_error(oid: Oid, read: u64, expected: u64) -> Error {
    tracing::warn!(oid, read, expected, "large object is shorter than its size");
    Error::LargeObjectIntegrity
}

fn read_window<S: LargeObjectStore>(store: Arc<S>, oid: Oid, range: Range) -> ByteStream {
    let read_size = store.read_size().max(1);

    ByteStream::new(async_stream::try_stream! {
        let range = if range.has_content_length() {
            range
        } else {
            let size = store.size(oid).await?;
            range.create_range(Some(size)).map_err(Error::from)?
        };

        let start = range.offset();
        let length = range.length().unwrap_or(0);
        let mut read = 0;

        while read < length {
            let wanted = read_size.min(length - read);
            let chunk = store.read(oid, start + read, wanted).await?;
            if chunk.is_empty() {
                break;
            }

            read += chunk.len() as u64;
            let short = (chunk.len() as u64) < wanted;
            yield chunk;

            if short {
                break;
            }
        }

        if read != length {
            Err::<(), Error>(integrity_error(oid, read, length))?;
        }
    })
}

/// A large object as a [`Blob`], sized when it was looked up.
pub struct LargeObjectBlob<S> {
    store: Arc<S>,
    oid: Oid,
    size: u64,
    content_type: Option<String>,
    last_modified: Option<SystemTime>,
}

impl<S> LargeObjectBlob<S> {
    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_last_modified(mut self, last_modified: SystemTime) -> Self {
        self.last_modified = Some(last_modified);
        self
    }
}

impl<S: LargeObjectStore> Blob for LargeObjectBlob<S> {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    fn stream(&self, range: &Range) -> Result<ByteStream> {
        let range = range.create_range(Some(self.size))?;
        let length = range.length();
        Ok(read_window(self.store.clone(), self.oid, range).with_size(length))
    }
}

#[derive(Debug, Default)]
struct Objects {
    objects: HashMap<Oid, BytesMut>,
    last_oid: Oid,
}

impl Objects {
    fn allocate(&mut self, taken: impl Fn(Oid) -> bool) -> Oid {
        loop {
            self.last_oid = self.last_oid.wrapping_add(1).max(1);
            if !self.objects.contains_key(&self.last_oid) && !taken(self.last_oid) {
                return self.last_oid;
            }
        }
    }
}

fn lock(objects: &Mutex<Objects>) -> MutexGuard<'_, Objects> {
    objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process store.
#[derive(Debug, Clone)]
pub struct MemoryLargeObjectStore {
    objects: Arc<Mutex<Objects>>,
    read_size: u64,
}

impl MemoryLargeObjectStore {
    pub fn new() -> Self {
        MemoryLargeObjectStore { objects: Arc::default(), read_size: DEFAULT_READ_SIZE }
    }

    pub fn with_read_size(mut self, read_size: u64) -> Self {
        self.read_size = read_size;
        self
    }

    pub fn len(&self) -> usize {
        lock(&self.objects).objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryLargeObjectStore {
    fn default() -> Self {
        MemoryLargeObjectStore::new()
    }
}

#[async_trait]
impl LargeObjectStore for MemoryLargeObjectStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction> {
        Ok(MemoryTransaction { objects: self.objects.clone(), staged: HashMap::new() })
    }

    async fn read(&self, oid: Oid, offset: u64, length: u64) -> Result<Bytes> {
        let objects = lock(&self.objects);
        let object = objects.objects.get(&oid).ok_or(Error::LargeObjectNotFound(oid))?;

        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(object.len());
        let end = usize::try_from(offset.saturating_add(length)).unwrap_or(usize::MAX).min(object.len());
        Ok(Bytes::copy_from_slice(&object[start..end]))
    }

    async fn size(&self, oid: Oid) -> Result<u64> {
        let objects = lock(&self.objects);
        objects.objects.get(&oid).map(|object| object.len() as u64).ok_or(Error::LargeObjectNotFound(oid))
    }

    async fn unlink(&self, oid: Oid) -> Result<()> {
        lock(&self.objects).objects.remove(&oid).map(drop).ok_or(Error::LargeObjectNotFound(oid))
    }

    fn read_size(&self) -> u64 {
        self.read_size
    }
}

/// Staged changes of a [`MemoryLargeObjectStore`]. `None` marks an unlinked
/// object.
#[derive(Debug)]
pub struct MemoryTransaction {
    objects: Arc<Mutex<Objects>>,
    staged: HashMap<Oid, Option<BytesMut>>,
}

impl MemoryTransaction {
    fn exists(&self, oid: Oid) -> bool {
        match self.staged.get(&oid) {
            Some(staged) => staged.is_some(),
            None => lock(&self.objects).objects.contains_key(&oid),
        }
    }
}

#[async_trait]
impl LargeObjectTransaction for MemoryTransaction {
    async fn create(&mut self, oid: Option<Oid>) -> Result<Oid> {
        let oid = match oid {
            Some(oid) if self.exists(oid) => return Err(Error::Store(format!("large object {oid} already exists"))),
            Some(oid) => oid,
            None => {
                let staged = &self.staged;
                lock(&self.objects).allocate(|oid| staged.contains_key(&oid))
            }
        };

        self.staged.insert(oid, Some(BytesMut::new()));
        Ok(oid)
    }

    async fn write(&mut self, oid: Oid, offset: u64, data: Bytes) -> Result<()> {
        if !self.staged.contains_key(&oid) {
            let committed = lock(&self.objects).objects.get(&oid).cloned();
            self.staged.insert(oid, committed);
        }

        let object = self
            .staged
            .get_mut(&oid)
            .and_then(Option::as_mut)
            .ok_or(Error::LargeObjectNotFound(oid))?;

        let start = usize::try_from(offset).map_err(|_| Error::Store(format!("offset {offset} is too large")))?;
        let end = start + data.len();
        if object.len() < end {
            object.resize(end, 0);
        }
        object[start..end].copy_from_slice(&data);

        Ok(())
    }

    async fn unlink(&mut self, oid: Oid) -> Result<()> {
        if !self.exists(oid) {
            return Err(Error::LargeObjectNotFound(oid));
        }

        self.staged.insert(oid, None);
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        let mut objects = lock(&self.objects);

        for (oid, object) in self.staged {
            match object {
                Some(object) => objects.objects.insert(oid, object),
                None => objects.objects.remove(&oid),
            };
        }

        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        tracing::trace!(staged = self.staged.len(), "discarding large object changes");
        Ok(())
    }
}
