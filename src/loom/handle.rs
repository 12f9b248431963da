use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytemuck::Pod;
use derive_more::{Deref, Display};
use rustc_hash::FxHashSet as HashSet;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{
    comm::Tag,
    num::{DataType, Scalar},
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct HandleId(uid::Id<HandleId>);

/// Contiguous memory behind a data handle.
pub trait Storage: Send + Sync {
    fn as_bytes(&self) -> &[u8];
    fn as_bytes_mut(&mut self) -> &mut [u8];
}

impl<T: Pod + Send + Sync> Storage for Vec<T> {
    #[inline]
    fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self)
    }

    #[inline]
    fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(self)
    }
}

type Slot = Option<Box<dyn Storage>>;

fn alloc_zeroed<T: Scalar>(nelems: usize) -> Box<dyn Storage> {
    Box::new(vec![T::zeroed(); nelems])
}

/// Coherence state of a handle as seen by the local rank.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum HandleState {
    /// Never written on the owner, or no valid copy on a non-owner.
    #[default]
    Uninitialized,
    /// Written on the owner since the last flush.
    LocalValid,
    /// Flushed on the owner: no remote copy is outstanding.
    GloballyVisible,
    /// A non-owner holds a copy received from the owner.
    RemoteCached,
}

#[derive(Debug, Default)]
struct Coherence {
    state: HandleState,
    /// Ranks the owner has sent the current value to.
    sent: HashSet<usize>,
}

struct HandleInner {
    id: HandleId,
    tag: Option<Tag>,
    owner: usize,
    r#type: DataType,
    nelems: usize,
    alloc: fn(usize) -> Box<dyn Storage>,
    data: RwLock<Slot>,
    coherence: Mutex<Coherence>,
}

impl std::fmt::Debug for HandleInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataHandle")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("owner", &self.owner)
            .field("type", &self.r#type)
            .field("nelems", &self.nelems)
            .finish_non_exhaustive()
    }
}

/// Opaque, refcounted handle to the buffer of one tile.
///
/// Memory is materialised on first local access. Raw data is only reachable through
/// the runtime: inside a codelet, or through a scoped accessor.
#[derive(Debug, Clone)]
pub struct DataHandle(Arc<HandleInner>);

impl PartialEq for DataHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for DataHandle {}

impl DataHandle {
    pub(crate) fn new<T: Scalar>(nelems: usize, owner: usize, tag: Option<Tag>) -> Self {
        Self(Arc::new(HandleInner {
            id: HandleId(uid::Id::new()),
            tag,
            owner,
            r#type: T::DATA_TYPE,
            nelems,
            alloc: alloc_zeroed::<T>,
            data: RwLock::new(None),
            coherence: Default::default(),
        }))
    }

    /// Wraps an existing buffer; its first `nelems` elements back the handle.
    pub(crate) fn from_vec<T: Scalar>(data: Vec<T>, nelems: usize, owner: usize) -> Self {
        let coherence = Coherence {
            state: HandleState::LocalValid,
            ..Default::default()
        };
        let data: Box<dyn Storage> = Box::new(data);
        Self(Arc::new(HandleInner {
            id: HandleId(uid::Id::new()),
            tag: None,
            owner,
            r#type: T::DATA_TYPE,
            nelems,
            alloc: alloc_zeroed::<T>,
            data: RwLock::new(Some(data)),
            coherence: Mutex::new(coherence),
        }))
    }

    #[inline]
    pub fn id(&self) -> HandleId {
        self.0.id
    }

    #[inline]
    pub fn tag(&self) -> Option<Tag> {
        self.0.tag
    }

    /// Rank that owns the valid copy of the data.
    #[inline]
    pub fn owner(&self) -> usize {
        self.0.owner
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.0.r#type
    }

    #[inline]
    pub fn nelems(&self) -> usize {
        self.0.nelems
    }

    /// Size of the data in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.nelems * self.0.r#type.size()
    }

    #[inline]
    pub fn state(&self) -> HandleState {
        self.coherence().state
    }

    /// Returns `true` if memory is allocated on this rank.
    #[inline]
    pub fn is_materialized(&self) -> bool {
        self.0.data.read().expect("failed to lock").is_some()
    }

    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    fn coherence(&self) -> std::sync::MutexGuard<'_, Coherence> {
        self.0.coherence.lock().expect("failed to lock")
    }

    fn materialize(&self) {
        // shared readers may hold the lock already
        if self.is_materialized() {
            return;
        }
        let mut data = self.0.data.write().expect("failed to lock");
        if data.is_none() {
            *data = Some((self.0.alloc)(self.0.nelems));
        }
    }

    /// Locks the buffer for reading, allocating it first if needed.
    pub(crate) fn lock_read(&self) -> BufferGuard<'_> {
        self.materialize();
        let lock = Lock::Read(self.0.data.read().expect("failed to lock"));
        let size = self.size();
        BufferGuard { lock, size }
    }

    /// Locks the buffer for writing, allocating it first if needed.
    pub(crate) fn lock_write(&self) -> BufferGuard<'_> {
        self.materialize();
        let lock = Lock::Write(self.0.data.write().expect("failed to lock"));
        let size = self.size();
        BufferGuard { lock, size }
    }

    /// Releases the local memory.
    pub(crate) fn evict(&self) {
        *self.0.data.write().expect("failed to lock") = None;
    }

    pub(crate) fn mark_written(&self) {
        self.coherence().state = HandleState::LocalValid;
    }

    pub(crate) fn mark_cached(&self) {
        self.coherence().state = HandleState::RemoteCached;
    }

    /// Records that the owner sends its value to `rank`.
    /// Returns `false` if the rank already holds the current value.
    pub(crate) fn mark_sent(&self, rank: usize) -> bool {
        self.coherence().sent.insert(rank)
    }

    /// Forgets every remote copy. Returns `true` if a locally cached copy was dropped.
    pub(crate) fn flush(&self, rank: usize) -> bool {
        let mut coherence = self.coherence();
        match rank == self.0.owner {
            true => {
                coherence.sent.clear();
                if coherence.state == HandleState::LocalValid {
                    coherence.state = HandleState::GloballyVisible;
                }
                false
            }
            false => {
                let cached = coherence.state == HandleState::RemoteCached;
                coherence.state = HandleState::Uninitialized;
                cached
            }
        }
    }
}

enum Lock<'a> {
    Read(RwLockReadGuard<'a, Slot>),
    Write(RwLockWriteGuard<'a, Slot>),
    Scratch(Box<[u64]>),
}

/// Locked view of one buffer of a running task.
pub struct BufferGuard<'a> {
    lock: Lock<'a>,
    size: usize,
}

impl BufferGuard<'static> {
    /// Temporary zeroed memory of `size` bytes, aligned for any element type.
    pub(crate) fn scratch(size: usize) -> Self {
        let words = vec![0u64; size.div_ceil(size_of::<u64>())];
        let lock = Lock::Scratch(words.into_boxed_slice());
        BufferGuard { lock, size }
    }
}

impl BufferGuard<'_> {
    #[inline]
    pub fn is_writable(&self) -> bool {
        !matches!(self.lock, Lock::Read(_))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        let bytes = match &self.lock {
            Lock::Read(data) => data.as_ref().map_or(Default::default(), |data| data.as_bytes()),
            Lock::Write(data) => data.as_ref().map_or(Default::default(), |data| data.as_bytes()),
            Lock::Scratch(words) => bytemuck::cast_slice(words),
        };
        &bytes[..self.size.min(bytes.len())]
    }

    /// # Panics
    /// Panics if the buffer was locked for reading only.
    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let size = self.size;
        let bytes = match &mut self.lock {
            Lock::Read(_) => panic!("buffer is locked for reading only"),
            Lock::Write(data) => data.as_mut().map_or(Default::default(), |data| data.as_bytes_mut()),
            Lock::Scratch(words) => bytemuck::cast_slice_mut(words),
        };
        let len = size.min(bytes.len());
        &mut bytes[..len]
    }

    #[inline]
    pub fn as_slice<T: Pod>(&self) -> &[T] {
        bytemuck::cast_slice(self.as_bytes())
    }

    /// # Panics
    /// Panics if the buffer was locked for reading only.
    #[inline]
    pub fn as_mut_slice<T: Pod>(&mut self) -> &mut [T] {
        bytemuck::cast_slice_mut(self.as_bytes_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::{BufferGuard, DataHandle, HandleState};
    use crate::loom::comm::Tag;

    #[test]
    fn test_lazy_materialize() {
        let handle = DataHandle::new::<f32>(6, 0, Some(Tag(0)));
        assert!(!handle.is_materialized());
        assert_eq!(handle.size(), 24);
        {
            let mut guard = handle.lock_write();
            guard.as_mut_slice::<f32>().fill(2.0);
        }
        assert!(handle.is_materialized());
        assert_eq!(handle.lock_read().as_slice::<f32>(), &[2.0; 6]);

        handle.evict();
        assert!(!handle.is_materialized());
    }

    #[test]
    fn test_from_vec_truncates() {
        let handle = DataHandle::from_vec(vec![1.0f64, 2.0, 3.0, 4.0], 3, 0);
        assert_eq!(handle.state(), HandleState::LocalValid);
        assert_eq!(handle.lock_read().as_slice::<f64>(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_scratch() {
        let mut scratch = BufferGuard::scratch(3 * size_of::<usize>());
        assert_eq!(scratch.as_mut_slice::<usize>().len(), 3);
        assert!(scratch.is_writable());
    }

    #[test]
    #[should_panic]
    fn test_read_only() {
        let handle = DataHandle::new::<f32>(1, 0, None);
        let mut guard = handle.lock_read();
        guard.as_bytes_mut();
    }

    #[test]
    fn test_coherence() {
        let owner = DataHandle::new::<f32>(1, 0, Some(Tag(0)));
        owner.mark_written();
        assert_eq!(owner.state(), HandleState::LocalValid);
        assert!(owner.mark_sent(1));
        assert!(!owner.mark_sent(1));
        assert!(!owner.flush(0));
        assert_eq!(owner.state(), HandleState::GloballyVisible);
        assert!(owner.mark_sent(1));

        let remote = DataHandle::new::<f32>(1, 0, Some(Tag(0)));
        remote.mark_cached();
        assert_eq!(remote.state(), HandleState::RemoteCached);
        assert!(remote.flush(1));
        assert_eq!(remote.state(), HandleState::Uninitialized);
        assert!(!remote.flush(1));
    }
}
