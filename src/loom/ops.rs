use std::{any::Any, borrow::Cow};

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::handle::{BufferGuard, DataHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Access {
    Read,
    Write,
    ReadWrite,
    /// Per-execution temporary memory. Never creates a dependency.
    Scratch,
}

impl Access {
    /// Returns `true` if the access may modify the buffer.
    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// One buffer of a task.
#[derive(Debug, Clone)]
pub enum TaskIr {
    Data { handle: DataHandle, access: Access },
    Scratch { size: usize },
}

impl TaskIr {
    #[inline]
    pub fn read(handle: &DataHandle) -> Self {
        let handle = handle.clone();
        let access = Access::Read;
        Self::Data { handle, access }
    }

    #[inline]
    pub fn write(handle: &DataHandle) -> Self {
        let handle = handle.clone();
        let access = Access::Write;
        Self::Data { handle, access }
    }

    #[inline]
    pub fn read_write(handle: &DataHandle) -> Self {
        let handle = handle.clone();
        let access = Access::ReadWrite;
        Self::Data { handle, access }
    }

    /// Task-private memory of `size` bytes.
    #[inline]
    pub fn scratch(size: usize) -> Self {
        Self::Scratch { size }
    }

    #[inline]
    pub fn access(&self) -> Access {
        match self {
            TaskIr::Data { access, .. } => *access,
            TaskIr::Scratch { .. } => Access::Scratch,
        }
    }

    #[inline]
    pub fn handle(&self) -> Option<&DataHandle> {
        match self {
            TaskIr::Data { handle, .. } => Some(handle),
            TaskIr::Scratch { .. } => None,
        }
    }

    /// Locks the buffer as declared: shared for reads, exclusive for writes.
    pub(crate) fn lock(&self) -> BufferGuard<'_> {
        match self {
            TaskIr::Data { handle, access } if access.is_write() => handle.lock_write(),
            TaskIr::Data { handle, .. } => handle.lock_read(),
            TaskIr::Scratch { size } => BufferGuard::scratch(*size),
        }
    }
}

pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    #[inline]
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Description of a task: its buffers with declared access modes.
/// Scalar arguments of the codelet are fields of the implementor.
pub trait TaskOp: AsAny + Send + Sync + 'static {
    #[inline]
    fn name(&self) -> Cow<'static, str> {
        Cow::from(std::any::type_name::<Self>())
    }

    /// Buffers of the task, in the order the codelet receives them.
    fn io(&self) -> Vec<TaskIr>;
}

impl dyn TaskOp {
    /// Type id of the concrete op behind the trait object.
    #[inline]
    pub fn op_id(&self) -> std::any::TypeId {
        self.as_any().type_id()
    }

    #[inline]
    pub fn downcast_ref<Op: TaskOp>(&self) -> Option<&Op> {
        self.as_any().downcast_ref()
    }
}

/// Implemented for each backend for each [`TaskOp`] it can run: the codelet.
///
/// A codelet only touches the buffers it is given, and must not panic.
pub trait BackendOp<B> {
    fn execute(&self, backend: &B, buffers: &mut [BufferGuard<'_>]);
}

/// Plain list of task buffers, to be embedded in concrete ops.
#[derive(Debug, Clone)]
pub struct InnerOp {
    pub io: Vec<TaskIr>,
}

impl InnerOp {
    #[inline]
    pub fn new(io: impl IntoIterator<Item = TaskIr>) -> Self {
        let io = io.into_iter().collect();
        Self { io }
    }
}

impl TaskOp for InnerOp {
    #[inline]
    fn io(&self) -> Vec<TaskIr> {
        self.io.clone()
    }
}
