use itertools::Itertools;

use super::{Event, graph::TaskId};
use crate::loom::{
    handle::BufferGuard,
    ops::{BackendOp, TaskIr, TaskOp},
    platform,
};

/// Context handed to CPU codelets.
#[derive(Debug, Clone)]
pub struct Backend {
    /// Index of the worker running the codelet.
    pub worker: usize,
    /// Rank of the process.
    pub rank: usize,
}

pub(crate) fn execute_op<Op: TaskOp + BackendOp<Backend>>(
    backend: &Backend,
    op: &dyn TaskOp,
    buffers: &mut [BufferGuard<'_>],
) {
    match op.downcast_ref::<Op>() {
        Some(op) => op.execute(backend, buffers),
        None => unreachable!(),
    }
}

/// A ready compute task.
pub(crate) struct Work {
    pub id: TaskId,
    pub op: Box<dyn TaskOp>,
    pub io: Vec<TaskIr>,
    pub f: fn(&Backend, &dyn TaskOp, &mut [BufferGuard<'_>]),
}

impl Work {
    fn execute(self, backend: &Backend) {
        #[cfg(feature = "trace")]
        let _span = tracing::trace_span!("codelet", name = %self.op.name()).entered();

        let mut buffers = self.io.iter().map(TaskIr::lock).collect_vec();
        (self.f)(backend, self.op.as_ref(), &mut buffers);
    }
}

pub(crate) async fn serve(
    backend: Backend,
    receiver: flume::Receiver<Work>,
    events: flume::Sender<Event>,
) {
    while let Ok(work) = receiver.recv_async().await {
        let id = work.id;
        let name = work.op.name();
        let context = backend.clone();
        if platform::handle(move || work.execute(&context)).await.is_none() {
            log::error!("worker {}: codelet {name} panicked", backend.worker);
        }
        _ = events.send(Event::Complete(id));
    }
}
