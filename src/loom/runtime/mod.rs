//! Task runtime: dependency inference, codelet dispatch and the cross-rank transfer protocol.
//!
//! A single scheduler loop owns the [`TaskGraph`]. Submissions, completions and barriers reach it
//! as [`Event`]s over a flume channel, ready compute tasks are forwarded to the CPU workers.

use std::{any::TypeId, borrow::Cow, ops::Range, sync::Arc};

use derive_more::Display;
use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use self::graph::{TaskGraph, TaskId};
use super::{
    comm::{CommError, LocalCluster, Tag, Transport},
    handle::{BufferGuard, DataHandle, HandleId, HandleState},
    ops::{Access, BackendOp, TaskIr, TaskOp},
    platform,
};

pub mod cpu;
pub mod graph;

/// Codelets of one backend, keyed by the type of op they run.
pub type OpVTable<B> = HashMap<TypeId, fn(&B, &dyn TaskOp, &mut [BufferGuard<'_>])>;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    Cpu,
    Accelerator,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("no codelet for op {0} on device {1}")]
    NoCodelet(Cow<'static, str>, DeviceClass),
    #[error("no worker of device class {0}")]
    NoDevice(DeviceClass),
    #[error("violation of write uniqueness rule: handle {0}")]
    WriteOnly(HandleId),
    #[error("violation of read/write uniqueness rule: handle {0}")]
    ReadWrite(HandleId),
    #[error("rank {0} cannot write handle {1} owned by rank {2}")]
    RemoteWrite(usize, HandleId, usize),
    #[error("handle {0} owned by rank {1} is not resident on rank {2}")]
    NotResident(HandleId, usize, usize),
    #[error("scratch buffers cannot be acquired")]
    AcquireScratch,
    #[error("handle {0} has no distributed tag")]
    Untagged(HandleId),
    #[error("rank {0} out of range for a world of size {1}")]
    InvalidRank(usize, usize),
    #[error("runtime is shut down")]
    Closed,
    #[error("{0} failed: {1}")]
    Transfer(Cow<'static, str>, #[source] CommError),
    #[error("{0}: expected {1} bytes, got {2}")]
    Payload(Cow<'static, str>, usize, usize),
    #[error(transparent)]
    Comm(#[from] CommError),
}

pub(crate) enum Job {
    Compute(cpu::Work),
    Send { handle: DataHandle, dst: usize, tag: Tag },
    Recv { handle: DataHandle, src: usize, tag: Tag },
    Evict { handle: DataHandle },
    Acquire { grant: flume::Sender<()> },
    Retire { tags: Range<Tag> },
    /// An accessor dropped before its grant.
    Withdrawn,
}

pub(crate) struct Task {
    id: TaskId,
    name: Cow<'static, str>,
    deps: Vec<(HandleId, Access)>,
    job: Job,
}

pub(crate) enum Event {
    Submit(Task),
    Complete(TaskId),
    /// The task finished without producing its output.
    Fail(TaskId, TaskError),
    Wait(flume::Sender<Result<(), TaskError>>),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct RuntimeBuilder {
    pub ops: OpVTable<cpu::Backend>,
    pub workers: usize,
    pub transport: Option<Arc<dyn Transport>>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        let workers = std::thread::available_parallelism().map_or(1, usize::from);
        Self {
            ops: Default::default(),
            workers,
            transport: None,
        }
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_op<Op: TaskOp + BackendOp<cpu::Backend>>(mut self) -> Self {
        let id = TypeId::of::<Op>();
        self.ops.insert(id, cpu::execute_op::<Op>);
        self
    }

    /// Number of CPU worker loops.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Endpoint of this process in the world. Defaults to a single-rank [`LocalCluster`].
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub async fn build(self) -> Runtime {
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(LocalCluster::solo()));
        let workers = match self.workers {
            0 => {
                log::warn!("runtime built with no workers, using one");
                1
            }
            workers => workers,
        };

        let (sender, receiver) = flume::unbounded();
        let (work_sender, work_receiver) = flume::unbounded();

        for index in 0..workers {
            let backend = cpu::Backend {
                worker: index,
                rank: transport.rank(),
            };
            platform::spawn(cpu::serve(backend, work_receiver.clone(), sender.clone()));
        }

        let scheduler = Scheduler {
            graph: Default::default(),
            pending: Default::default(),
            waiters: vec![],
            failure: None,
            workers: work_sender,
            events: sender.clone(),
            transport: transport.clone(),
        };
        platform::spawn(serve(scheduler, receiver));

        let ops = self.ops;
        let inner = Arc::new(RuntimeInner {
            ops,
            transport,
            sender,
            workers,
        });
        Runtime { inner }
    }
}

#[derive(Debug)]
struct RuntimeInner {
    /// Codelets of the CPU class. Immutable after build.
    ops: OpVTable<cpu::Backend>,
    transport: Arc<dyn Transport>,
    sender: flume::Sender<Event>,
    workers: usize,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        _ = self.sender.send(Event::Shutdown);
    }
}

/// Handle to the task runtime of this rank. Cheap to clone; the runtime shuts down with the
/// last clone.
#[derive(Debug, Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Submit(task) => write!(f, "Submit({}, {})", task.id, task.name),
            Event::Complete(id) => write!(f, "Complete({id})"),
            Event::Fail(id, err) => write!(f, "Fail({id}, {err})"),
            Event::Wait(_) => write!(f, "Wait"),
            Event::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Checks the uniqueness rules of the buffers of one task.
fn check(io: &[TaskIr]) -> Result<(), TaskError> {
    for (x, y) in io.iter().tuple_combinations() {
        let (Some(handle), Some(other)) = (x.handle(), y.handle()) else {
            continue;
        };
        if handle != other {
            continue;
        }
        // 1. `Write` handles must not appear twice
        if matches!(x.access(), Access::Write) || matches!(y.access(), Access::Write) {
            return Err(TaskError::WriteOnly(handle.id()));
        }
        // 2. `ReadWrite` handles must not appear twice
        if matches!(x.access(), Access::ReadWrite) || matches!(y.access(), Access::ReadWrite) {
            return Err(TaskError::ReadWrite(handle.id()));
        }
    }
    Ok(())
}

impl Runtime {
    #[inline]
    pub fn world_rank(&self) -> usize {
        self.inner.transport.rank()
    }

    #[inline]
    pub fn world_size(&self) -> usize {
        self.inner.transport.size()
    }

    /// Number of CPU workers.
    #[inline]
    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    fn send(&self, task: Task) -> Result<(), TaskError> {
        log::debug!("rank {}: submit {} ({})", self.world_rank(), task.name, task.id);
        self.inner
            .sender
            .send(Event::Submit(task))
            .map_err(|_| TaskError::Closed)
    }

    /// Checks that this rank may access `handle` with `access`.
    fn check_residency(&self, handle: &DataHandle, access: Access) -> Result<(), TaskError> {
        let rank = self.world_rank();
        let owner = handle.owner();
        match access {
            Access::Scratch => Ok(()),
            _ if owner == rank => Ok(()),
            access if access.is_write() => Err(TaskError::RemoteWrite(rank, handle.id(), owner)),
            _ if handle.state() == HandleState::RemoteCached => Ok(()),
            _ => Err(TaskError::NotResident(handle.id(), owner, rank)),
        }
    }

    /// Submits a task to the CPU workers.
    #[inline]
    pub fn submit(&self, op: impl TaskOp) -> Result<(), TaskError> {
        self.submit_on(op, DeviceClass::Cpu)
    }

    /// Submits a task to a device class. Nothing is submitted if the task is rejected.
    pub fn submit_on(&self, op: impl TaskOp, device: DeviceClass) -> Result<(), TaskError> {
        let op: Box<dyn TaskOp> = Box::new(op);
        let name = op.name();

        let f = match device {
            DeviceClass::Cpu => self
                .inner
                .ops
                .get(&op.op_id())
                .copied()
                .ok_or_else(|| TaskError::NoCodelet(name.clone(), device))?,
            DeviceClass::Accelerator => return Err(TaskError::NoDevice(device)),
        };

        let io = op.io();
        check(&io)?;
        for ir in &io {
            if let Some(handle) = ir.handle() {
                self.check_residency(handle, ir.access())?;
            }
        }

        for ir in io.iter().filter(|ir| ir.access().is_write()) {
            if let Some(handle) = ir.handle() {
                handle.mark_written();
            }
        }

        let deps = io
            .iter()
            .filter_map(|ir| ir.handle().map(|handle| (handle.id(), ir.access())))
            .collect();
        let id = TaskId::new();
        let work = cpu::Work { id, op, io, f };
        let job = Job::Compute(work);
        self.send(Task {
            id,
            name,
            deps,
            job,
        })
    }

    /// Resolves once every task submitted so far, every transfer and every held accessor has
    /// completed.
    ///
    /// Returns the first transfer failure since the last wait. Holding an [`AccessGuard`]
    /// across this call never resolves.
    pub async fn wait_for_all(&self) -> Result<(), TaskError> {
        let (sender, receiver) = flume::bounded(1);
        self.inner
            .sender
            .send(Event::Wait(sender))
            .map_err(|_| TaskError::Closed)?;
        receiver.recv_async().await.map_err(|_| TaskError::Closed)?
    }

    /// Acquires local access to the data of `handle`.
    ///
    /// The access is granted once every earlier conflicting task has completed, and later
    /// conflicting tasks wait until the guard is dropped.
    pub async fn acquire<'a>(
        &self,
        handle: &'a DataHandle,
        access: Access,
    ) -> Result<AccessGuard<'a>, TaskError> {
        if matches!(access, Access::Scratch) {
            return Err(TaskError::AcquireScratch);
        }
        self.check_residency(handle, access)?;
        if access.is_write() {
            handle.mark_written();
        }

        let (grant, granted) = flume::bounded(1);
        let id = TaskId::new();
        let name = "acquire".into();
        let deps = vec![(handle.id(), access)];
        let job = Job::Acquire { grant };
        self.send(Task {
            id,
            name,
            deps,
            job,
        })?;

        // releases the node even if this future is dropped before the grant
        let release = Release {
            id,
            sender: self.inner.sender.clone(),
        };
        granted.recv_async().await.map_err(|_| TaskError::Closed)?;

        let buffer = match access.is_write() {
            true => handle.lock_write(),
            false => handle.lock_read(),
        };
        Ok(AccessGuard {
            buffer,
            _release: release,
        })
    }

    /// Makes the current value of `handle` available on rank `target`.
    ///
    /// On `target` this schedules a receive ordered after local readers; on the owner it
    /// schedules a send ordered after earlier writers. Every other rank returns immediately.
    pub fn mpi_transfer(&self, handle: &DataHandle, target: usize) -> Result<(), TaskError> {
        let size = self.world_size();
        if target >= size {
            return Err(TaskError::InvalidRank(target, size));
        }
        let rank = self.world_rank();
        let owner = handle.owner();
        if owner == target {
            return Ok(());
        }
        let tag = handle.tag().ok_or(TaskError::Untagged(handle.id()))?;

        if rank == target {
            if handle.state() == HandleState::RemoteCached {
                return Ok(());
            }
            handle.mark_cached();
            let handle = handle.clone();
            let deps = vec![(handle.id(), Access::Write)];
            let job = Job::Recv {
                handle,
                src: owner,
                tag,
            };
            let id = TaskId::new();
            let name = format!("recv {tag} from {owner}").into();
            return self.send(Task {
                id,
                name,
                deps,
                job,
            });
        }

        if rank == owner && handle.mark_sent(target) {
            let handle = handle.clone();
            let deps = vec![(handle.id(), Access::Read)];
            let job = Job::Send {
                handle,
                dst: target,
                tag,
            };
            let id = TaskId::new();
            let name = format!("send {tag} to {target}").into();
            return self.send(Task {
                id,
                name,
                deps,
                job,
            });
        }

        Ok(())
    }

    /// Invalidates every remote copy of `handle` after a write.
    ///
    /// The owner forgets where it sent the value, other ranks evict their cached copy once its
    /// readers are done.
    pub fn mpi_flush(&self, handle: &DataHandle) -> Result<(), TaskError> {
        if !handle.flush(self.world_rank()) {
            return Ok(());
        }
        let id = TaskId::new();
        let name = "evict".into();
        let deps = vec![(handle.id(), Access::Write)];
        let handle = handle.clone();
        let job = Job::Evict { handle };
        self.send(Task {
            id,
            name,
            deps,
            job,
        })
    }

    /// Releases the tags of a distributed object with the transport, once every task touching
    /// one of its `handles` has completed.
    pub fn retire<'a>(&self, handles: impl IntoIterator<Item = &'a DataHandle>, tags: Range<Tag>) {
        let id = TaskId::new();
        let name = format!("retire {}..{}", tags.start, tags.end).into();
        let deps = handles
            .into_iter()
            .map(|handle| (handle.id(), Access::Write))
            .collect();
        let job = Job::Retire { tags };
        if let Err(err) = self.send(Task {
            id,
            name,
            deps,
            job,
        }) {
            log::warn!("rank {}: tags not retired: {err}", self.world_rank());
        }
    }
}

struct Release {
    id: TaskId,
    sender: flume::Sender<Event>,
}

impl Drop for Release {
    fn drop(&mut self) {
        _ = self.sender.send(Event::Complete(self.id));
    }
}

/// Scoped access to the data of one handle. Dropping the guard releases the access.
pub struct AccessGuard<'a> {
    // declared first: the lock is released before the node completes
    buffer: BufferGuard<'a>,
    _release: Release,
}

impl AccessGuard<'_> {
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.buffer.is_writable()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_bytes()
    }

    #[inline]
    pub fn as_slice<T: bytemuck::Pod>(&self) -> &[T] {
        self.buffer.as_slice()
    }

    /// # Panics
    /// Panics if the access was acquired for reading only.
    #[inline]
    pub fn as_mut_slice<T: bytemuck::Pod>(&mut self) -> &mut [T] {
        self.buffer.as_mut_slice()
    }
}

struct Scheduler {
    graph: TaskGraph,
    /// Tasks waiting for their dependencies.
    pending: HashMap<TaskId, Task>,
    waiters: Vec<flume::Sender<Result<(), TaskError>>>,
    /// First failure since the last barrier.
    failure: Option<TaskError>,
    workers: flume::Sender<cpu::Work>,
    events: flume::Sender<Event>,
    transport: Arc<dyn Transport>,
}

impl Scheduler {
    fn submit(&mut self, task: Task) {
        match self.graph.insert(task.id, task.deps.iter().copied()) {
            true => self.dispatch(task),
            false => {
                self.pending.insert(task.id, task);
            }
        }
    }

    fn complete(&mut self, id: TaskId) {
        // a withdrawn task keeps its place and completes once its dependencies have
        if let Some(task) = self.pending.get_mut(&id) {
            log::trace!("task {id} withdrawn before it ran");
            task.job = Job::Withdrawn;
            return;
        }
        for id in self.graph.complete(id) {
            if let Some(task) = self.pending.remove(&id) {
                self.dispatch(task);
            }
        }
        if self.graph.is_empty() {
            self.notify();
        }
    }

    fn fail(&mut self, err: TaskError) {
        log::error!("rank {}: {err}", self.transport.rank());
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }

    /// Answers every barrier. The pending failure goes to the first one.
    fn notify(&mut self) {
        for waiter in self.waiters.drain(..) {
            let result = match self.failure.take() {
                Some(err) => Err(err),
                None => Ok(()),
            };
            _ = waiter.send(result);
        }
    }

    /// Runs a ready task. Every job ends with [`Event::Complete`] or [`Event::Fail`] for its id.
    fn dispatch(&mut self, task: Task) {
        let Task { id, name, job, .. } = task;
        let rank = self.transport.rank();
        let events = self.events.clone();
        let done = move || {
            _ = events.send(Event::Complete(id));
        };

        match job {
            Job::Compute(work) => {
                if self.workers.send(work).is_err() {
                    log::error!("rank {rank}: workers are gone, dropping {name}");
                    done();
                }
            }
            Job::Send { handle, dst, tag } => {
                let payload: Box<[u8]> = handle.lock_read().as_bytes().into();
                if let Err(err) = self.transport.send(dst, tag, payload) {
                    self.fail(TaskError::Transfer(name, err));
                }
                done();
            }
            Job::Recv { handle, src, tag } => {
                let future = self.transport.recv(src, tag);
                let events = self.events.clone();
                platform::spawn(async move {
                    let result = match future.await {
                        Ok(payload) => {
                            let mut buffer = handle.lock_write();
                            let data = buffer.as_bytes_mut();
                            match data.len() == payload.len() {
                                true => {
                                    data.copy_from_slice(&payload);
                                    Ok(())
                                }
                                false => Err(TaskError::Payload(name, data.len(), payload.len())),
                            }
                        }
                        Err(err) => Err(TaskError::Transfer(name, err)),
                    };
                    match result {
                        Ok(()) => done(),
                        Err(err) => {
                            // the cached copy is not valid
                            handle.flush(rank);
                            handle.evict();
                            _ = events.send(Event::Fail(id, err));
                        }
                    }
                });
            }
            Job::Evict { handle } => {
                handle.evict();
                done();
            }
            Job::Acquire { grant } => {
                // nobody is waiting for the grant any more
                if grant.send(()).is_err() {
                    done();
                }
            }
            Job::Retire { tags } => {
                self.transport.retire(tags);
                done();
            }
            Job::Withdrawn => done(),
        }
    }
}

async fn serve(mut scheduler: Scheduler, receiver: flume::Receiver<Event>) {
    while let Ok(event) = receiver.recv_async().await {
        match event {
            Event::Submit(task) => scheduler.submit(task),
            Event::Complete(id) => scheduler.complete(id),
            Event::Fail(id, err) => {
                scheduler.fail(err);
                scheduler.complete(id);
            }
            Event::Wait(sender) => {
                scheduler.waiters.push(sender);
                if scheduler.graph.is_empty() {
                    scheduler.notify();
                }
            }
            Event::Shutdown => break,
        }
    }
    if !scheduler.graph.is_empty() {
        log::warn!(
            "rank {}: runtime shut down with {} unfinished tasks",
            scheduler.transport.rank(),
            scheduler.graph.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, time::Duration};

    use futures::FutureExt;

    use super::{DeviceClass, Runtime, RuntimeBuilder, TaskError};
    use crate::loom::{
        comm::{LocalCluster, Tag, Transport},
        handle::{BufferGuard, DataHandle, HandleState},
        ops::{Access, BackendOp, InnerOp, TaskIr, TaskOp},
        runtime::cpu::Backend,
    };

    /// Adds one to every element of the last buffer, summing the others into it.
    #[derive(Debug, Clone)]
    struct AccumulateOp(InnerOp);

    impl TaskOp for AccumulateOp {
        fn io(&self) -> Vec<TaskIr> {
            self.0.io()
        }
    }

    impl BackendOp<Backend> for AccumulateOp {
        fn execute(&self, _backend: &Backend, buffers: &mut [BufferGuard<'_>]) {
            let Some((output, inputs)) = buffers.split_last_mut() else {
                return;
            };
            let sum: f32 = inputs
                .iter()
                .filter(|input| !input.as_bytes().is_empty())
                .map(|input| input.as_slice::<f32>()[0])
                .sum();
            for x in output.as_mut_slice::<f32>() {
                *x += sum + 1.0;
            }
        }
    }

    /// Sets the output to one, slowly.
    #[derive(Debug, Clone)]
    struct SlowOp(InnerOp);

    impl TaskOp for SlowOp {
        fn io(&self) -> Vec<TaskIr> {
            self.0.io()
        }
    }

    impl BackendOp<Backend> for SlowOp {
        fn execute(&self, _backend: &Backend, buffers: &mut [BufferGuard<'_>]) {
            std::thread::sleep(Duration::from_millis(200));
            if let Some(output) = buffers.last_mut() {
                output.as_mut_slice::<f32>().fill(1.0);
            }
        }
    }

    async fn runtime() -> Runtime {
        RuntimeBuilder::new()
            .add_op::<AccumulateOp>()
            .workers(4)
            .build()
            .await
    }

    #[tokio::test]
    async fn test_write_chain() -> Result<(), Box<dyn Error>> {
        let runtime = runtime().await;
        let x = DataHandle::new::<f32>(3, 0, None);
        for _ in 0..100 {
            let op = AccumulateOp(InnerOp::new([TaskIr::read_write(&x)]));
            runtime.submit(op)?;
        }
        runtime.wait_for_all().await?;

        let guard = runtime.acquire(&x, Access::Read).await?;
        assert_eq!(guard.as_slice::<f32>(), &[100.0; 3]);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_after_write() -> Result<(), Box<dyn Error>> {
        let runtime = runtime().await;
        let x = DataHandle::new::<f32>(1, 0, None);
        let y = DataHandle::new::<f32>(1, 0, None);

        runtime.submit(AccumulateOp(InnerOp::new([TaskIr::write(&x)])))?;
        runtime.submit(AccumulateOp(InnerOp::new([TaskIr::read(&x), TaskIr::write(&y)])))?;
        runtime.submit(AccumulateOp(InnerOp::new([TaskIr::read_write(&x)])))?;
        runtime.wait_for_all().await?;

        assert_eq!(runtime.acquire(&x, Access::Read).await?.as_slice::<f32>(), &[2.0]);
        assert_eq!(runtime.acquire(&y, Access::Read).await?.as_slice::<f32>(), &[2.0]);
        assert_eq!(x.state(), HandleState::LocalValid);
        Ok(())
    }

    #[tokio::test]
    async fn test_acquire_orders_tasks() -> Result<(), Box<dyn Error>> {
        let runtime = runtime().await;
        let x = DataHandle::new::<f32>(2, 0, None);
        {
            let mut guard = runtime.acquire(&x, Access::Write).await?;
            guard.as_mut_slice::<f32>().copy_from_slice(&[5.0, 6.0]);
            runtime.submit(AccumulateOp(InnerOp::new([TaskIr::read_write(&x)])))?;
        }
        runtime.wait_for_all().await?;
        assert_eq!(runtime.acquire(&x, Access::Read).await?.as_slice::<f32>(), &[6.0, 7.0]);
        Ok(())
    }

    #[tokio::test]
    async fn test_withdrawn_acquire_keeps_order() -> Result<(), Box<dyn Error>> {
        let runtime = RuntimeBuilder::new()
            .add_op::<SlowOp>()
            .workers(1)
            .build()
            .await;
        let x = DataHandle::new::<f32>(1, 0, None);
        runtime.submit(SlowOp(InnerOp::new([TaskIr::write(&x)])))?;

        // given up while the write is still running
        let withdrawn = runtime.acquire(&x, Access::Write).now_or_never();
        assert!(withdrawn.is_none());

        let guard = runtime.acquire(&x, Access::Read).await?;
        assert_eq!(guard.as_slice::<f32>(), &[1.0]);
        drop(guard);
        runtime.wait_for_all().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_scratch() -> Result<(), Box<dyn Error>> {
        let runtime = runtime().await;
        let x = DataHandle::new::<f32>(1, 0, None);
        let op = AccumulateOp(InnerOp::new([TaskIr::scratch(64), TaskIr::write(&x)]));
        runtime.submit(op)?;
        runtime.wait_for_all().await?;
        assert_eq!(runtime.acquire(&x, Access::Read).await?.as_slice::<f32>(), &[1.0]);

        let err = runtime.acquire(&x, Access::Scratch).await;
        assert!(matches!(err, Err(TaskError::AcquireScratch)));
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_submissions() {
        let runtime = runtime().await;
        let x = DataHandle::new::<f32>(1, 0, None);

        let op = AccumulateOp(InnerOp::new([TaskIr::read(&x), TaskIr::write(&x)]));
        assert!(matches!(runtime.submit(op), Err(TaskError::WriteOnly(_))));

        let op = AccumulateOp(InnerOp::new([TaskIr::read(&x), TaskIr::read_write(&x)]));
        assert!(matches!(runtime.submit(op), Err(TaskError::ReadWrite(_))));

        let op = InnerOp::new([TaskIr::write(&x)]);
        assert!(matches!(runtime.submit(op), Err(TaskError::NoCodelet(..))));

        let op = AccumulateOp(InnerOp::new([TaskIr::write(&x)]));
        let err = runtime.submit_on(op, DeviceClass::Accelerator);
        assert!(matches!(err, Err(TaskError::NoDevice(DeviceClass::Accelerator))));

        let remote = DataHandle::new::<f32>(1, 1, Some(Tag(0)));
        let op = AccumulateOp(InnerOp::new([TaskIr::write(&remote)]));
        assert!(matches!(runtime.submit(op), Err(TaskError::RemoteWrite(0, _, 1))));

        let op = AccumulateOp(InnerOp::new([TaskIr::read(&remote), TaskIr::write(&x)]));
        assert!(matches!(runtime.submit(op), Err(TaskError::NotResident(_, 1, 0))));

        // rejected tasks leave no trace
        assert_eq!(x.state(), HandleState::Uninitialized);
        assert!(!x.is_materialized());
    }

    #[tokio::test]
    async fn test_transfer() -> Result<(), Box<dyn Error>> {
        let world = LocalCluster::new(2);
        let mut runtimes = vec![];
        for transport in world {
            let runtime = RuntimeBuilder::new()
                .add_op::<AccumulateOp>()
                .workers(2)
                .transport(transport)
                .build()
                .await;
            runtimes.push(runtime);
        }

        let run = |runtime: Runtime| async move {
            let rank = runtime.world_rank();
            // the same tile seen from both ranks
            let x = DataHandle::new::<f32>(2, 0, Some(Tag(42)));
            let y = DataHandle::new::<f32>(2, 1, Some(Tag(43)));

            if rank == 0 {
                runtime.submit(AccumulateOp(InnerOp::new([TaskIr::write(&x)])))?;
            }
            runtime.mpi_transfer(&x, 1)?;
            // a second transfer before the flush is free
            runtime.mpi_transfer(&x, 1)?;
            if rank == 1 {
                assert_eq!(x.state(), HandleState::RemoteCached);
                let op = AccumulateOp(InnerOp::new([TaskIr::read(&x), TaskIr::write(&y)]));
                runtime.submit(op)?;
            }
            runtime.mpi_flush(&x)?;
            runtime.wait_for_all().await?;

            if rank == 1 {
                assert_eq!(x.state(), HandleState::Uninitialized);
                assert!(!x.is_materialized());
                let guard = runtime.acquire(&y, Access::Read).await?;
                assert_eq!(guard.as_slice::<f32>(), &[2.0, 2.0]);
            } else {
                assert_eq!(x.state(), HandleState::GloballyVisible);
            }
            Ok::<_, TaskError>(())
        };

        let results = futures::future::join_all(runtimes.into_iter().map(run)).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_receive_is_reported() -> Result<(), Box<dyn Error>> {
        let world = LocalCluster::new(2);
        let runtime = RuntimeBuilder::new()
            .transport(world[1].clone())
            .build()
            .await;
        let x = DataHandle::new::<f32>(2, 0, Some(Tag(5)));

        // a message too short for the tile
        world[0].send(1, Tag(5), vec![0; 3].into())?;
        runtime.mpi_transfer(&x, 1)?;
        let err = runtime.wait_for_all().await;
        assert!(matches!(err, Err(TaskError::Payload(_, 8, 3))));
        assert_eq!(x.state(), HandleState::Uninitialized);
        assert!(!x.is_materialized());

        // reported once
        runtime.wait_for_all().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_transfer_errors() {
        let world = LocalCluster::new(2);
        let runtime = RuntimeBuilder::new()
            .transport(world[0].clone())
            .build()
            .await;
        let x = DataHandle::new::<f32>(1, 1, None);
        assert!(matches!(runtime.mpi_transfer(&x, 0), Err(TaskError::Untagged(_))));
        assert!(matches!(runtime.mpi_transfer(&x, 2), Err(TaskError::InvalidRank(2, 2))));
        // already resident on the owner
        assert!(runtime.mpi_transfer(&x, 1).is_ok());
    }
}
