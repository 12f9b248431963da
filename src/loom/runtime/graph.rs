use derive_more::{Deref, Display};
use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;

use crate::loom::{handle::HandleId, ops::Access};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct TaskId(uid::Id<TaskId>);

impl TaskId {
    #[inline]
    pub fn new() -> Self {
        Self(uid::Id::new())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct Node {
    /// Number of unfinished tasks this one waits for.
    waiting: usize,
    /// Tasks waiting for this one.
    dependents: Vec<TaskId>,
    /// Handles the task touches.
    handles: Vec<HandleId>,
}

#[derive(Debug, Default)]
struct Usage {
    writer: Option<TaskId>,
    readers: Vec<TaskId>,
}

/// Dependency graph of unfinished tasks.
///
/// Edges are derived from submission order only: a read waits for the last writer of the handle,
/// a write waits for the last writer and every reader since. Scratch buffers never create edges.
#[derive(Debug, Default)]
pub struct TaskGraph {
    nodes: HashMap<TaskId, Node>,
    usage: HashMap<HandleId, Usage>,
}

impl TaskGraph {
    /// Number of unfinished tasks.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn contains(&self, id: TaskId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Adds a task after every task inserted before it. Returns `true` if it can run right away.
    pub fn insert(&mut self, id: TaskId, accesses: impl IntoIterator<Item = (HandleId, Access)>) -> bool {
        let mut deps = vec![];
        let mut handles = vec![];
        for (handle, access) in accesses {
            if matches!(access, Access::Scratch) {
                continue;
            }
            let usage = self.usage.entry(handle).or_default();
            match access {
                Access::Read => {
                    deps.extend(usage.writer);
                    usage.readers.push(id);
                }
                _ => {
                    deps.extend(usage.writer);
                    deps.append(&mut usage.readers);
                    usage.writer = Some(id);
                }
            }
            handles.push(handle);
        }

        let deps = deps
            .into_iter()
            .filter(|&dep| dep != id)
            .unique()
            .filter(|dep| self.nodes.contains_key(dep))
            .collect_vec();
        for dep in &deps {
            if let Some(node) = self.nodes.get_mut(dep) {
                node.dependents.push(id);
            }
            log::trace!("edge {dep} → {id}");
        }

        let waiting = deps.len();
        let dependents = vec![];
        self.nodes.insert(
            id,
            Node {
                waiting,
                dependents,
                handles,
            },
        );
        waiting == 0
    }

    /// Removes a finished task. Returns the tasks that became ready, in submission order.
    ///
    /// A task that still waits for others is left in place: it has not run, and releasing its
    /// dependents early would let them pass the tasks it waits for.
    pub fn complete(&mut self, id: TaskId) -> Vec<TaskId> {
        if self.nodes.get(&id).is_some_and(|node| node.waiting > 0) {
            log::warn!("task {id} completed before its dependencies");
            return vec![];
        }
        let Some(node) = self.nodes.remove(&id) else {
            return vec![];
        };

        for handle in node.handles.iter().unique() {
            let Some(usage) = self.usage.get_mut(handle) else {
                continue;
            };
            if usage.writer == Some(id) {
                usage.writer = None;
            }
            usage.readers.retain(|&reader| reader != id);
            if usage.writer.is_none() && usage.readers.is_empty() {
                self.usage.remove(handle);
            }
        }

        node.dependents
            .into_iter()
            .filter(|dependent| match self.nodes.get_mut(dependent) {
                Some(node) => {
                    node.waiting -= 1;
                    node.waiting == 0
                }
                None => false,
            })
            .collect()
    }
}
