//! Boundary to external executors that run remote systems.
//!
//! An executor receives a [`SnapshotPayload`] once, then is driven by update
//! signals. The world pushes every archetype it creates to all executors
//! before their next update. Anything the snapshot cannot express
//! incrementally (new storages, resized buffers) marks the executors for a
//! full resync, which happens right before the next update.
//!
//! How an executor runs its work (thread, process, pool) is up to the
//! [`ExecutorHandle`] implementation.

use crate::archetype::ArchetypeState;
use crate::snapshot::SnapshotPayload;
use crate::EcsError;

/// Primary-side handle to one executor.
pub trait ExecutorHandle: Send {
    /// Hand over a full snapshot. Returns once the executor has adopted it.
    fn submit_snapshot(&mut self, payload: SnapshotPayload) -> Result<(), EcsError>;

    /// Ask the executor to run one update. Does not wait.
    fn signal_update(&mut self) -> Result<(), EcsError>;

    /// Block until the update started by the last signal has finished.
    fn await_update_complete(&mut self) -> Result<(), EcsError>;

    /// Tell the executor about an archetype created after its snapshot.
    fn broadcast_new_archetype(&mut self, archetype: ArchetypeState) -> Result<(), EcsError>;
}

/// Handle to a group of executors sharing one remote system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteSystemId(pub u32);

struct RemoteSystemGroup {
    executors: Vec<Box<dyn ExecutorHandle>>,
    needs_sync: bool,
}

/// Every executor group attached to a world.
#[derive(Default)]
pub struct Executors {
    groups: Vec<RemoteSystemGroup>,
}

impl Executors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a group. It starts out needing a snapshot.
    pub(crate) fn push(&mut self, executors: Vec<Box<dyn ExecutorHandle>>) -> RemoteSystemId {
        let id = RemoteSystemId(self.groups.len() as u32);
        self.groups.push(RemoteSystemGroup {
            executors,
            needs_sync: true,
        });
        id
    }

    /// Number of attached groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of executors in a group.
    pub fn group_size(&self, id: RemoteSystemId) -> Result<usize, EcsError> {
        Ok(self.group(id)?.executors.len())
    }

    pub fn ids(&self) -> impl Iterator<Item = RemoteSystemId> {
        (0..self.groups.len() as u32).map(RemoteSystemId)
    }

    fn group(&self, id: RemoteSystemId) -> Result<&RemoteSystemGroup, EcsError> {
        self.groups
            .get(id.0 as usize)
            .ok_or_else(|| EcsError::Executor(format!("unknown remote system {}", id.0)))
    }

    fn group_mut(&mut self, id: RemoteSystemId) -> Result<&mut RemoteSystemGroup, EcsError> {
        self.groups
            .get_mut(id.0 as usize)
            .ok_or_else(|| EcsError::Executor(format!("unknown remote system {}", id.0)))
    }

    /// Whether the group gets a full snapshot before its next update.
    pub fn needs_sync(&self, id: RemoteSystemId) -> Result<bool, EcsError> {
        Ok(self.group(id)?.needs_sync)
    }

    /// Force a full resync of every group before its next update.
    pub fn mark_dirty(&mut self) {
        for group in &mut self.groups {
            group.needs_sync = true;
        }
    }

    /// Push a new archetype to every executor. A failed push degrades to a
    /// resync of that group instead of failing the structural change.
    pub(crate) fn broadcast(&mut self, archetype: &ArchetypeState) {
        for (index, group) in self.groups.iter_mut().enumerate() {
            if group.needs_sync {
                continue;
            }
            for executor in &mut group.executors {
                if let Err(err) = executor.broadcast_new_archetype(archetype.clone()) {
                    tracing::warn!(
                        remote_system = index,
                        archetype = ?archetype.id,
                        error = %err,
                        "new-archetype broadcast failed, scheduling resync"
                    );
                    group.needs_sync = true;
                    break;
                }
            }
        }
    }

    /// Submit one payload per executor of the group, in order.
    pub(crate) fn submit(
        &mut self,
        id: RemoteSystemId,
        payloads: Vec<SnapshotPayload>,
    ) -> Result<(), EcsError> {
        let group = self.group_mut(id)?;
        for (executor, payload) in group.executors.iter_mut().zip(payloads) {
            executor.submit_snapshot(payload)?;
        }
        group.needs_sync = false;
        Ok(())
    }

    /// Signal every executor of the group, then wait for all of them.
    pub(crate) fn run(&mut self, id: RemoteSystemId) -> Result<(), EcsError> {
        let group = self.group_mut(id)?;
        let mut first_error = None;
        let mut signalled = 0;
        for executor in &mut group.executors {
            match executor.signal_update() {
                Ok(()) => signalled += 1,
                Err(err) => {
                    first_error = Some(err);
                    break;
                }
            }
        }
        // Every signalled executor is awaited so none is left mid-update.
        for executor in group.executors.iter_mut().take(signalled) {
            if let Err(err) = executor.await_update_complete() {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for Executors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executors")
            .field("groups", &self.groups.len())
            .finish()
    }
}
