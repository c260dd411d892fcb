//! Thread-backed executors for bagel-ecs remote systems.
//!
//! A [`ThreadExecutor`] owns one OS thread running a [`RemoteSystem`] over a
//! [`RemoteWorld`]. The primary talks to it through two crossbeam channels:
//! commands go down (snapshot, update, new archetype, shutdown) and replies
//! come back for the two blocking operations (snapshot adoption and update
//! completion). Archetype broadcasts are fire-and-forget; channel ordering
//! guarantees the worker applies them before the next update.

use std::fmt;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};

use bagel_ecs::archetype::ArchetypeState;
use bagel_ecs::executor::ExecutorHandle;
use bagel_ecs::snapshot::{RemoteWorld, SnapshotPayload};
use bagel_ecs::EcsError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by worker threads and their handles.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("could not start worker '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The worker thread is gone (it panicked or was shut down).
    #[error("worker '{name}' is disconnected")]
    Disconnected { name: String },

    #[error("worker '{name}' was asked to update before receiving a snapshot")]
    NotInitialized { name: String },

    #[error("worker '{name}' already has an update in flight")]
    UpdateInFlight { name: String },

    #[error("worker '{name}' has no update in flight")]
    NoUpdateInFlight { name: String },

    /// The system itself returned an error.
    #[error("system '{name}' failed: {source}")]
    System {
        name: String,
        #[source]
        source: EcsError,
    },
}

impl From<WorkerError> for EcsError {
    fn from(err: WorkerError) -> Self {
        EcsError::Executor(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// RemoteSystem
// ---------------------------------------------------------------------------

/// Logic run on a worker thread against a snapshot of the world.
///
/// `init` runs every time a snapshot is adopted, including resyncs, so
/// queries registered there are rebuilt against the fresh view.
pub trait RemoteSystem: Send + 'static {
    fn name(&self) -> &str;

    fn init(&mut self, _world: &mut RemoteWorld) -> Result<(), EcsError> {
        Ok(())
    }

    fn update(&mut self, world: &mut RemoteWorld) -> Result<(), EcsError>;
}

// ---------------------------------------------------------------------------
// Worker protocol
// ---------------------------------------------------------------------------

enum Command {
    Init(Box<SnapshotPayload>),
    Update,
    NewArchetype(ArchetypeState),
    Shutdown,
}

fn run_worker<S: RemoteSystem>(
    mut system: S,
    commands: Receiver<Command>,
    replies: Sender<Result<(), WorkerError>>,
) {
    let name = system.name().to_owned();
    let mut world: Option<RemoteWorld> = None;
    tracing::debug!(system = %name, "worker started");

    for command in commands.iter() {
        let reply = match command {
            Command::Init(payload) => {
                let adopted = RemoteWorld::from_snapshot(*payload).and_then(|mut fresh| {
                    system.init(&mut fresh)?;
                    Ok(fresh)
                });
                match adopted {
                    Ok(fresh) => {
                        world = Some(fresh);
                        Ok(())
                    }
                    Err(source) => Err(WorkerError::System {
                        name: name.clone(),
                        source,
                    }),
                }
            }
            Command::Update => match world.as_mut() {
                Some(world) => system.update(world).map_err(|source| WorkerError::System {
                    name: name.clone(),
                    source,
                }),
                None => Err(WorkerError::NotInitialized { name: name.clone() }),
            },
            Command::NewArchetype(archetype) => {
                if let Some(world) = world.as_mut() {
                    if let Err(err) = world.apply_new_archetype(archetype) {
                        tracing::warn!(system = %name, error = %err, "dropping out-of-order archetype");
                    }
                }
                continue;
            }
            Command::Shutdown => break,
        };
        if replies.send(reply).is_err() {
            break;
        }
    }
    tracing::debug!(system = %name, "worker stopped");
}

// ---------------------------------------------------------------------------
// ThreadExecutor
// ---------------------------------------------------------------------------

/// [`ExecutorHandle`] backed by a dedicated thread.
pub struct ThreadExecutor {
    name: String,
    commands: Sender<Command>,
    replies: Receiver<Result<(), WorkerError>>,
    handle: Option<JoinHandle<()>>,
    in_flight: bool,
}

impl ThreadExecutor {
    /// Start a worker thread for `system`. It idles until its first snapshot.
    pub fn spawn<S: RemoteSystem>(system: S) -> Result<Self, WorkerError> {
        let name = system.name().to_owned();
        let (commands, command_rx) = unbounded();
        let (reply_tx, replies) = bounded(1);
        let handle = thread::Builder::new()
            .name(format!("bagel-worker-{name}"))
            .spawn(move || run_worker(system, command_rx, reply_tx))
            .map_err(|source| WorkerError::Spawn {
                name: name.clone(),
                source,
            })?;
        Ok(Self {
            name,
            commands,
            replies,
            handle: Some(handle),
            in_flight: false,
        })
    }

    /// One boxed executor per system built by `make(index)`, ready for
    /// [`World::add_remote_system`](bagel_ecs::world::World::add_remote_system).
    pub fn spawn_group<S, F>(count: usize, mut make: F) -> Result<Vec<Box<dyn ExecutorHandle>>, WorkerError>
    where
        S: RemoteSystem,
        F: FnMut(usize) -> S,
    {
        (0..count)
            .map(|i| Ok(Box::new(Self::spawn(make(i))?) as Box<dyn ExecutorHandle>))
            .collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, command: Command) -> Result<(), WorkerError> {
        self.commands.send(command).map_err(|_| WorkerError::Disconnected {
            name: self.name.clone(),
        })
    }

    fn reply(&self) -> Result<(), WorkerError> {
        self.replies.recv().map_err(|_| WorkerError::Disconnected {
            name: self.name.clone(),
        })?
    }
}

impl ExecutorHandle for ThreadExecutor {
    fn submit_snapshot(&mut self, payload: SnapshotPayload) -> Result<(), EcsError> {
        if self.in_flight {
            return Err(WorkerError::UpdateInFlight {
                name: self.name.clone(),
            }
            .into());
        }
        self.send(Command::Init(Box::new(payload)))?;
        Ok(self.reply()?)
    }

    fn signal_update(&mut self) -> Result<(), EcsError> {
        if self.in_flight {
            return Err(WorkerError::UpdateInFlight {
                name: self.name.clone(),
            }
            .into());
        }
        self.send(Command::Update)?;
        self.in_flight = true;
        Ok(())
    }

    fn await_update_complete(&mut self) -> Result<(), EcsError> {
        if !self.in_flight {
            return Err(WorkerError::NoUpdateInFlight {
                name: self.name.clone(),
            }
            .into());
        }
        self.in_flight = false;
        Ok(self.reply()?)
    }

    fn broadcast_new_archetype(&mut self, archetype: ArchetypeState) -> Result<(), EcsError> {
        Ok(self.send(Command::NewArchetype(archetype))?)
    }
}

impl Drop for ThreadExecutor {
    fn drop(&mut self) {
        if self.in_flight {
            let _ = self.replies.recv();
        }
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!(system = %self.name, "worker thread panicked");
            }
        }
    }
}

impl fmt::Debug for ThreadExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadExecutor")
            .field("name", &self.name)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}
