use hub_core::protocol::ModuleId;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Logical role of a child process started by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessKind {
    Manager,
    Ui,
    Script,
    Module(ModuleId),
}

impl ProcessKind {
    /// Session id of the process; the manager is always 0.
    pub fn logical_id(&self) -> i32 {
        match self {
            ProcessKind::Manager => 0,
            ProcessKind::Ui | ProcessKind::Script => -1,
            ProcessKind::Module(id) => *id,
        }
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessKind::Manager => f.write_str("manager"),
            ProcessKind::Ui => f.write_str("ui"),
            ProcessKind::Script => f.write_str("script"),
            ProcessKind::Module(id) => write!(f, "module:{id}"),
        }
    }
}

pub trait ChildProcess: Send {
    fn pid(&self) -> u32;
    /// `Some(code)` once the process has exited. The code is `None` when it
    /// was terminated by a signal.
    fn try_exit(&mut self) -> io::Result<Option<Option<i32>>>;
    fn kill(&mut self) -> io::Result<()>;
}

pub trait Spawner: Send + Sync {
    fn spawn(&self, program: &Path, args: &[String]) -> io::Result<Box<dyn ChildProcess>>;
}

struct OsChild {
    pid: u32,
    child: Child,
}

impl ChildProcess for OsChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_exit(&mut self) -> io::Result<Option<Option<i32>>> {
        Ok(self.child.try_wait()?.map(|status| status.code()))
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

/// Starts real processes, optionally through a launcher command such as
/// `mpirun -np 4`.
#[derive(Debug, Clone, Default)]
pub struct CommandSpawner {
    launcher: Vec<String>,
}

impl CommandSpawner {
    pub fn new(launcher: Option<&str>) -> Self {
        Self {
            launcher: launcher
                .map(|value| value.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        }
    }
}

impl Spawner for CommandSpawner {
    fn spawn(&self, program: &Path, args: &[String]) -> io::Result<Box<dyn ChildProcess>> {
        let mut command = match self.launcher.split_first() {
            Some((launcher, launcher_args)) => {
                let mut command = Command::new(launcher);
                command.args(launcher_args).arg(program);
                command
            }
            None => Command::new(program),
        };
        command.args(args).stdin(Stdio::null());
        let child = command.spawn()?;
        let pid = child.id().unwrap_or_default();
        Ok(Box::new(OsChild { pid, child }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub pid: u32,
    pub kind: ProcessKind,
    pub code: Option<i32>,
}

struct TrackedChild {
    kind: ProcessKind,
    child: Box<dyn ChildProcess>,
}

/// Children the hub started, keyed by pid. Reaping is polled.
pub struct ChildTracker {
    spawner: Arc<dyn Spawner>,
    children: Mutex<BTreeMap<u32, TrackedChild>>,
}

impl ChildTracker {
    pub fn new(spawner: Arc<dyn Spawner>) -> Self {
        Self {
            spawner,
            children: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn spawn(&self, kind: ProcessKind, program: &Path, args: &[String]) -> io::Result<u32> {
        let child = self.spawner.spawn(program, args)?;
        info!(
            event = "hub_child_spawned",
            kind = %kind,
            pid = child.pid(),
            program = %program.display()
        );
        Ok(self.track(kind, child))
    }

    pub fn track(&self, kind: ProcessKind, child: Box<dyn ChildProcess>) -> u32 {
        let pid = child.pid();
        self.lock().insert(pid, TrackedChild { kind, child });
        pid
    }

    /// Removes and returns every child that has exited since the last call.
    pub fn reap(&self) -> Vec<ChildExit> {
        let mut children = self.lock();
        let mut exited = Vec::new();
        for (pid, tracked) in children.iter_mut() {
            match tracked.child.try_exit() {
                Ok(Some(code)) => exited.push(ChildExit {
                    pid: *pid,
                    kind: tracked.kind,
                    code,
                }),
                Ok(None) => {}
                Err(err) => {
                    warn!(event = "hub_child_wait_error", pid = *pid, error = %err);
                    exited.push(ChildExit {
                        pid: *pid,
                        kind: tracked.kind,
                        code: None,
                    });
                }
            }
        }
        for exit in &exited {
            children.remove(&exit.pid);
            info!(
                event = "hub_child_exited",
                pid = exit.pid,
                kind = %exit.kind,
                code = ?exit.code
            );
        }
        exited
    }

    /// Signals every child; they stay tracked until reaped.
    pub fn kill_all(&self) -> usize {
        let mut children = self.lock();
        for (pid, tracked) in children.iter_mut() {
            if let Err(err) = tracked.child.kill() {
                warn!(event = "hub_child_kill_error", pid = *pid, error = %err);
            }
        }
        children.len()
    }

    pub fn contains(&self, kind: ProcessKind) -> bool {
        self.lock().values().any(|tracked| tracked.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u32, TrackedChild>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
