//! Process sandboxes.
//!
//! [`ProcessGroupSandbox`] runs each instance in its own session with
//! rlimits applied before exec. The process group id is the sandbox's handle
//! for signalling and enumeration.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("sandbox {0} has no process group")]
    NotStarted(String),

    #[error("principal operation failed: {0}")]
    Principal(String),
}

/// Limits applied to every process in a sandbox. Zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub memory_bytes: u64,
    pub nofile: u64,
    pub nproc: u64,
}

/// Persistable reference to a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub id: String,
    pub limits: SandboxLimits,
    pub process_group: Option<u32>,
}

/// What to run inside a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Terminate,
    Kill,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn create(&self, instance_id: &str, limits: SandboxLimits) -> Result<SandboxHandle, SandboxError>;

    /// Start `command` as the sandbox's leading process. Returns its pid.
    async fn spawn(&self, handle: &mut SandboxHandle, command: SandboxCommand) -> Result<u32, SandboxError>;

    fn signal(&self, handle: &SandboxHandle, signal: StopSignal) -> Result<(), SandboxError>;

    /// Live processes in the sandbox.
    fn processes(&self, handle: &SandboxHandle) -> Vec<u32>;

    /// Kill whatever is left and forget the sandbox.
    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;
}

/// Session/process-group sandbox with rlimits.
#[derive(Debug, Default)]
pub struct ProcessGroupSandbox;

impl ProcessGroupSandbox {
    pub fn new() -> Self {
        Self
    }
}

fn open_log(path: &Option<PathBuf>) -> io::Result<Stdio> {
    match path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Ok(Stdio::from(file))
        }
        None => Ok(Stdio::null()),
    }
}

#[cfg(target_os = "linux")]
fn apply_limits(limits: SandboxLimits) -> io::Result<()> {
    fn set_rlimit(resource: libc::__rlimit_resource_t, limit: u64) -> io::Result<()> {
        let lim = libc::rlimit {
            rlim_cur: limit as libc::rlim_t,
            rlim_max: limit as libc::rlim_t,
        };
        let rc = unsafe { libc::setrlimit(resource, &lim) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    set_rlimit(libc::RLIMIT_CORE, 0)?;
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    if limits.memory_bytes > 0 {
        set_rlimit(libc::RLIMIT_AS, limits.memory_bytes)?;
    }
    if limits.nofile > 0 {
        set_rlimit(libc::RLIMIT_NOFILE, limits.nofile)?;
    }
    if limits.nproc > 0 {
        set_rlimit(libc::RLIMIT_NPROC, limits.nproc)?;
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn apply_limits(_limits: SandboxLimits) -> io::Result<()> {
    Ok(())
}

#[async_trait]
impl Sandbox for ProcessGroupSandbox {
    async fn create(&self, instance_id: &str, limits: SandboxLimits) -> Result<SandboxHandle, SandboxError> {
        Ok(SandboxHandle {
            id: format!("dea-{instance_id}"),
            limits,
            process_group: None,
        })
    }

    async fn spawn(&self, handle: &mut SandboxHandle, command: SandboxCommand) -> Result<u32, SandboxError> {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.cwd)
            .env_clear()
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(open_log(&command.stdout)?)
            .stderr(open_log(&command.stderr)?);

        #[cfg(unix)]
        {
            if let Some(uid) = command.uid {
                cmd.uid(uid);
            }
            if let Some(gid) = command.gid {
                cmd.gid(gid);
            }
            let limits = handle.limits;
            unsafe {
                cmd.pre_exec(move || {
                    if libc::setsid() == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    apply_limits(limits)
                });
            }
        }

        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: command.program.display().to_string(),
            source,
        })?;
        let pid = child
            .id()
            .ok_or_else(|| SandboxError::NotStarted(handle.id.clone()))?;
        handle.process_group = Some(pid);

        let sandbox_id = handle.id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(sandbox = %sandbox_id, pid = pid, status = %status, "Sandbox leader exited"),
                Err(e) => warn!(sandbox = %sandbox_id, pid = pid, error = %e, "Failed to wait on sandbox leader"),
            }
        });

        info!(sandbox = %handle.id, pid = pid, "Started sandboxed process");
        Ok(pid)
    }

    fn signal(&self, handle: &SandboxHandle, signal: StopSignal) -> Result<(), SandboxError> {
        let Some(pgid) = handle.process_group else {
            return Ok(());
        };
        #[cfg(unix)]
        {
            let signo = match signal {
                StopSignal::Terminate => libc::SIGTERM,
                StopSignal::Kill => libc::SIGKILL,
            };
            let rc = unsafe { libc::kill(-(pgid as i32), signo) };
            if rc == -1 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(err.into());
                }
            }
        }
        debug!(sandbox = %handle.id, pgid = pgid, signal = ?signal, "Signalled sandbox");
        Ok(())
    }

    fn processes(&self, handle: &SandboxHandle) -> Vec<u32> {
        let Some(pgid) = handle.process_group else {
            return Vec::new();
        };
        process_group_members(pgid)
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        if !self.processes(handle).is_empty() {
            self.signal(handle, StopSignal::Kill)?;
        }
        debug!(sandbox = %handle.id, "Destroyed sandbox");
        Ok(())
    }
}

/// Fields of `/proc/<pid>/stat` the agent uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: u32,
    pub state: char,
    pub pgrp: u32,
    pub utime: u64,
    pub stime: u64,
    pub rss_pages: u64,
}

/// Parse one `/proc/<pid>/stat` line.
///
/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`.
pub fn parse_proc_stat(content: &str) -> Option<ProcStat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let pid = content[..open].trim().parse().ok()?;
    let fields: Vec<&str> = content[close + 1..].split_whitespace().collect();
    // fields[0] is state (field 3 of the full line).
    Some(ProcStat {
        pid,
        state: fields.first()?.chars().next()?,
        pgrp: fields.get(2)?.parse().ok()?,
        utime: fields.get(11)?.parse().ok()?,
        stime: fields.get(12)?.parse().ok()?,
        rss_pages: fields.get(21)?.parse().ok()?,
    })
}

/// Every live process in `/proc`.
pub fn read_proc_stats() -> Vec<ProcStat> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|e| std::fs::read_to_string(e.path().join("stat")).ok())
        .filter_map(|content| parse_proc_stat(&content))
        .filter(|stat| stat.state != 'Z')
        .collect()
}

fn process_group_members(pgid: u32) -> Vec<u32> {
    #[cfg(target_os = "linux")]
    {
        read_proc_stats()
            .into_iter()
            .filter(|s| s.pgrp == pgid)
            .map(|s| s.pid)
            .collect()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let alive = unsafe { libc::kill(-(pgid as i32), 0) } == 0;
        if alive {
            vec![pgid]
        } else {
            Vec::new()
        }
    }
}

/// In-memory sandbox for tests and dry runs.
#[derive(Debug, Default)]
pub struct MockSandbox {
    next_pid: AtomicU32,
    alive: Mutex<HashMap<String, u32>>,
    destroyed: Mutex<HashSet<String>>,
    fail_spawn: bool,
}

impl MockSandbox {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(10_000),
            ..Self::default()
        }
    }

    /// A sandbox whose spawns always fail.
    pub fn failing() -> Self {
        Self {
            fail_spawn: true,
            ..Self::new()
        }
    }

    /// Simulate every process in the sandbox dying.
    pub fn kill_all(&self, sandbox_id: &str) {
        self.alive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(sandbox_id);
    }

    pub fn is_destroyed(&self, sandbox_id: &str) -> bool {
        self.destroyed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(sandbox_id)
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    async fn create(&self, instance_id: &str, limits: SandboxLimits) -> Result<SandboxHandle, SandboxError> {
        Ok(SandboxHandle {
            id: format!("mock-{instance_id}"),
            limits,
            process_group: None,
        })
    }

    async fn spawn(&self, handle: &mut SandboxHandle, command: SandboxCommand) -> Result<u32, SandboxError> {
        if self.fail_spawn {
            return Err(SandboxError::Spawn {
                program: command.program.display().to_string(),
                source: io::Error::other("mock sandbox configured to fail"),
            });
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        handle.process_group = Some(pid);
        self.alive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id.clone(), pid);
        Ok(pid)
    }

    fn signal(&self, handle: &SandboxHandle, _signal: StopSignal) -> Result<(), SandboxError> {
        self.kill_all(&handle.id);
        Ok(())
    }

    fn processes(&self, handle: &SandboxHandle) -> Vec<u32> {
        self.alive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle.id)
            .map(|pid| vec![*pid])
            .unwrap_or_default()
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.kill_all(&handle.id);
        self.destroyed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id.clone());
        Ok(())
    }
}
