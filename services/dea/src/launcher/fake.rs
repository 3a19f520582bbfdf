//! In-process launcher for tests and dry runs.
//!
//! Each launched instance is backed by a real loopback listener, so port
//! readiness checks behave as they would against an application.

use std::collections::HashMap;
use std::io;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{InstanceLauncher, LaunchError, LaunchHandles, SandboxHandle, SandboxLimits};
use crate::instance::InstanceRecord;

#[derive(Debug)]
pub struct FakeLauncher {
    runtimes: Vec<String>,
    listeners: Mutex<HashMap<String, TcpListener>>,
    fail_launch: AtomicBool,
    launch_delay_ms: AtomicU64,
    next_pid: AtomicU32,
    launches: AtomicUsize,
    stops: AtomicUsize,
    releases: AtomicUsize,
}

impl FakeLauncher {
    pub fn new(runtimes: &[&str]) -> Self {
        Self {
            runtimes: runtimes.iter().map(|r| r.to_string()).collect(),
            listeners: Mutex::new(HashMap::new()),
            fail_launch: AtomicBool::new(false),
            launch_delay_ms: AtomicU64::new(0),
            next_pid: AtomicU32::new(20_000),
            launches: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<String, TcpListener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every following launch fail.
    pub fn fail_launches(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    /// Hold every following launch for `delay` before it builds anything.
    pub fn delay_launches(&self, delay: Duration) {
        self.launch_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Simulate the instance's process dying.
    pub fn kill(&self, instance_id: &str) {
        self.listeners().remove(instance_id);
    }

    pub fn is_running(&self, instance_id: &str) -> bool {
        self.listeners().contains_key(instance_id)
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceLauncher for FakeLauncher {
    fn supports_runtime(&self, runtime: &str) -> bool {
        self.runtimes.iter().any(|r| r == runtime)
    }

    async fn launch(&self, record: &InstanceRecord, handles: &mut LaunchHandles) -> Result<(), LaunchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let delay = self.launch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        handles.sandbox = Some(SandboxHandle {
            id: format!("fake-{}", record.instance_id),
            limits: SandboxLimits {
                memory_bytes: record.mem_quota_bytes,
                nofile: record.fds_quota,
                nproc: 0,
            },
            process_group: None,
        });
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(LaunchError::Extract(io::Error::other("launch failure injected")));
        }

        let listener = TcpListener::bind((record.host.as_str(), 0)).map_err(LaunchError::Port)?;
        let port = listener.local_addr().map_err(LaunchError::Port)?.port();
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        if let Some(sandbox) = handles.sandbox.as_mut() {
            sandbox.process_group = Some(pid);
        }
        handles.port = Some(port);
        handles.process_id = Some(pid);
        self.listeners().insert(record.instance_id.clone(), listener);
        Ok(())
    }

    async fn stop_process(&self, record: &InstanceRecord) -> Result<(), LaunchError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.kill(&record.instance_id);
        Ok(())
    }

    async fn release_sandbox(&self, record: &mut InstanceRecord) -> Result<(), LaunchError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.kill(&record.instance_id);
        record.sandbox = None;
        record.plugin = None;
        record.principal = None;
        record.process_id = None;
        Ok(())
    }

    fn process_alive(&self, record: &InstanceRecord) -> bool {
        self.is_running(&record.instance_id)
    }

    async fn recover(&self, record: &mut InstanceRecord) -> Result<bool, LaunchError> {
        Ok(self.is_running(&record.instance_id))
    }
}
