//! Child-pool supervision: pre-spawn, reap, respawn, tear down.
//!
//! The supervisor owns the child table. Children are forked, build their own
//! jail, and back-connect to the master; the reaper notices exits with a
//! non-blocking wait and keeps the pool warm until shutdown begins.

use crate::config::types::{ChildId, GatewayError, Result};
use crate::config::GatewayConfig;
use crate::core::childmain;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Set by the termination signal handler; the reaper polls it.
pub static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// How often the reaper polls for dead children and pool shortfall.
const REAP_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildState {
    /// Forked but not yet back-connected.
    Pending,
    /// Back-connected and waiting for a client.
    Available,
    /// Assigned to a client session.
    InUse,
    /// Observed dead; removed from the table immediately after.
    Dead,
}

#[derive(Debug)]
pub struct ChildEntry {
    pub child_id: ChildId,
    pub pid: Pid,
    pub state: ChildState,
}

/// Combine two rng draws into a nonzero, odd child identifier.
pub fn generate_child_id(rng: &mut fastrand::Rng) -> ChildId {
    ((rng.u32(..) as u64) << 32 | rng.u32(..) as u64) | 1
}

pub struct Supervisor {
    config: GatewayConfig,
    children: Mutex<HashMap<i32, ChildEntry>>,
    rng: Mutex<fastrand::Rng>,
    shutdown_tx: Sender<()>,
    shutdown_rx: Receiver<()>,
}

impl Supervisor {
    pub fn new(config: GatewayConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = bounded(1);
        Self {
            config,
            children: Mutex::new(HashMap::new()),
            rng: Mutex::new(fastrand::Rng::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    fn next_child_id(&self) -> ChildId {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        generate_child_id(&mut rng)
    }

    /// Fork one child. The child process never returns from here.
    pub fn spawn_child(&self) -> Result<ChildId> {
        let child_id = self.next_child_id();
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let code = childmain::child_main(&self.config, child_id);
                std::process::exit(code);
            }
            Ok(ForkResult::Parent { child }) => {
                let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
                children.insert(
                    child.as_raw(),
                    ChildEntry {
                        child_id,
                        pid: child,
                        state: ChildState::Pending,
                    },
                );
                info!("spawned child {child_id} as pid {child}");
                Ok(child_id)
            }
            Err(err) => Err(GatewayError::Process(format!("fork failed: {err}"))),
        }
    }

    /// Fork the initial pool.
    pub fn pre_spawn(&self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.spawn_child()?;
        }
        Ok(())
    }

    /// A child back-connected and claimed its identity.
    pub fn mark_connected(&self, child_id: ChildId) {
        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        match children
            .values_mut()
            .find(|entry| entry.child_id == child_id)
        {
            Some(entry) => entry.state = ChildState::Available,
            None => warn!("unknown child {child_id} claimed an identity"),
        }
    }

    /// A child was assigned to a client session.
    pub fn mark_in_use(&self, child_id: ChildId) {
        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = children
            .values_mut()
            .find(|entry| entry.child_id == child_id)
        {
            entry.state = ChildState::InUse;
        }
    }

    /// ToPrisoner sessions not currently assigned to a client.
    pub fn available_child_sessions(&self) -> usize {
        let children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        children
            .values()
            .filter(|entry| entry.state == ChildState::Available)
            .count()
    }

    /// Children forked but not yet back-connected.
    pub fn pending_pre_spawned(&self) -> usize {
        let children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        children
            .values()
            .filter(|entry| entry.state == ChildState::Pending)
            .count()
    }

    fn child_count(&self) -> usize {
        self.children.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn retire(&self, pid: Pid, detail: &str) {
        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        match children.remove(&pid.as_raw()) {
            Some(mut entry) => {
                entry.state = ChildState::Dead;
                info!("child {} (pid {pid}) died: {detail}", entry.child_id);
            }
            None => warn!("reaped unknown pid {pid}: {detail}"),
        }
    }

    /// Wake the reaper and begin tearing the pool down.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.try_send(());
    }

    /// Send a termination request to every live child. The reaper collects
    /// them; no acknowledgment is awaited beyond that.
    pub fn terminate_children(&self) {
        let children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        for entry in children.values() {
            info!(
                "requesting child {} (pid {}) to terminate",
                entry.child_id, entry.pid
            );
            if let Err(err) = kill(entry.pid, Signal::SIGTERM) {
                warn!("kill({}) failed: {err}", entry.pid);
            }
        }
    }

    /// Reap dead children, keep the pool warm, and run until the table is
    /// empty. Any terminal wait status counts as death.
    pub fn reaper_loop(&self) {
        let mut terminating = false;
        loop {
            loop {
                match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) => break,
                    Ok(WaitStatus::Exited(pid, code)) => {
                        self.retire(pid, &format!("exit code {code}"));
                    }
                    Ok(WaitStatus::Signaled(pid, signal, _)) => {
                        self.retire(pid, &format!("signal {}", signal as i32));
                    }
                    Ok(_) => continue, // stopped or continued, not terminal
                    Err(Errno::EINTR) => continue,
                    Err(Errno::ECHILD) => {
                        if self.child_count() > 0 {
                            warn!("child table is non-empty but no children to wait for");
                        }
                        break;
                    }
                    Err(err) => {
                        error!("waitpid failed: {err}");
                        break;
                    }
                }
            }

            if !terminating
                && (SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
                    || self.shutdown_rx.try_recv().is_ok())
            {
                info!("shutdown requested, terminating children");
                terminating = true;
                self.terminate_children();
            }

            if !terminating
                && self.available_child_sessions() == 0
                && self.pending_pre_spawned() == 0
            {
                info!("no available child session, forking a new one");
                if let Err(err) = self.spawn_child() {
                    error!("unable to replenish the child pool: {err}");
                    terminating = true;
                    self.terminate_children();
                }
            }

            if self.child_count() == 0 {
                break;
            }

            match self.shutdown_rx.recv_timeout(REAP_INTERVAL) {
                Ok(()) => {
                    if !terminating {
                        info!("shutdown requested, terminating children");
                        terminating = true;
                        self.terminate_children();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    std::thread::sleep(REAP_INTERVAL);
                }
            }
        }
        info!("child table empty, reaper exiting");
    }
}
