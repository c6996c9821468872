//! The execution handle (§3): the aggregate root threaded through every
//! public operation, its builder, and its ordered tear-down.
//!
//! Grounded in `threadexec_base.c`'s field set (`task`/`task_remote`,
//! `thread`/`thread_remote`) and `tx_deinit_with_thread_api`'s tear-down
//! order, reshaped the way `rd`'s `ThreadGroup` centralizes lifecycle with
//! an explicit `Drop` impl — except ownership here is single-rooted (one
//! handle, one thread, one shared region), so no `Rc<RefCell<..>>` is
//! needed: the `Port`/`SharedMemory` RAII wrappers are scope guards in their
//! own right, and `Drop` on `ExecHandle` just runs them in the right order.

use mach2::mach_types::{task_t, thread_act_t};
use mach2::port::mach_port_name_t;

use crate::acquire::{self, AcquiredThread};
use crate::arch::{self, ArchDriver, ArchKind, StackPair};
use crate::call::{CallArg, CallOutcome};
use crate::error::{AcquisitionError, Result, StagingError, ThreadexecError};
use crate::flags::{Config, PolicyFlags};
use crate::mach::Port;
use crate::stage::{self, BootstrapPorts, SharedMemory};
use crate::transfer::{self, Disposition};

/// Where a handle sits in its lifecycle (§3's `{READY, IN_CALL,
/// TORN_DOWN}`), tracked so `call()` can enforce "exactly one call in
/// flight" and `Drop` can make destruction idempotent.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Ready,
    InCall,
    TornDown,
}

/// Which of the three strategies in §4.C produced this handle's thread,
/// recorded so tear-down can run the "reverse acquisition order" rule from
/// §3's Lifecycle without re-deriving it from flags.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum AcquisitionPath {
    Direct,
    HijackConsume,
    HijackBootstrapSpawn,
}

/// The opaque object threaded through every public operation (§3).
pub struct ExecHandle {
    target_task_local: task_t,
    target_task_remote: u64,
    thread: AcquiredThread,
    bootstrap: BootstrapPorts,
    shmem: SharedMemory,
    scratch: SharedMemory,
    driver: Box<dyn ArchDriver>,
    path: AcquisitionPath,
    state: State,
}

/// Constructs an `ExecHandle` per one of §4.C's three strategies.
pub struct ExecHandleBuilder {
    target_task_local: task_t,
    architecture_kind: ArchKind,
    config: Config,
    thread: Option<mach_port_name_t>,
    flags: PolicyFlags,
}

impl ExecHandleBuilder {
    pub fn new(target_task_local: task_t, architecture_kind: ArchKind) -> ExecHandleBuilder {
        ExecHandleBuilder {
            target_task_local,
            architecture_kind,
            config: crate::flags::global(),
            thread: None,
            flags: PolicyFlags::empty(),
        }
    }

    pub fn with_config(mut self, config: Config) -> ExecHandleBuilder {
        self.config = config;
        self
    }

    /// Supply a thread explicitly (the `Direct` strategy). Mutually
    /// exclusive with `with_kill_task` at build time.
    pub fn with_thread(mut self, thread: mach_port_name_t, flags: PolicyFlags) -> ExecHandleBuilder {
        self.thread = Some(thread);
        self.flags = flags;
        self
    }

    /// Request the `Hijack-consume` strategy: no thread supplied, task is
    /// doomed.
    pub fn with_kill_task(mut self) -> ExecHandleBuilder {
        self.flags = PolicyFlags::KILL_TASK;
        self
    }

    pub fn build(self) -> Result<ExecHandle> {
        let driver = arch::build(self.architecture_kind, &self.config);

        if let Some(thread) = self.thread {
            return build_direct(
                self.target_task_local,
                thread,
                self.flags,
                driver,
                &self.config,
            );
        }
        if self.flags.contains(PolicyFlags::KILL_TASK) {
            return build_hijack_consume(self.target_task_local, driver, &self.config);
        }
        build_hijack_bootstrap_spawn(self.target_task_local, driver, &self.config)
    }
}

/// Stage 0 + Stage 1 against whatever thread acquisition already produced,
/// shared by all three construction strategies.
fn stage(
    target_task_local: task_t,
    thread_local: thread_act_t,
    driver: &dyn ArchDriver,
    config: &Config,
) -> Result<(BootstrapPorts, SharedMemory, SharedMemory, u64)> {
    // A tiny scratch region, mapped directly (no remote call needed; see
    // `stage.rs` module docs) so Stage 0's register-only calls have
    // somewhere to write an out-parameter and somewhere to push a stack.
    let scratch = SharedMemory::map(target_task_local, config.scratch_stack_size)
        .map_err(ThreadexecError::Staging)?;

    // `target_task_remote`: the remote's own self-task send right, obtained
    // via a register-only call before any other staging exists.
    let target_task_remote = crate::call::call_registers_only_with_stack(
        driver,
        thread_local,
        mach2::traps::mach_task_self as usize as u64,
        &[],
        &scratch.as_stack(),
    )
    .map_err(|e| ThreadexecError::Staging(StagingError::PortPairing(wrap_call_error(e))))?;

    let bootstrap = stage::stage0_ports(driver, thread_local, target_task_local, target_task_remote, &scratch)
        .map_err(ThreadexecError::Staging)?;

    let shmem = stage::stage1_shared_memory(
        driver,
        thread_local,
        target_task_local,
        target_task_remote,
        &scratch,
        config.shmem_size,
    )
    .map_err(ThreadexecError::Staging)?;

    Ok((bootstrap, shmem, scratch, target_task_remote))
}

fn wrap_call_error(e: crate::error::CallError) -> crate::error::KernelCallError {
    match e {
        crate::error::CallError::GetState(k)
        | crate::error::CallError::SetState(k)
        | crate::error::CallError::Resume(k)
        | crate::error::CallError::Suspend(k) => k,
        _ => crate::error::KernelCallError::new("mach_task_self(remote)", crate::mach::KernelError::Failure),
    }
}

fn build_direct(
    target_task_local: task_t,
    thread: mach_port_name_t,
    flags: PolicyFlags,
    driver: Box<dyn ArchDriver>,
    config: &Config,
) -> Result<ExecHandle> {
    let acquired =
        acquire::acquire_direct(driver.as_ref(), thread, flags).map_err(ThreadexecError::Acquisition)?;
    let (bootstrap, shmem, scratch, target_task_remote) =
        match stage(target_task_local, acquired.port.name(), driver.as_ref(), config) {
            Ok(v) => v,
            Err(e) => {
                acquire::release(driver.as_ref(), &acquired);
                return Err(e);
            }
        };
    Ok(ExecHandle {
        target_task_local,
        target_task_remote,
        thread: acquired,
        bootstrap,
        shmem,
        scratch,
        driver,
        path: AcquisitionPath::Direct,
        state: State::Ready,
    })
}

fn build_hijack_consume(
    target_task_local: task_t,
    driver: Box<dyn ArchDriver>,
    config: &Config,
) -> Result<ExecHandle> {
    let acquired =
        acquire::acquire_hijack_consume(target_task_local).map_err(ThreadexecError::Acquisition)?;
    let (bootstrap, shmem, scratch, target_task_remote) =
        stage(target_task_local, acquired.port.name(), driver.as_ref(), config)?;
    Ok(ExecHandle {
        target_task_local,
        target_task_remote,
        thread: acquired,
        bootstrap,
        shmem,
        scratch,
        driver,
        path: AcquisitionPath::HijackConsume,
        state: State::Ready,
    })
}

fn build_hijack_bootstrap_spawn(
    target_task_local: task_t,
    driver: Box<dyn ArchDriver>,
    config: &Config,
) -> Result<ExecHandle> {
    // Step 1/2: pick a candidate thread H, suspend and preserve its state,
    // and stage fully through it so the handle is "temporarily READY" on H.
    let (hijack, saved) = acquire::pick_and_suspend_for_staging(driver.as_ref(), target_task_local)
        .map_err(ThreadexecError::Acquisition)?;

    let staged = stage(target_task_local, hijack, driver.as_ref(), config);
    let (bootstrap, shmem, scratch, target_task_remote) = match staged {
        Ok(v) => v,
        Err(e) => {
            acquire::restore_and_release_staging_thread(driver.as_ref(), hijack, &saved);
            return Err(e);
        }
    };

    // Steps 3-5: spawn, translate, extract, through the same H we just
    // staged through. Reuses the already-staged shared memory directly
    // rather than re-deriving it.
    let spawned =
        acquire::spawn_via_hijacked_thread(driver.as_ref(), hijack, target_task_local, &shmem, &scratch);

    // Step 6: restore and release H regardless of spawn outcome; H is never
    // touched again after this.
    acquire::restore_and_release_staging_thread(driver.as_ref(), hijack, &saved);

    let spawned = spawned.map_err(ThreadexecError::Acquisition)?;

    // Step 8: bootstrap TLS on the new thread via the platform's "set self"
    // hook, a register-only call since it takes one pointer-sized argument.
    // Mirrors `init_without_thread`'s explicit check on this exact call: a
    // failed bootstrap means the new thread can't be trusted to run further
    // calls correctly, so acquisition fails rather than handing back a
    // half-initialized handle.
    if let Err(e) = crate::call::call_registers_only_with_stack(
        driver.as_ref(),
        spawned.acquired.port.name(),
        pthread_set_self as usize as u64,
        &[spawned.pthread_remote],
        &scratch.as_stack(),
    ) {
        acquire::release(driver.as_ref(), &spawned.acquired);
        return Err(ThreadexecError::Acquisition(AcquisitionError::TlsBootstrapFailed(e)));
    }

    Ok(ExecHandle {
        target_task_local,
        target_task_remote,
        thread: spawned.acquired,
        bootstrap,
        shmem,
        scratch,
        driver,
        path: AcquisitionPath::HijackBootstrapSpawn,
        state: State::Ready,
    })
}

extern "C" {
    #[link_name = "_pthread_set_self"]
    fn pthread_set_self(thread: u64);
}

impl ExecHandle {
    pub fn target_task_local(&self) -> task_t {
        self.target_task_local
    }

    pub fn target_task_remote(&self) -> u64 {
        self.target_task_remote
    }

    pub fn thread_local(&self) -> thread_act_t {
        self.thread.port.name()
    }

    pub fn bootstrap_port_local(&self) -> mach_port_name_t {
        self.bootstrap.local.name()
    }

    pub fn bootstrap_port_remote(&self) -> mach_port_name_t {
        self.bootstrap.remote_name
    }

    /// The one synchronous call primitive (§6). Marshals `args` through
    /// shared memory, drives the call, and returns the decoded outcome.
    /// Enforces single-in-flight-call via `&mut self` (§5): the borrow
    /// checker statically rules out a second concurrent call on the same
    /// handle.
    pub fn call(
        &mut self,
        function: u64,
        args: &[CallArg],
        result_width: usize,
    ) -> Result<CallOutcome> {
        if self.state == State::TornDown {
            return Err(ThreadexecError::TornDown);
        }
        if self.state == State::InCall {
            return Err(ThreadexecError::CallInProgress);
        }
        self.state = State::InCall;
        let outcome = crate::call::marshal_and_call(
            self.driver.as_ref(),
            self.thread.port.name(),
            function,
            args,
            result_width,
            Some(&self.shmem),
        );
        // Per §7: a failed call leaves the handle READY if the thread is
        // still suspended and readable; our driver only returns LostThread
        // when that's not the case, so we treat every other failure as
        // recoverable and every LostThread as a permanent move to
        // TORN_DOWN-adjacent (the caller must destroy the handle; we can't
        // force that here, so we just refuse further calls).
        match &outcome {
            Ok(_) => self.state = State::Ready,
            Err(crate::error::CallError::LostThread) => self.state = State::TornDown,
            Err(_) => self.state = State::Ready,
        }
        outcome.map_err(ThreadexecError::Call)
    }

    /// Insert a local right into the target's IPC space (§4.E).
    pub fn insert_right(&self, local_name: mach_port_name_t, disposition: Disposition) -> Result<()> {
        if self.state == State::TornDown {
            return Err(ThreadexecError::TornDown);
        }
        transfer::insert_right(
            self.driver.as_ref(),
            self.thread.port.name(),
            self.target_task_remote,
            local_name,
            disposition,
            &self.scratch.as_stack(),
        )
        .map_err(ThreadexecError::Call)
    }

    /// Extract a remote right into the local IPC space (§4.E). Direct
    /// kernel call; does not touch the remote thread.
    pub fn extract_right(&self, remote_name: mach_port_name_t, disposition: Disposition) -> Result<Port> {
        if self.state == State::TornDown {
            return Err(ThreadexecError::TornDown);
        }
        transfer::extract_right(self.target_task_local, remote_name, disposition)
            .map_err(|e| ThreadexecError::Call(crate::error::CallError::GetState(
                crate::error::KernelCallError::new("mach_port_extract_right", e),
            )))
    }

    /// Extract a remote file descriptor into a local one (§4.E).
    pub fn file_extract(&self, remote_fd: i32) -> Result<i32> {
        if self.state == State::TornDown {
            return Err(ThreadexecError::TornDown);
        }
        transfer::file_extract(
            self.driver.as_ref(),
            self.thread.port.name(),
            self.target_task_local,
            &self.shmem,
            remote_fd,
        )
        .map_err(ThreadexecError::Call)
    }

    /// Insert a local file descriptor as a remote one (§4.E, supplemented).
    pub fn file_insert(&self, local_fd: i32) -> Result<i32> {
        if self.state == State::TornDown {
            return Err(ThreadexecError::TornDown);
        }
        transfer::file_insert(
            self.driver.as_ref(),
            self.thread.port.name(),
            self.target_task_remote,
            &self.scratch.as_stack(),
            local_fd,
        )
        .map_err(ThreadexecError::Call)
    }

    /// `open()` in the remote, optionally extracting a local descriptor
    /// (§4.E, §8 seed test 4).
    pub fn file_open(
        &self,
        path: &str,
        oflag: i32,
        mode: u32,
        want_local: bool,
    ) -> Result<(i32, Option<i32>)> {
        if self.state == State::TornDown {
            return Err(ThreadexecError::TornDown);
        }
        transfer::file_open(
            self.driver.as_ref(),
            self.thread.port.name(),
            self.target_task_local,
            &self.shmem,
            path,
            oflag,
            mode,
            want_local,
        )
        .map_err(ThreadexecError::Call)
    }

    /// Tear down exactly once; idempotent per §8's "destroying a handle is
    /// safe when invoked multiple times" invariant. `Drop` calls this, and
    /// it's also callable directly for explicit early destruction.
    pub fn teardown(&mut self) {
        if self.state == State::TornDown {
            return;
        }
        self.state = State::TornDown;

        let kill_task = self.thread.flags.contains(PolicyFlags::KILL_TASK);

        // Reverse acquisition order (§3 Lifecycle): remote shared memory
        // first (skipped under KILL_TASK), then paired ports, then
        // restore/resume/terminate the thread, then release task/thread
        // references (handled by the `Port`/`SharedMemory` `Drop` impls
        // once this function returns).
        if !kill_task {
            if let Err(e) = stage::teardown_remote(
                self.driver.as_ref(),
                self.thread.port.name(),
                self.target_task_remote,
                &self.shmem,
                &self.scratch.as_stack(),
            ) {
                log::warn!("failed to deallocate remote shared memory: {:?}", e);
            }
        }
        self.shmem.unmap_local();
        self.scratch.unmap_local();

        // Bootstrap ports are released by `Port::drop` when `self.bootstrap`
        // is dropped at the end of this struct's lifetime; nothing further
        // to do here beyond what `acquire::release` does for the thread.
        acquire::release(self.driver.as_ref(), &self.thread);

        let _ = self.path;
    }
}

impl Drop for ExecHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_enum_equality() {
        assert_eq!(State::Ready, State::Ready);
        assert_ne!(State::Ready, State::InCall);
    }
}
