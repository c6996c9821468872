//! Policy flags and tunable configuration.
//!
//! `PolicyFlags` is the bitset from the data model (§3): the caller chooses
//! how a handle's thread is acquired and torn down. `Config` is the ambient
//! tuning knobs (poll cadence, shared-memory size, ...) a policy
//! implementation supplies, modeled the way `rd`'s
//! `flags.rs` exposes a single `Flags` struct behind a `lazy_static!` global
//! and a `Flags::get()` accessor, except here the global is populated from
//! sane defaults rather than left `unimplemented!()`, since this is ambient
//! infrastructure a complete repo must actually run with.

use std::time::Duration;

bitflags::bitflags! {
    /// Caller-chosen lifecycle policy for a thread acquired by an
    /// `ExecHandle`.
    ///
    /// See §3 and §6 of the design for the full semantics of each flag and
    /// their mutual-exclusion rules (validated in
    /// [`PolicyFlags::validate`]).
    #[derive(Default)]
    pub struct PolicyFlags: u32 {
        /// Suspend the thread on entry.
        const SUSPEND     = 1 << 0;
        /// Snapshot register state on entry and restore it at tear-down.
        const PRESERVE    = 1 << 1;
        /// Resume the thread at tear-down.
        const RESUME      = 1 << 2;
        /// Terminate the thread at tear-down.
        const KILL_THREAD = 1 << 3;
        /// The task is doomed; skip remote cleanup that would otherwise be
        /// required.
        const KILL_TASK   = 1 << 4;
    }
}

impl PolicyFlags {
    /// Per §3: KILL_TASK and the per-thread restoration flags are mutually
    /// exclusive, because KILL_TASK means the task (and therefore the
    /// thread) is doomed regardless of what we'd otherwise do to it.
    pub fn validate(self) -> Result<(), crate::error::AcquisitionError> {
        let per_thread = PolicyFlags::SUSPEND
            | PolicyFlags::PRESERVE
            | PolicyFlags::RESUME
            | PolicyFlags::KILL_THREAD;
        if self.contains(PolicyFlags::KILL_TASK) && self.intersects(per_thread) {
            return Err(crate::error::AcquisitionError::IncompatibleFlags(self));
        }
        Ok(())
    }
}

/// Tunables for the call engine and staging, with defaults suited to
/// interactive use and overridable from the CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Size of the dual-mapped shared memory region (§4.B Stage 1).
    /// Minimum one page; 16 KiB is the conservative default that covers
    /// typical marshalled buffers without frequent re-partitioning.
    pub shmem_size: usize,
    /// Initial delay between completion-detection polls.
    pub poll_interval: Duration,
    /// Ceiling the poll backoff grows to.
    pub poll_backoff_ceiling: Duration,
    /// Bound on the linear scan used to discover the x86-64 `jmp *reg`
    /// gadget, mirroring the original's `0x4000 * 128` byte scan window.
    pub gadget_scan_bytes: usize,
    /// Stack reserved for gadget-adjacent scratch calls and for the
    /// tear-down call that frees the shared region (Design Notes §9 Open
    /// Question (a)).
    pub scratch_stack_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            shmem_size: 16 * 1024,
            poll_interval: Duration::from_micros(200),
            poll_backoff_ceiling: Duration::from_millis(10),
            gadget_scan_bytes: 0x4000 * 128,
            scratch_stack_size: 64 * 1024,
        }
    }
}

lazy_static::lazy_static! {
    static ref CONFIG: std::sync::RwLock<Config> = std::sync::RwLock::new(Config::default());
}

/// The process-wide configuration. Individual handles may override specific
/// fields via `ExecHandleBuilder::with_config`; this global only supplies
/// the default any builder starts from.
pub fn global() -> Config {
    CONFIG.read().unwrap().clone()
}

/// Replace the process-wide default configuration, e.g. from CLI flags.
pub fn set_global(config: Config) {
    *CONFIG.write().unwrap() = config;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_task_excludes_per_thread_flags() {
        let flags = PolicyFlags::KILL_TASK | PolicyFlags::RESUME;
        assert!(flags.validate().is_err());
    }

    #[test]
    fn kill_task_alone_is_valid() {
        assert!(PolicyFlags::KILL_TASK.validate().is_ok());
    }

    #[test]
    fn preserve_suspend_resume_is_valid() {
        let flags = PolicyFlags::SUSPEND | PolicyFlags::PRESERVE | PolicyFlags::RESUME;
        assert!(flags.validate().is_ok());
    }
}
