//! A remote code execution primitive for Mach tasks.
//!
//! Given a send right to another task's Mach port (and, optionally, one of
//! its thread ports), this crate builds an [`ExecHandle`] capable of driving
//! arbitrary function calls inside that task: it hijacks or adopts a thread,
//! stages a paired bootstrap port and a dual-mapped shared-memory region
//! between the two tasks, and from then on marshals calls through that
//! channel the way a debugger marshals an expression evaluation.
//!
//! See [`ExecHandleBuilder`] for the three ways to acquire a handle, and
//! [`ExecHandle::call`] for the one call primitive everything else
//! (port/FD transfer, file I/O) is built from.

pub mod acquire;
pub mod arch;
pub mod call;
pub mod cli;
pub mod error;
pub mod flags;
pub mod handle;
pub mod log;
pub mod mach;
pub mod stage;
pub mod transfer;

pub use arch::ArchKind;
pub use call::{CallArg, CallOutcome};
pub use error::{
    AcquisitionError, CallError, KernelCallError, MarshalError, Result, StagingError,
    ThreadexecError,
};
pub use flags::{Config, PolicyFlags};
pub use handle::{ExecHandle, ExecHandleBuilder};
pub use mach::{task_for_pid_local, KernelError, Port, PortDisposition};
pub use transfer::Disposition;
