//! Thin wrappers over the raw `mach2` bindings shared by every subsystem.
//!
//! Nothing here is specific to thread hijacking: it's the same flat
//! re-export-plus-`Result` treatment `other_examples`' minidump-writer
//! applies to `mach2` (`mach_helpers.rs`), generalized the way `rd`'s
//! `bindings/` module wraps raw ptrace/libc constants for the rest of the
//! crate to build on.

pub mod error;
pub mod port;

use mach2::traps::mach_task_self;

pub use error::{kr_result, KernelError};
pub use port::{Port, PortDisposition};

pub use mach2::kern_return::kern_return_t;
pub use mach2::mach_types::{task_t, thread_act_t};
pub use mach2::message::mach_msg_type_name_t;
pub use mach2::port::mach_port_name_t;
pub use mach2::vm_types::mach_vm_address_t;

extern "C" {
    // Not part of the public Mach API surface (and so not in `mach2`
    // itself), but present in every libSystem; every Mach debugging tool
    // declares it by hand the same way.
    fn task_for_pid(target: task_t, pid: libc::c_int, task: *mut task_t) -> kern_return_t;
}

/// Resolve a task port for `pid`, the entry point every external caller
/// (the CLI, the seed tests) uses to get from "a pid" to a `target_task_local`.
pub fn task_for_pid_local(pid: i32) -> Result<task_t, KernelError> {
    let mut task: task_t = 0;
    let kr = unsafe { task_for_pid(mach_task_self(), pid, &mut task) };
    kr_result(kr)?;
    Ok(task)
}
