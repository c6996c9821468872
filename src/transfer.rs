//! Port / FD transfer (§4.E).
//!
//! Two asymmetric primitives, grounded in how Mach actually treats the two
//! directions: *extracting* a right from a task we hold a send right to is
//! a direct, ordinary kernel call (`mach_port_extract_right` accepts a
//! foreign `task` argument as the *source* and always lands the result in
//! the caller's own space) -- no remote execution needed. *Inserting* a
//! right into another task's IPC space is the operation that is restricted
//! to a task operating on itself, which is exactly why this whole crate
//! exists: we drive the remote thread to call `mach_port_insert_right`
//! itself, to hand it the controller's own send right into the target's
//! IPC space.
//!
//! File descriptor transfer (`file_extract`/`file_open`) is grounded
//! directly in `original_source/threadexec_file.c`; `file_insert`'s
//! direction is left `NOT IMPLEMENTED` there but is specified as a required
//! operation (§6), so it is implemented symmetrically here.

use mach2::mach_types::{task_t, thread_act_t};
use mach2::message::mach_msg_type_name_t;
use mach2::port::mach_port_name_t;
use mach2::traps::mach_task_self;

use crate::arch::ArchDriver;
use crate::call::{call_registers_only_with_stack, CallArg};
use crate::error::CallError;
use crate::mach::{kr_result, KernelError, Port, PortDisposition};
use crate::stage::SharedMemory;

/// Disposition requested when extracting a right, mirroring
/// `MACH_MSG_TYPE_*` in `<mach/message.h>`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Disposition {
    CopySend,
    MoveSend,
    MoveReceive,
}

impl Disposition {
    fn msg_type(self) -> mach_msg_type_name_t {
        match self {
            Disposition::CopySend => mach2::message::MACH_MSG_TYPE_COPY_SEND,
            Disposition::MoveSend => mach2::message::MACH_MSG_TYPE_MOVE_SEND,
            Disposition::MoveReceive => mach2::message::MACH_MSG_TYPE_MOVE_RECEIVE,
        }
    }
}

/// Extract `remote_name` (a right held by `target_task_local`) into our own
/// IPC space, with the requested disposition. Direct kernel call; no remote
/// execution.
pub fn extract_right(
    target_task_local: task_t,
    remote_name: mach_port_name_t,
    disposition: Disposition,
) -> Result<Port, KernelError> {
    let mut out_name: mach_port_name_t = 0;
    let mut out_type: mach_msg_type_name_t = 0;
    let kr = unsafe {
        mach2::mach_port::mach_port_extract_right(
            target_task_local,
            remote_name,
            disposition.msg_type(),
            &mut out_name,
            &mut out_type,
        )
    };
    kr_result(kr)?;
    let local_disposition = if disposition == Disposition::MoveReceive {
        PortDisposition::Receive
    } else {
        PortDisposition::Send
    };
    Ok(unsafe { Port::from_raw(out_name, local_disposition) })
}

/// Insert `local_name` (one of *our* rights) into the target's IPC space
/// under the same name value, via a remote call to
/// `mach_port_insert_right`. Used by staging to hand the target a send
/// right back to our bootstrap port, and exposed as the general "Insert"
/// operation on the handle.
pub fn insert_right(
    driver: &dyn ArchDriver,
    thread: thread_act_t,
    remote_task_remote: u64,
    local_name: mach_port_name_t,
    disposition: Disposition,
    scratch_stack: &crate::arch::StackPair,
) -> Result<(), CallError> {
    call_registers_only_with_stack(
        driver,
        thread,
        mach2::mach_port::mach_port_insert_right as usize as u64,
        &[
            remote_task_remote,
            local_name as u64,
            local_name as u64,
            disposition.msg_type() as u64,
        ],
        scratch_stack,
    )
    .map(|_| ())
}

// --- Fileport-based file descriptor transfer (threadexec_file.c) ---

extern "C" {
    fn fileport_makeport(fd: libc::c_int, port: *mut mach_port_name_t) -> libc::c_int;
    fn fileport_makefd(port: mach_port_name_t) -> libc::c_int;
}

/// Create a fileport from `remote_fd` in the target and reconstitute a
/// local file descriptor from it. Grounded in
/// `threadexec_file_extract`.
pub fn file_extract(
    driver: &dyn ArchDriver,
    thread: thread_act_t,
    target_task_local: task_t,
    shmem: &SharedMemory,
    remote_fd: i32,
) -> Result<i32, CallError> {
    let outcome = crate::call::marshal_and_call(
        driver,
        thread,
        fileport_makeport as usize as u64,
        &[
            CallArg::literal(remote_fd as u64, 4, true),
            CallArg::OutputBuffer {
                len: std::mem::size_of::<mach_port_name_t>(),
            },
        ],
        std::mem::size_of::<libc::c_int>(),
        Some(shmem),
    )?;
    if outcome.result as i32 != 0 {
        return Err(CallError::FunctionFailed {
            primitive: "fileport_makeport",
            code: outcome.result as i32 as i64,
        });
    }
    let fileport_bytes = &outcome.buffers[0];
    let fileport_remote_name = u32::from_ne_bytes(fileport_bytes[..4].try_into().unwrap());

    let fileport_local = extract_right(target_task_local, fileport_remote_name, Disposition::MoveSend)
        .map_err(|e| {
            CallError::GetState(crate::error::KernelCallError::new("mach_port_extract_right", e))
        })?;

    let fd = unsafe { fileport_makefd(fileport_local.name()) };
    if fd < 0 {
        return Err(CallError::FunctionFailed {
            primitive: "fileport_makefd",
            code: fd as i64,
        });
    }
    Ok(fd)
}

/// Make a fileport from a local `fd` and transfer it into the target,
/// reconstituting a remote file descriptor. The symmetric counterpart to
/// `file_extract`; `original_source` left this direction unimplemented.
pub fn file_insert(
    driver: &dyn ArchDriver,
    thread: thread_act_t,
    remote_task_remote: u64,
    scratch_stack: &crate::arch::StackPair,
    local_fd: i32,
) -> Result<i32, CallError> {
    let mut fileport_name: mach_port_name_t = 0;
    let ret = unsafe { fileport_makeport(local_fd, &mut fileport_name) };
    if ret != 0 {
        return Err(CallError::FunctionFailed {
            primitive: "fileport_makeport",
            code: ret as i64,
        });
    }
    let local_port = unsafe { Port::from_raw(fileport_name, PortDisposition::Send) };

    insert_right(
        driver,
        thread,
        remote_task_remote,
        local_port.name(),
        Disposition::CopySend,
        scratch_stack,
    )?;

    let ret = call_registers_only_with_stack(
        driver,
        thread,
        fileport_makefd as usize as u64,
        &[local_port.name() as u64],
        scratch_stack,
    )?;
    if (ret as i32) < 0 {
        return Err(CallError::FunctionFailed {
            primitive: "fileport_makefd",
            code: ret as i32 as i64,
        });
    }
    Ok(ret as i32)
}

/// `open()` in the target, optionally extracting a local descriptor too.
/// Grounded in `threadexec_file_open`: if `want_local` is false, the remote
/// fd is returned but not copied back; if both are wanted, the remote fd is
/// extracted and left open remotely, matching the original's behavior when
/// `remote_fd != NULL`.
pub fn file_open(
    driver: &dyn ArchDriver,
    thread: thread_act_t,
    target_task_local: task_t,
    shmem: &SharedMemory,
    path: &str,
    oflag: i32,
    mode: u32,
    want_local: bool,
) -> Result<(i32, Option<i32>), CallError> {
    let cpath = std::ffi::CString::new(path)
        .map_err(|_| CallError::Marshal(crate::error::MarshalError::InvalidCString))?;
    let outcome = crate::call::marshal_and_call(
        driver,
        thread,
        libc::open as usize as u64,
        &[
            CallArg::CString(cpath),
            CallArg::literal(oflag as u64, 4, true),
            CallArg::literal(mode as u64, 4, false),
        ],
        std::mem::size_of::<libc::c_int>(),
        Some(shmem),
    )?;
    let remote_fd = outcome.result as i32;
    if remote_fd < 0 {
        return Ok((remote_fd, None));
    }
    let local_fd = if want_local {
        Some(file_extract(driver, thread, target_task_local, shmem, remote_fd)?)
    } else {
        None
    };
    Ok((remote_fd, local_fd))
}

/// Our own task's send right, as handed to remote calls that need to refer
/// to "the controller" (rather than the target) as a port argument.
pub fn task_self_send_right() -> mach_port_name_t {
    unsafe { mach_task_self() }
}
