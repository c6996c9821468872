//! RAII wrapper around a `mach_port_name_t`.
//!
//! `rd` wraps raw Linux fds in `ScopedFd`; `Port` plays the same role for
//! Mach rights so that ownership (and the question of *which* call releases
//! it: `mach_port_deallocate` for a right we hold, `mach_port_destroy` for a
//! receive right we want gone entirely) is tracked at the type level instead
//! of at call sites.

use mach2::kern_return::KERN_SUCCESS;
use mach2::port::{mach_port_name_t, MACH_PORT_NULL};
use mach2::traps::mach_task_self;

use super::error::{kr_result, KernelError};

/// What kind of right a `Port` holds, which determines how it's released.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PortDisposition {
    /// We hold a send (or send-once) right; release with `mach_port_deallocate`.
    Send,
    /// We hold a receive right; release with `mach_port_destroy`.
    Receive,
}

/// An owned Mach port name, released on drop according to its disposition.
///
/// A `Port` is always local to this task: "remote" ports (names valid only
/// in the target's IPC space) are represented as a bare `mach_port_name_t`
/// since this process has no authority to release them directly.
pub struct Port {
    name: mach_port_name_t,
    disposition: PortDisposition,
}

impl Port {
    /// Wrap an existing port name owned by this task.
    ///
    /// # Safety
    /// `name` must be a valid port name in this task's IPC space that this
    /// `Port` is taking ownership of (no other code may release it).
    pub unsafe fn from_raw(name: mach_port_name_t, disposition: PortDisposition) -> Port {
        Port { name, disposition }
    }

    pub fn null() -> Port {
        Port {
            name: MACH_PORT_NULL,
            disposition: PortDisposition::Send,
        }
    }

    pub fn is_null(&self) -> bool {
        self.name == MACH_PORT_NULL
    }

    pub fn name(&self) -> mach_port_name_t {
        self.name
    }

    /// Allocate a fresh receive right in this task.
    pub fn allocate_receive() -> Result<Port, KernelError> {
        let mut name: mach_port_name_t = MACH_PORT_NULL;
        let kr = unsafe {
            mach2::mach_port::mach_port_allocate(
                mach_task_self(),
                mach2::port::MACH_PORT_RIGHT_RECEIVE,
                &mut name,
            )
        };
        kr_result(kr)?;
        Ok(Port {
            name,
            disposition: PortDisposition::Receive,
        })
    }

    /// Insert a send right to `name` (derived from our receive right, or
    /// from elsewhere) into our own IPC space. Used after extracting a
    /// remote send right.
    pub fn insert_right_for_receive(name: mach_port_name_t) -> Result<Port, KernelError> {
        let kr = unsafe {
            mach2::mach_port::mach_port_insert_right(
                mach_task_self(),
                name,
                name,
                mach2::message::MACH_MSG_TYPE_MAKE_SEND,
            )
        };
        kr_result(kr)?;
        Ok(Port {
            name,
            disposition: PortDisposition::Send,
        })
    }

    /// Leak this port, returning its raw name without releasing it.
    ///
    /// Used when handing off ownership across the boundary (e.g. the send
    /// right was just transferred into a Mach message and the kernel now
    /// owns the reference).
    pub fn into_raw(mut self) -> mach_port_name_t {
        let name = self.name;
        self.name = MACH_PORT_NULL;
        name
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        if self.name == MACH_PORT_NULL {
            return;
        }
        let task = unsafe { mach_task_self() };
        let kr = match self.disposition {
            PortDisposition::Send => unsafe { mach2::mach_port::mach_port_deallocate(task, self.name) },
            PortDisposition::Receive => unsafe {
                mach2::mach_port::mach_port_destroy(task, self.name)
            },
        };
        if kr != KERN_SUCCESS {
            log::warn!(
                "failed to release mach port {:#x} ({:?}): kr={}",
                self.name,
                self.disposition,
                kr
            );
        }
    }
}
