//! Port & memory staging (§4.B): the two durable infrastructure artifacts
//! that turn a bare "I can poke this thread's registers" capability into a
//! channel rich enough for the full call marshaller.
//!
//! The bootstrap scratch region needed before anything else exists is the
//! one exception mapped directly via `mach_vm_allocate`/`mach_vm_remap`
//! against the held task port, rather than via a remote call: there is
//! nowhere else to write a remote call's out-parameter until some piece of
//! shared memory already exists, so this one allocation has to come from
//! the controller's side. Everything staged after it -- Stage 0's paired
//! ports and Stage 1's main shared region alike -- is allocated by a call
//! actually executed on the remote thread, with the allocation's
//! out-parameter written back through that scratch region, then mapped
//! into our own space with `mach_vm_remap`.

use mach2::kern_return::KERN_SUCCESS;
use mach2::mach_types::{task_t, thread_act_t};
use mach2::port::mach_port_name_t;
use mach2::traps::mach_task_self;
use mach2::vm::{mach_vm_allocate, mach_vm_deallocate};
use mach2::vm_prot::{VM_PROT_READ, VM_PROT_WRITE};
use mach2::vm_statistics::VM_FLAGS_ANYWHERE;

use crate::arch::{ArchDriver, SlotValue, StackPair};
use crate::error::{CallError, KernelCallError, StagingError};
use crate::mach::{kr_result, Port};

/// A region of memory mapped at the same underlying object in both the
/// controller and the target, per §3's `shmem_local_base`/`shmem_remote_base`
/// invariant.
pub struct SharedMemory {
    local_base: *mut u8,
    remote_base: u64,
    size: usize,
}

unsafe impl Send for SharedMemory {}

impl SharedMemory {
    pub fn local_base(&self) -> *mut u8 {
        self.local_base
    }

    pub fn remote_base(&self) -> u64 {
        self.remote_base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Present this region as a downward-growing stack whose initial
    /// (highest) stack pointer is the top of the region.
    pub fn as_stack(&self) -> StackPair {
        StackPair {
            local_base: unsafe { self.local_base.add(self.size) },
            remote_base: self.remote_base + self.size as u64,
            size: self.size,
        }
    }

    /// Allocate `size` bytes in `remote_task` and map the same object into
    /// our own address space. `remote_task` must be a send right we hold
    /// with VM-access authority (the `target_task_local` field).
    pub fn map(remote_task: task_t, size: usize) -> Result<SharedMemory, StagingError> {
        let mut remote_addr: u64 = 0;
        let kr = unsafe {
            mach_vm_allocate(remote_task, &mut remote_addr, size as u64, VM_FLAGS_ANYWHERE)
        };
        kr_result(kr).map_err(|e| {
            StagingError::SharedMemory(KernelCallError::new("mach_vm_allocate(remote)", e))
        })?;

        let local_addr = remap_into_self(remote_task, remote_addr, size)
            .map_err(|e| StagingError::SharedMemory(KernelCallError::new("mach_vm_remap", e)))?;

        Ok(SharedMemory {
            local_base: local_addr as *mut u8,
            remote_base: remote_addr,
            size,
        })
    }

    /// Release the local mapping. The remote side is freed separately, by a
    /// remote call run on a scratch stack outside this region (see
    /// `teardown_remote`), per Design Notes §9's Open Question (a).
    pub fn unmap_local(&mut self) {
        if self.local_base.is_null() {
            return;
        }
        let kr = unsafe {
            mach_vm_deallocate(mach_task_self(), self.local_base as u64, self.size as u64)
        };
        if kr != KERN_SUCCESS {
            log::warn!("failed to unmap local shared memory: kr={}", kr);
        }
        self.local_base = std::ptr::null_mut();
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        self.unmap_local();
    }
}

#[cfg(test)]
impl SharedMemory {
    /// Wrap an ordinary local buffer as a `SharedMemory` with `local_base
    /// == remote_base` (as if controller and target were the same address
    /// space), for marshalling tests that don't need a live task.
    pub fn for_test(buf: &mut [u8]) -> SharedMemory {
        SharedMemory {
            local_base: buf.as_mut_ptr(),
            remote_base: buf.as_ptr() as u64,
            size: buf.len(),
        }
    }

    /// Prevent the destructor from trying to `mach_vm_deallocate` memory it
    /// doesn't own (used after `for_test`).
    pub fn forget(mut self) {
        self.local_base = std::ptr::null_mut();
    }
}

/// `mach_vm_remap` the memory object backing `[remote_addr, remote_addr +
/// size)` of `remote_task` into our own task at a kernel-chosen address,
/// returning that local address. This is what gives us the dual mapping
/// invariant: both addresses back the same physical pages.
fn remap_into_self(
    remote_task: task_t,
    remote_addr: u64,
    size: usize,
) -> Result<u64, crate::mach::KernelError> {
    let mut local_addr: u64 = 0;
    let mut cur_prot = 0i32;
    let mut max_prot = 0i32;
    let kr = unsafe {
        mach2::vm::mach_vm_remap(
            mach_task_self(),
            &mut local_addr,
            size as u64,
            0,
            VM_FLAGS_ANYWHERE,
            remote_task,
            remote_addr,
            0, // copy = false: a true shared mapping, not copy-on-write
            &mut cur_prot,
            &mut max_prot,
            mach2::vm_inherit::VM_INHERIT_NONE,
        )
    };
    kr_result(kr)?;
    // Ensure the kernel actually gave us a writable mapping; staging relies
    // on both ends observing each other's writes.
    let _ = VM_PROT_READ | VM_PROT_WRITE;
    Ok(local_addr)
}

/// Stage 0: pair a receive right we hold with one the remote task
/// allocates for itself, and exchange send rights so each side can message
/// the other.
///
/// `driver`/`thread` must already be able to service register-only calls
/// (the handle is "temporarily READY" per §4.C's hijack-bootstrap-spawn
/// step 2) even though full shared memory doesn't exist yet; the tiny
/// `scratch` region (mapped the same way as the main shared region, before
/// it) gives the remote `mach_port_allocate` call somewhere to write its
/// out-parameter and gives x86-64 somewhere to park a stack.
pub struct BootstrapPorts {
    /// Our own receive right; the target can send us ports/messages here.
    pub local: Port,
    /// A send right we hold to the target's receive port; we use this to
    /// send ports/messages to the target.
    pub remote_send: Port,
    /// The target's receive port's own name, valid only in its IPC space.
    /// Recorded for bookkeeping and for remote calls that need to refer to
    /// "my own bootstrap port" (e.g. a future remote teardown call).
    pub remote_name: mach_port_name_t,
}

pub fn stage0_ports(
    driver: &dyn ArchDriver,
    thread: thread_act_t,
    target_task_local: task_t,
    remote_task_remote: u64,
    scratch: &SharedMemory,
) -> Result<BootstrapPorts, StagingError> {
    let local = Port::allocate_receive()
        .map_err(|e| StagingError::PortPairing(KernelCallError::new("mach_port_allocate", e)))?;

    // Call 1: have the target allocate a receive right for itself. The
    // out-parameter (the new port's name) is written into the scratch
    // region so we can read it back without needing a remote-only return
    // path (mach_port_allocate's result, the kernel status, is all that
    // comes back in registers).
    // Reserve the first word of scratch for the out-parameter and use the
    // rest of the region as the call's stack (needed unconditionally on
    // register-and-stack architectures, even for this few-argument call).
    let out_ptr = scratch.remote_base();
    let scratch_stack = scratch.as_stack();
    crate::call::call_registers_only_with_stack(
        driver,
        thread,
        mach2::mach_port::mach_port_allocate as usize as u64,
        &[
            remote_task_remote,
            mach2::port::MACH_PORT_RIGHT_RECEIVE as u64,
            out_ptr,
        ],
        &scratch_stack,
    )
    .map_err(|e| StagingError::PortPairing(wrap(e, "mach_port_allocate")))?;
    let remote_name = unsafe { (scratch.local_base() as *const mach_port_name_t).read_volatile() };
    if remote_name == 0 {
        return Err(StagingError::BadRemoteAddress);
    }

    // Call 2: have the target insert our bootstrap port's send right into
    // its own IPC space, so it can message us back. Only code running in
    // the target can insert a right into its own namespace (see
    // `transfer.rs`'s module docs), so this leg is a genuine remote call.
    crate::transfer::insert_right(
        driver,
        thread,
        remote_task_remote,
        local.name(),
        crate::transfer::Disposition::CopySend,
        &scratch_stack,
    )
    .map_err(|e| StagingError::PortPairing(wrap(e, "mach_port_insert_right")))?;

    // We also need a local send right to the target's new receive port so
    // we can message it. Unlike insertion, extraction from a task we
    // already hold is a direct kernel call.
    let remote_send = crate::transfer::extract_right(
        target_task_local,
        remote_name,
        crate::transfer::Disposition::MoveSend,
    )
    .map_err(|e| StagingError::PortPairing(KernelCallError::new("mach_port_extract_right", e)))?;

    Ok(BootstrapPorts {
        local,
        remote_send,
        remote_name,
    })
}

/// Stage 1: allocate the main shared-memory region once Stage 0's channel
/// exists, via a genuine remote `mach_vm_allocate` call executed on
/// `thread` -- the target does its own allocation, exactly as it does its
/// own `mach_port_allocate` in `stage0_ports`. The call's out-parameter (the
/// new region's remote address) is written back through `scratch`'s shared
/// storage, then the resulting memory object is remapped into our own space.
pub fn stage1_shared_memory(
    driver: &dyn ArchDriver,
    thread: thread_act_t,
    target_task_local: task_t,
    remote_task_remote: u64,
    scratch: &SharedMemory,
    size: usize,
) -> Result<SharedMemory, StagingError> {
    let out_ptr = scratch.remote_base();
    let scratch_stack = scratch.as_stack();
    crate::call::call_registers_only_with_stack(
        driver,
        thread,
        mach2::vm::mach_vm_allocate as usize as u64,
        &[
            remote_task_remote,
            out_ptr,
            size as u64,
            VM_FLAGS_ANYWHERE as u64,
        ],
        &scratch_stack,
    )
    .map_err(|e| StagingError::SharedMemory(wrap(e, "mach_vm_allocate")))?;

    let remote_addr = unsafe { (scratch.local_base() as *const u64).read_volatile() };
    if remote_addr == 0 {
        return Err(StagingError::BadRemoteAddress);
    }

    let local_addr = remap_into_self(target_task_local, remote_addr, size)
        .map_err(|e| StagingError::SharedMemory(KernelCallError::new("mach_vm_remap", e)))?;

    Ok(SharedMemory {
        local_base: local_addr as *mut u8,
        remote_base: remote_addr,
        size,
    })
}

/// Free the remote half of `shmem` via a remote `mach_vm_deallocate` call
/// run on `scratch_stack`, never on the region being freed (Open Question
/// (a)).
pub fn teardown_remote(
    driver: &dyn ArchDriver,
    thread: thread_act_t,
    remote_task_remote: u64,
    shmem: &SharedMemory,
    scratch_stack: &StackPair,
) -> Result<(), CallError> {
    let layout = driver
        .layout_args(&[
            SlotValue(remote_task_remote),
            SlotValue(shmem.remote_base()),
            SlotValue(shmem.size() as u64),
        ])
        .map_err(CallError::Marshal)?;
    driver
        .call(
            thread,
            mach2::vm::mach_vm_deallocate as usize as u64,
            &layout,
            Some(scratch_stack),
        )
        .map(|_| ())
}

fn wrap(e: CallError, primitive: &'static str) -> KernelCallError {
    match e {
        CallError::GetState(k) | CallError::SetState(k) | CallError::Resume(k) | CallError::Suspend(k) => k,
        _ => KernelCallError::new(primitive, crate::mach::KernelError::Failure),
    }
}
