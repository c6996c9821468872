//! Thread acquisition (§4.C): getting from "a task port" to "a suspended
//! thread whose registers we can drive", via one of three strategies
//! selected by the caller-supplied thread and `PolicyFlags`.
//!
//! Grounded directly in `original_source/thread_api/tx_init_thread.c`:
//! `pick_hijack_thread` for candidate selection, `init_by_hijacking_thread`
//! for the consume path, and `init_without_thread` for the
//! bootstrap-and-spawn path (marked `NOT IMPLEMENTED`/`TODO` there; built
//! out fully here as a first-class, always-available acquisition mode).

use mach2::kern_return::KERN_SUCCESS;
use mach2::mach_types::{task_t, thread_act_t};
use mach2::port::mach_port_name_t;
use mach2::thread_act::{thread_info, thread_resume, thread_suspend};
use mach2::thread_info::{thread_basic_info, thread_basic_info_t, THREAD_BASIC_INFO, THREAD_BASIC_INFO_COUNT};
use mach2::traps::mach_task_self;

use crate::arch::ArchDriver;
use crate::error::AcquisitionError;
use crate::flags::PolicyFlags;
use crate::mach::{kr_result, Port, PortDisposition};

/// A thread acquired and ready to drive, plus what has to happen to release
/// it again (recorded so `handle.rs` can run teardown in the right order).
pub struct AcquiredThread {
    pub port: Port,
    /// Saved registers from before we touched the thread, if `PRESERVE` was
    /// requested.
    pub saved_state: Option<SavedState>,
    pub flags: PolicyFlags,
}

/// Opaque saved register state, captured and restored by the architecture
/// driver so this module doesn't need to know the per-arch layout.
pub struct SavedState(pub Box<dyn std::any::Any + Send>);

/// Enumerate `task`'s threads and suspend counts without taking ownership
/// of any of them, grounded in `pick_hijack_thread`'s scan.
fn list_threads(task: task_t) -> Result<Vec<thread_act_t>, AcquisitionError> {
    let mut threads: mach2::mach_types::thread_act_array_t = std::ptr::null_mut();
    let mut count: mach2::message::mach_msg_type_number_t = 0;
    let kr = unsafe { mach2::task::task_threads(task, &mut threads, &mut count) };
    kr_result(kr).map_err(|e| {
        AcquisitionError::SpawnFailed(crate::error::KernelCallError::new("task_threads", e))
    })?;
    let slice = unsafe { std::slice::from_raw_parts(threads, count as usize) };
    let result = slice.to_vec();
    // The array itself (not the port rights it names) is out-of-line kernel
    // memory; individual port rights are deallocated by the caller once it
    // knows which one survives.
    unsafe {
        mach2::vm::mach_vm_deallocate(
            mach_task_self(),
            threads as u64,
            (count as usize * std::mem::size_of::<thread_act_t>()) as u64,
        );
    }
    Ok(result)
}

fn suspend_count(thread: thread_act_t) -> Result<i32, AcquisitionError> {
    let mut info: thread_basic_info = unsafe { std::mem::zeroed() };
    let mut count = THREAD_BASIC_INFO_COUNT;
    let kr = unsafe {
        thread_info(
            thread,
            THREAD_BASIC_INFO,
            &mut info as *mut _ as thread_basic_info_t,
            &mut count,
        )
    };
    kr_result(kr).map_err(|e| {
        AcquisitionError::SpawnFailed(crate::error::KernelCallError::new("thread_info", e))
    })?;
    Ok(info.suspend_count)
}

/// Pick a candidate thread to hijack: newest-to-oldest, first one with a
/// zero suspend count, exactly as `pick_hijack_thread` does. Every other
/// thread port enumerated is deallocated before returning.
pub fn pick_hijack_thread(task: task_t) -> Result<thread_act_t, AcquisitionError> {
    let threads = list_threads(task)?;
    if threads.is_empty() {
        return Err(AcquisitionError::NoRunnableThread);
    }
    let mut chosen = None;
    for &t in threads.iter().rev() {
        if chosen.is_none() && suspend_count(t).unwrap_or(1) == 0 {
            chosen = Some(t);
        }
    }
    for &t in &threads {
        if Some(t) != chosen {
            unsafe { mach2::mach_port::mach_port_deallocate(mach_task_self(), t) };
        }
    }
    chosen.ok_or(AcquisitionError::NoRunnableThread)
}

/// Strategy 1: the caller already supplied a thread port (`Direct`
/// acquisition, §4.C). We take ownership of the send right (its disposition
/// is caller-defined) and suspend it per `PolicyFlags::SUSPEND`.
pub fn acquire_direct(
    driver: &dyn ArchDriver,
    thread: mach_port_name_t,
    flags: PolicyFlags,
) -> Result<AcquiredThread, AcquisitionError> {
    flags.validate()?;
    let port = unsafe { Port::from_raw(thread, PortDisposition::Send) };
    let saved_state = if flags.contains(PolicyFlags::PRESERVE) {
        Some(SavedState(driver.snapshot_state(port.name()).map_err(|_| {
            AcquisitionError::SpawnFailed(crate::error::KernelCallError::new(
                "thread_get_state",
                crate::mach::KernelError::Failure,
            ))
        })?))
    } else {
        None
    };
    if flags.contains(PolicyFlags::SUSPEND) {
        let kr = unsafe { thread_suspend(port.name()) };
        kr_result(kr).map_err(|e| {
            AcquisitionError::SpawnFailed(crate::error::KernelCallError::new("thread_suspend", e))
        })?;
    }
    Ok(AcquiredThread {
        port,
        saved_state,
        flags,
    })
}

/// Strategy 2: `Hijack-consume`. Requires `KILL_TASK`; the chosen thread is
/// wholly consumed and never restored, since the task is doomed regardless.
/// Grounded in `init_by_hijacking_thread`.
pub fn acquire_hijack_consume(task: task_t) -> Result<AcquiredThread, AcquisitionError> {
    let flags = PolicyFlags::KILL_TASK | PolicyFlags::SUSPEND;
    flags.validate()?;
    let raw = pick_hijack_thread(task)?;
    let kr = unsafe { thread_suspend(raw) };
    kr_result(kr).map_err(|e| {
        AcquisitionError::SpawnFailed(crate::error::KernelCallError::new("thread_suspend", e))
    })?;
    Ok(AcquiredThread {
        port: unsafe { Port::from_raw(raw, PortDisposition::Send) },
        saved_state: None,
        flags,
    })
}

/// Result of the bootstrap-spawn strategy: the *new* thread the caller ends
/// up driving, with `KILL_THREAD` set since the handle now owns its entire
/// lifecycle (it will `pthread_exit`/be destroyed at tear-down).
pub struct SpawnedThread {
    pub acquired: AcquiredThread,
    /// The new thread's remote-side `pthread_t`, kept so a future remote
    /// `pthread_exit` call at tear-down has something to act on even though
    /// this crate currently relies on `KILL_THREAD`'s direct `thread_terminate`.
    pub pthread_remote: u64,
}

/// Strategy 3, steps 1+1.5: pick a candidate thread *H* and suspend it,
/// returning its saved register state so the caller can restore it after
/// staging through it and running the spawn steps (the caller needs to
/// interleave full staging, via the call engine, between this and
/// `spawn_via_hijacked_thread` below, which is why this isn't folded into
/// one function the way the original's `init_without_thread` reads).
pub fn pick_and_suspend_for_staging(
    driver: &dyn ArchDriver,
    task: task_t,
) -> Result<(thread_act_t, SavedState), AcquisitionError> {
    let hijack = pick_hijack_thread(task)?;
    let kr = unsafe { thread_suspend(hijack) };
    kr_result(kr).map_err(|e| {
        AcquisitionError::SpawnFailed(crate::error::KernelCallError::new("thread_suspend", e))
    })?;
    let saved = driver.snapshot_state(hijack).map_err(|_| {
        AcquisitionError::SpawnFailed(crate::error::KernelCallError::new(
            "thread_get_state",
            crate::mach::KernelError::Failure,
        ))
    })?;
    Ok((hijack, SavedState(saved)))
}

/// Strategy 3, final step: restore *H*'s preserved state, resume it, and
/// release our reference, regardless of whether the spawn steps in between
/// succeeded. Mirrors `init_without_thread`'s `tx_preserve_restore()` +
/// `thread_resume_check()` + `mach_port_deallocate()` sequence, which runs
/// unconditionally once *H* produced a staged handle.
pub fn restore_and_release_staging_thread(
    driver: &dyn ArchDriver,
    hijack: thread_act_t,
    saved: &SavedState,
) {
    if let Err(e) = driver.restore_state(hijack, saved.0.as_ref()) {
        log::warn!("failed to restore staging thread state: {:?}", e);
    }
    let kr = unsafe { thread_resume(hijack) };
    if let Err(e) = kr_result(kr) {
        log::warn!("failed to resume hijacked staging thread: {:?}", e);
    }
    unsafe { mach2::mach_port::mach_port_deallocate(mach_task_self(), hijack) };
}

/// Strategy 3, steps 3-5: spawn a suspended pthread through the
/// already-staged hijacked thread *H*, translate it to a thread port, and
/// extract a local send right to it. `shmem` must already be the handle's
/// real staged shared memory (staged using *H* itself, per step 2); `scratch`
/// is the small dedicated region used as a stack for the two register-only
/// calls in this sequence, the same way `stage0_ports` uses it. Grounded
/// step-by-step in `init_without_thread`.
pub fn spawn_via_hijacked_thread(
    driver: &dyn ArchDriver,
    hijack: thread_act_t,
    remote_task_local: task_t,
    shmem: &crate::stage::SharedMemory,
    scratch: &crate::stage::SharedMemory,
) -> Result<SpawnedThread, AcquisitionError> {
    // Step: pthread_create_suspended_np(&pthread_r, NULL, abort, NULL).
    // `abort` is an always-present libc symbol used purely as a harmless
    // entry point the new thread never actually reaches, since we tear it
    // down (translate + adopt) before ever resuming it for real.
    let pthread_out = crate::call::marshal_and_call(
        driver,
        hijack,
        pthread_create_suspended_np as usize as u64,
        &[
            crate::call::CallArg::OutputBuffer { len: 8 },
            crate::call::CallArg::literal(0, 8, false),
            crate::call::CallArg::literal(libc::abort as usize as u64, 8, false),
            crate::call::CallArg::literal(0, 8, false),
        ],
        4,
        Some(shmem),
    );
    let pthread_out = pthread_out.map_err(|_| AcquisitionError::ThreadTranslationFailed)?;
    if pthread_out.result != 0 {
        return Err(AcquisitionError::ThreadTranslationFailed);
    }
    let pthread_r = u64::from_ne_bytes(pthread_out.buffers[0][..8].try_into().unwrap());

    let scratch_stack = scratch.as_stack();

    // Step: pthread_detach(pthread_r), best-effort.
    let _ = crate::call::call_registers_only_with_stack(
        driver,
        hijack,
        pthread_detach as usize as u64,
        &[pthread_r],
        &scratch_stack,
    );

    // Step: pthread_mach_thread_np(pthread_r) -> remote thread name.
    let thread_r = crate::call::call_registers_only_with_stack(
        driver,
        hijack,
        pthread_mach_thread_np as usize as u64,
        &[pthread_r],
        &scratch_stack,
    )
    .map_err(|_| AcquisitionError::ThreadTranslationFailed)?;

    // Step: copy that thread port into our own IPC space.
    let local_thread = crate::transfer::extract_right(
        remote_task_local,
        thread_r as mach_port_name_t,
        crate::transfer::Disposition::CopySend,
    )
    .map_err(|_| AcquisitionError::ThreadTranslationFailed)?;

    Ok(SpawnedThread {
        acquired: AcquiredThread {
            port: local_thread,
            saved_state: None,
            flags: PolicyFlags::KILL_THREAD,
        },
        pthread_remote: pthread_r,
    })
}

extern "C" {
    fn pthread_create_suspended_np(
        thread: *mut libc::pthread_t,
        attr: *const libc::c_void,
        start_routine: extern "C" fn(*mut libc::c_void) -> *mut libc::c_void,
        arg: *mut libc::c_void,
    ) -> libc::c_int;
    fn pthread_detach(thread: libc::pthread_t) -> libc::c_int;
    fn pthread_mach_thread_np(thread: libc::pthread_t) -> mach_port_name_t;
}

/// Release an acquired thread per its flags: restore `PRESERVE`d state,
/// resume if `RESUME`, terminate if `KILL_THREAD`, leave alone under
/// `KILL_TASK` (the task is being torn down regardless).
pub fn release(driver: &dyn ArchDriver, acquired: &AcquiredThread) {
    if acquired.flags.contains(PolicyFlags::KILL_TASK) {
        return;
    }
    if let Some(SavedState(saved)) = &acquired.saved_state {
        if let Err(e) = driver.restore_state(acquired.port.name(), saved.as_ref()) {
            log::warn!("failed to restore preserved register state: {:?}", e);
        }
    }
    if acquired.flags.contains(PolicyFlags::KILL_THREAD) {
        let kr = unsafe { mach2::thread_act::thread_terminate(acquired.port.name()) };
        if kr != KERN_SUCCESS {
            log::warn!("failed to terminate acquired thread: kr={}", kr);
        }
        return;
    }
    if acquired.flags.contains(PolicyFlags::RESUME) {
        let kr = unsafe { thread_resume(acquired.port.name()) };
        if kr != KERN_SUCCESS {
            log::warn!("failed to resume acquired thread: kr={}", kr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hijack_consume_flags_are_always_valid() {
        let flags = PolicyFlags::KILL_TASK | PolicyFlags::SUSPEND;
        assert!(flags.validate().is_ok());
    }

    #[test]
    fn bootstrap_spawn_result_carries_kill_thread() {
        let flags = PolicyFlags::KILL_THREAD;
        assert!(flags.validate().is_ok());
        assert!(flags.contains(PolicyFlags::KILL_THREAD));
    }
}
