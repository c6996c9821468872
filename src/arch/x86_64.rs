//! Register-and-stack call driver (x86-64 System V).
//!
//! Grounded directly in `original_source/x86_64/thread_call_x86_64.c`:
//! the `jmp *rbx` gadget, the `0x4000 * 128`-byte scan window starting from
//! two always-linked libc symbols, the 6-register argument convention, and
//! the `set_state_run_thread_wait_and_stop_thread` poll loop.

use std::thread::sleep;
use std::time::Instant;

use mach2::mach_types::thread_act_t;
use mach2::thread_act::{thread_get_state, thread_resume, thread_set_state, thread_suspend};

use once_cell::sync::OnceCell;

use super::{ArchDriver, ArchKind, ArgLayout, SlotValue, StackPair};
use crate::error::{CallError, KernelCallError, MarshalError};
use crate::mach::kr_result;

/// `x86_THREAD_STATE64` flavor, from `<mach/i386/thread_status.h>`.
const X86_THREAD_STATE64: i32 = 4;

/// `_STRUCT_X86_THREAD_STATE64` from `<mach/i386/_structs.h>`, field order
/// as the kernel lays it out.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct X86ThreadState64 {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub fs: u64,
    pub gs: u64,
}

const STATE_COUNT: u32 =
    (std::mem::size_of::<X86ThreadState64>() / std::mem::size_of::<u32>()) as u32;

const REGISTER_ARGUMENT_COUNT: usize = 6;
/// Matches the original's `32 * sizeof(uint64_t)` stack-args reservation.
const STACK_ARGS_RESERVATION: usize = 32 * 8;

/// Two-byte `jmp *reg` gadgets we'll accept, preferring `jmp rbx` (what the
/// original scans for) since it leaves every argument register untouched.
const JMP_RBX: [u8; 2] = [0xff, 0xe3];

fn scan_for_jmp_rbx(scan_bytes: usize) -> Option<u64> {
    // HACK, same as the original: scan forward from whichever of two
    // always-linked libc symbols sits lower in memory, through a
    // conservative window, for the raw gadget bytes. This only works
    // because the scanned region (near the dynamic linker's shared cache)
    // is mapped at the same address in every process on the system.
    let a = libc::malloc as usize;
    let b = libc::abort as usize;
    let start = a.min(b);
    unsafe {
        let haystack = std::slice::from_raw_parts(start as *const u8, scan_bytes);
        haystack
            .windows(2)
            .position(|w| w == JMP_RBX)
            .map(|offset| (start + offset) as u64)
    }
}

pub struct X86_64Driver {
    gadget: OnceCell<u64>,
    gadget_scan_bytes: usize,
    poll_interval: std::time::Duration,
    poll_backoff_ceiling: std::time::Duration,
}

impl X86_64Driver {
    pub fn new(config: &crate::flags::Config) -> X86_64Driver {
        X86_64Driver {
            gadget: OnceCell::new(),
            gadget_scan_bytes: config.gadget_scan_bytes,
            poll_interval: config.poll_interval,
            poll_backoff_ceiling: config.poll_backoff_ceiling,
        }
    }

    /// The process-wide gadget address, discovered once and cached. The
    /// `OnceCell` is the atomic-publish-on-first-success mechanism Design
    /// Notes §9 calls for, replacing the original's `static uint64_t
    /// jmp_rbx = 1` sentinel-value cache.
    fn gadget(&self) -> Option<u64> {
        let found = *self
            .gadget
            .get_or_init(|| scan_for_jmp_rbx(self.gadget_scan_bytes).unwrap_or(0));
        if found == 0 {
            None
        } else {
            Some(found)
        }
    }

    fn get_state(&self, thread: thread_act_t) -> Result<X86ThreadState64, CallError> {
        let mut state = X86ThreadState64::default();
        let mut count = STATE_COUNT;
        let kr = unsafe {
            thread_get_state(
                thread,
                X86_THREAD_STATE64,
                &mut state as *mut _ as *mut u32,
                &mut count,
            )
        };
        kr_result(kr)
            .map_err(|e| CallError::GetState(KernelCallError::new("thread_get_state", e)))?;
        Ok(state)
    }

    fn set_state(&self, thread: thread_act_t, state: &X86ThreadState64) -> Result<(), CallError> {
        let kr = unsafe {
            thread_set_state(
                thread,
                X86_THREAD_STATE64,
                state as *const _ as *mut u32,
                STATE_COUNT,
            )
        };
        kr_result(kr).map_err(|e| CallError::SetState(KernelCallError::new("thread_set_state", e)))
    }
}

impl ArchDriver for X86_64Driver {
    fn kind(&self) -> ArchKind {
        ArchKind::RegisterAndStack
    }

    fn register_slot_count(&self) -> usize {
        REGISTER_ARGUMENT_COUNT
    }

    fn layout_args(&self, args: &[SlotValue]) -> Result<ArgLayout, MarshalError> {
        let mut layout = ArgLayout::default();
        for (i, arg) in args.iter().enumerate() {
            if i < REGISTER_ARGUMENT_COUNT {
                layout.register_slots.push(*arg);
            } else {
                layout.stack_slots.push(*arg);
            }
        }
        let stack_bytes = layout.stack_slots.len() * 8;
        if stack_bytes > STACK_ARGS_RESERVATION {
            return Err(MarshalError::StackBudgetExceeded {
                count: args.len(),
                budget: STACK_ARGS_RESERVATION,
            });
        }
        Ok(layout)
    }

    fn probe_capability(&self) -> bool {
        self.gadget().is_some()
    }

    fn call(
        &self,
        thread: thread_act_t,
        function: u64,
        layout: &ArgLayout,
        stack: Option<&StackPair>,
    ) -> Result<u64, CallError> {
        let gadget = self.gadget().ok_or(CallError::GadgetUnavailable)?;

        let mut state = X86ThreadState64::default();
        let regs = [
            &mut state.rdi,
            &mut state.rsi,
            &mut state.rdx,
            &mut state.rcx,
            &mut state.r8,
            &mut state.r9,
        ];
        for (slot, value) in regs.into_iter().zip(layout.register_slots.iter()) {
            *slot = value.0;
        }
        state.rip = function;
        // rbx doubles as the scratch register the gadget jumps through and
        // the sentinel we poll for: `jmp rbx` with rbx == gadget is a
        // self-loop.
        state.rbx = gadget;

        // Lay out stack arguments (if any) and the synthesized return
        // address, 16-byte aligned at the call boundary per §4.D.
        if let Some(stack) = stack {
            let mut remote_top = stack.remote_base;
            let mut local_top = stack.local_base as u64;
            // Reserve the stack-args region below the (assumed page-aligned)
            // top of the allocation, matching the original's fixed
            // reservation.
            remote_top -= STACK_ARGS_RESERVATION as u64;
            local_top -= STACK_ARGS_RESERVATION as u64;
            for (i, value) in layout.stack_slots.iter().enumerate() {
                let addr = (local_top as usize + i * 8) as *mut u64;
                unsafe { addr.write_unaligned(value.0) };
            }
            // Push the return address (the gadget itself).
            remote_top -= 8;
            local_top -= 8;
            unsafe { (local_top as *mut u64).write_unaligned(gadget) };
            state.rsp = remote_top;
        } else if !layout.stack_slots.is_empty() {
            return Err(CallError::SetState(KernelCallError::new(
                "thread_call_stack_x86_64",
                crate::mach::KernelError::InvalidArgument,
            )));
        }

        self.set_state(thread, &state)?;
        let kr = unsafe { thread_resume(thread) };
        kr_result(kr).map_err(|e| CallError::Resume(KernelCallError::new("thread_resume", e)))?;

        let result = self.poll_until_complete(thread, gadget)?;

        let kr = unsafe { thread_suspend(thread) };
        if let Err(e) = kr_result(kr) {
            log::warn!("failed to re-suspend thread after call: {:?}", e);
        }

        Ok(result.rax)
    }

    fn snapshot_state(
        &self,
        thread: thread_act_t,
    ) -> Result<Box<dyn std::any::Any + Send>, CallError> {
        Ok(Box::new(self.get_state(thread)?))
    }

    fn restore_state(
        &self,
        thread: thread_act_t,
        saved: &(dyn std::any::Any + Send),
    ) -> Result<(), CallError> {
        let state = saved
            .downcast_ref::<X86ThreadState64>()
            .expect("restore_state given a snapshot from a different architecture");
        self.set_state(thread, state)
    }
}

impl X86_64Driver {
    fn poll_until_complete(
        &self,
        thread: thread_act_t,
        gadget: u64,
    ) -> Result<X86ThreadState64, CallError> {
        let mut delay = self.poll_interval;
        let started = Instant::now();
        loop {
            let state = match self.get_state(thread) {
                Ok(s) => s,
                Err(_) => {
                    // Possibly the thread crashed; try to stop it so the
                    // caller can inspect the handle, then report failure.
                    unsafe {
                        thread_suspend(thread);
                    }
                    return Err(CallError::LostThread);
                }
            };
            if state.rip == gadget && state.rbx == gadget {
                return Ok(state);
            }
            log::trace!(
                "poll: rip={:#x} rbx={:#x} waiting for gadget {:#x} (elapsed {:?})",
                state.rip,
                state.rbx,
                gadget,
                started.elapsed()
            );
            sleep(delay);
            if delay < self.poll_backoff_ceiling {
                delay = (delay * 2).min(self.poll_backoff_ceiling);
            }
        }
    }
}

#[cfg(test)]
static_assertions::assert_eq_size!(X86ThreadState64, [u8; 21 * 8]);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::SlotValue;

    fn driver() -> X86_64Driver {
        X86_64Driver::new(&crate::flags::Config::default())
    }

    #[test]
    fn six_args_fit_entirely_in_registers() {
        let d = driver();
        let args: Vec<SlotValue> = (0..6).map(SlotValue).collect();
        let layout = d.layout_args(&args).unwrap();
        assert_eq!(layout.register_slots.len(), 6);
        assert!(layout.stack_slots.is_empty());
    }

    #[test]
    fn nine_args_spill_three_to_stack() {
        let d = driver();
        let args: Vec<SlotValue> = (1..=9).map(SlotValue).collect();
        let layout = d.layout_args(&args).unwrap();
        assert_eq!(layout.register_slots.len(), 6);
        assert_eq!(layout.stack_slots.len(), 3);
        let sum: u64 = layout
            .register_slots
            .iter()
            .chain(layout.stack_slots.iter())
            .map(|s| s.0)
            .sum();
        assert_eq!(sum, 45);
    }

    #[test]
    fn too_many_stack_args_rejected() {
        let d = driver();
        let args: Vec<SlotValue> = (0..(REGISTER_ARGUMENT_COUNT + STACK_ARGS_RESERVATION / 8 + 1))
            .map(|i| SlotValue(i as u64))
            .collect();
        assert!(d.layout_args(&args).is_err());
    }
}
