//! Register-and-link call driver (arm64).
//!
//! Unlike x86-64, arm64 has a dedicated link register, so the controlled
//! return needs no gadget: we just point the link register at an address
//! that is itself (a branch-to-self is the simplest instruction that's
//! guaranteed "invalid but inert" — the CPU spins there forever without
//! trapping), and poll for the program counter reaching it. `mach2` doesn't
//! currently expose `arm_thread_state64_t`, so (as `other_examples`'
//! minidump-writer does for the same struct) we define the layout
//! ourselves from `<mach/arm/_structs.h>`.

use std::thread::sleep;
use std::time::Instant;

use mach2::mach_types::thread_act_t;
use mach2::thread_act::{thread_get_state, thread_resume, thread_set_state, thread_suspend};

use super::{ArchDriver, ArchKind, ArgLayout, SlotValue, StackPair};
use crate::error::{CallError, KernelCallError, MarshalError};
use crate::mach::kr_result;

/// `ARM_THREAD_STATE64` flavor, from `<mach/arm/thread_status.h>`.
const ARM_THREAD_STATE64: i32 = 6;

/// `_STRUCT_ARM_THREAD_STATE64` from `<mach/arm/_structs.h>`.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct Arm64ThreadState {
    pub x: [u64; 29],
    pub fp: u64,
    pub lr: u64,
    pub sp: u64,
    pub pc: u64,
    pub cpsr: u32,
    __pad: u32,
}

const STATE_COUNT: u32 =
    (std::mem::size_of::<Arm64ThreadState>() / std::mem::size_of::<u32>()) as u32;

const REGISTER_ARGUMENT_COUNT: usize = 8;

pub struct Arm64Driver {
    poll_interval: std::time::Duration,
    poll_backoff_ceiling: std::time::Duration,
}

impl Arm64Driver {
    pub fn new(config: &crate::flags::Config) -> Arm64Driver {
        Arm64Driver {
            poll_interval: config.poll_interval,
            poll_backoff_ceiling: config.poll_backoff_ceiling,
        }
    }

    fn get_state(&self, thread: thread_act_t) -> Result<Arm64ThreadState, CallError> {
        let mut state = Arm64ThreadState::default();
        let mut count = STATE_COUNT;
        let kr = unsafe {
            thread_get_state(
                thread,
                ARM_THREAD_STATE64,
                &mut state as *mut _ as *mut u32,
                &mut count,
            )
        };
        kr_result(kr)
            .map_err(|e| CallError::GetState(KernelCallError::new("thread_get_state", e)))?;
        Ok(state)
    }

    fn set_state(&self, thread: thread_act_t, state: &Arm64ThreadState) -> Result<(), CallError> {
        let kr = unsafe {
            thread_set_state(
                thread,
                ARM_THREAD_STATE64,
                state as *const _ as *mut u32,
                STATE_COUNT,
            )
        };
        kr_result(kr).map_err(|e| CallError::SetState(KernelCallError::new("thread_set_state", e)))
    }

    fn poll_until_complete(
        &self,
        thread: thread_act_t,
        sentinel: u64,
    ) -> Result<Arm64ThreadState, CallError> {
        let mut delay = self.poll_interval;
        let started = Instant::now();
        loop {
            let state = match self.get_state(thread) {
                Ok(s) => s,
                Err(_) => {
                    unsafe {
                        thread_suspend(thread);
                    }
                    return Err(CallError::LostThread);
                }
            };
            if state.pc == sentinel {
                return Ok(state);
            }
            log::trace!(
                "poll: pc={:#x} waiting for sentinel {:#x} (elapsed {:?})",
                state.pc,
                sentinel,
                started.elapsed()
            );
            sleep(delay);
            if delay < self.poll_backoff_ceiling {
                delay = (delay * 2).min(self.poll_backoff_ceiling);
            }
        }
    }
}

impl ArchDriver for Arm64Driver {
    fn kind(&self) -> ArchKind {
        ArchKind::RegisterAndLink
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
        Ok(layout)
    }

    fn probe_capability(&self) -> bool {
        // No gadget discovery needed: the link-register sentinel always
        // works once we know the function's entry address, which is where
        // we'll point it.
        true
    }

    fn call(
        &self,
        thread: thread_act_t,
        function: u64,
        layout: &ArgLayout,
        stack: Option<&StackPair>,
    ) -> Result<u64, CallError> {
        // Sentinel: read the thread's current program counter and point the
        // link register at that same address, so the post-return branch is
        // a tight self-loop landing exactly where the thread already sat
        // (inert, since it's wherever the previous call left it, or the
        // thread's initial suspended pc if this is the first call).
        let sentinel = self.get_state(thread)?.pc;

        let mut state = Arm64ThreadState::default();
        for (i, value) in layout.register_slots.iter().enumerate() {
            state.x[i] = value.0;
        }
        state.pc = function;
        state.lr = sentinel;

        if !layout.stack_slots.is_empty() {
            let stack = stack.ok_or_else(|| {
                CallError::SetState(KernelCallError::new(
                    "thread_call_stack_arm64",
                    crate::mach::KernelError::InvalidArgument,
                ))
            })?;
            let mut local_top = stack.local_base as u64;
            let mut remote_top = stack.remote_base;
            let bytes = layout.stack_slots.len() * 8;
            // 16-byte align the top of the argument area per the System-V
            // style alignment rule this architecture's ABI also observes.
            let aligned = (bytes + 15) & !15;
            local_top -= aligned as u64;
            remote_top -= aligned as u64;
            for (i, value) in layout.stack_slots.iter().enumerate() {
                let addr = (local_top as usize + i * 8) as *mut u64;
                unsafe { addr.write_unaligned(value.0) };
            }
            state.sp = remote_top;
        } else if let Some(stack) = stack {
            state.sp = stack.remote_base;
        }

        self.set_state(thread, &state)?;
        let kr = unsafe { thread_resume(thread) };
        kr_result(kr).map_err(|e| CallError::Resume(KernelCallError::new("thread_resume", e)))?;

        let result = self.poll_until_complete(thread, sentinel)?;

        let kr = unsafe { thread_suspend(thread) };
        if let Err(e) = kr_result(kr) {
            log::warn!("failed to re-suspend thread after call: {:?}", e);
        }

        Ok(result.x[0])
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
            .downcast_ref::<Arm64ThreadState>()
            .expect("restore_state given a snapshot from a different architecture");
        self.set_state(thread, state)
    }
}

#[cfg(test)]
static_assertions::assert_eq_size!(Arm64ThreadState, [u8; 29 * 8 + 4 * 8 + 8]);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::SlotValue;

    fn driver() -> Arm64Driver {
        Arm64Driver::new(&crate::flags::Config::default())
    }

    #[test]
    fn eight_args_fit_in_registers() {
        let d = driver();
        let args: Vec<SlotValue> = (0..8).map(SlotValue).collect();
        let layout = d.layout_args(&args).unwrap();
        assert_eq!(layout.register_slots.len(), 8);
        assert!(layout.stack_slots.is_empty());
    }

    #[test]
    fn ninth_arg_spills_to_stack() {
        let d = driver();
        let args: Vec<SlotValue> = (0..9).map(SlotValue).collect();
        let layout = d.layout_args(&args).unwrap();
        assert_eq!(layout.register_slots.len(), 8);
        assert_eq!(layout.stack_slots.len(), 1);
    }

    #[test]
    fn probe_capability_is_always_true() {
        assert!(driver().probe_capability());
    }
}
