//! Call marshaller (§4.D): turn a typed argument vector into a prepared
//! call, dispatch it through the architecture driver, and unpack the
//! result.

use mach2::mach_types::thread_act_t;
use std::ffi::CString;

use crate::arch::{mask_to_width, ArchDriver, ArgLayout, SlotValue, StackPair};
use crate::error::{CallError, MarshalError};
use crate::stage::SharedMemory;

/// A single call argument, classified per §3's Call argument data model.
pub enum CallArg<'a> {
    /// Fits in a machine word; carried directly in a register/stack slot.
    Literal { value: u64, width: usize, signed: bool },
    /// Local bytes copied into shared memory; the remote address is passed.
    InputBuffer(&'a [u8]),
    /// Null-terminated input buffer.
    CString(CString),
    /// Reserved, uninitialized (from the target's view) shared-memory
    /// region; copied back into `dest` after the call.
    OutputBuffer { len: usize },
    /// Union of input and output: bytes copied in, then copied back.
    InOutBuffer(&'a [u8]),
}

impl<'a> CallArg<'a> {
    pub fn literal(value: u64, width: usize, signed: bool) -> CallArg<'a> {
        CallArg::Literal { value, width, signed }
    }
}

/// What came back from a call: the primary return value plus, in argument
/// order, the bytes read back for every `OutputBuffer`/`InOutBuffer`
/// argument.
pub struct CallOutcome {
    pub result: u64,
    pub buffers: Vec<Vec<u8>>,
}

/// A simple bump allocator over the shared-memory region, reset at the
/// start of every call so "no cross-call state persists in it" (§5) and
/// "partitioning across arguments is done afresh for each call" hold by
/// construction.
struct Arena<'a> {
    shmem: &'a SharedMemory,
    cursor: usize,
}

impl<'a> Arena<'a> {
    fn new(shmem: &'a SharedMemory) -> Arena<'a> {
        Arena { shmem, cursor: 0 }
    }

    fn reserve(&mut self, len: usize) -> Result<(*mut u8, u64), MarshalError> {
        // 8-byte align every sub-region so pointer-sized reads/writes on
        // either side never straddle an unaligned boundary.
        let aligned_cursor = (self.cursor + 7) & !7;
        if aligned_cursor + len > self.shmem.size() {
            return Err(MarshalError::SharedMemoryExhausted(len));
        }
        let local = unsafe { self.shmem.local_base().add(aligned_cursor) };
        let remote = self.shmem.remote_base() + aligned_cursor as u64;
        self.cursor = aligned_cursor + len;
        Ok((local, remote))
    }
}

/// Record of where an output argument landed, so we can copy it back after
/// the call runs.
struct PendingOutput {
    local_ptr: *mut u8,
    len: usize,
    arg_index: usize,
}

/// Classify and marshal `args` into `driver`'s slot layout, run the call,
/// and unpack the result plus any output buffers.
///
/// `shmem` is `None` only for the register-only fast path (§4.D): every
/// argument must then be `Literal` and fit within the architecture's
/// register slots, since there is nowhere to put buffers or (for
/// register-and-stack architectures) the synthesized return address.
pub fn marshal_and_call(
    driver: &dyn ArchDriver,
    thread: thread_act_t,
    function: u64,
    args: &[CallArg],
    result_width: usize,
    shmem: Option<&SharedMemory>,
) -> Result<CallOutcome, CallError> {
    let mut arena = shmem.map(Arena::new);
    let mut slots = Vec::with_capacity(args.len());
    let mut pending_outputs = Vec::new();
    let mut output_buffers: Vec<Vec<u8>> = Vec::with_capacity(args.len());

    for (i, arg) in args.iter().enumerate() {
        match arg {
            CallArg::Literal { value, width, signed } => {
                let masked = mask_to_width(*value, *width, *signed).map_err(CallError::Marshal)?;
                slots.push(SlotValue(masked));
            }
            CallArg::InputBuffer(bytes) => {
                let arena = arena
                    .as_mut()
                    .ok_or(CallError::Marshal(MarshalError::SharedMemoryUnavailable))?;
                let (local, remote) = arena.reserve(bytes.len()).map_err(CallError::Marshal)?;
                unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), local, bytes.len()) };
                slots.push(SlotValue(remote));
            }
            CallArg::CString(cstr) => {
                let bytes = cstr.as_bytes_with_nul();
                let arena = arena
                    .as_mut()
                    .ok_or(CallError::Marshal(MarshalError::SharedMemoryUnavailable))?;
                let (local, remote) = arena.reserve(bytes.len()).map_err(CallError::Marshal)?;
                unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), local, bytes.len()) };
                slots.push(SlotValue(remote));
            }
            CallArg::OutputBuffer { len } => {
                let arena = arena
                    .as_mut()
                    .ok_or(CallError::Marshal(MarshalError::SharedMemoryUnavailable))?;
                let (local, remote) = arena.reserve(*len).map_err(CallError::Marshal)?;
                slots.push(SlotValue(remote));
                pending_outputs.push(PendingOutput {
                    local_ptr: local,
                    len: *len,
                    arg_index: i,
                });
                output_buffers.push(Vec::new());
            }
            CallArg::InOutBuffer(bytes) => {
                let arena = arena
                    .as_mut()
                    .ok_or(CallError::Marshal(MarshalError::SharedMemoryUnavailable))?;
                let (local, remote) = arena.reserve(bytes.len()).map_err(CallError::Marshal)?;
                unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), local, bytes.len()) };
                slots.push(SlotValue(remote));
                pending_outputs.push(PendingOutput {
                    local_ptr: local,
                    len: bytes.len(),
                    arg_index: i,
                });
                output_buffers.push(Vec::new());
            }
        }
    }

    let layout = driver.layout_args(&slots).map_err(CallError::Marshal)?;
    let stack = shmem.map(|s| s.as_stack());
    if !layout.stack_slots.is_empty() && stack.is_none() {
        return Err(CallError::Marshal(MarshalError::StackUnavailable));
    }

    let raw = driver.call(thread, function, &layout, stack.as_ref())?;

    let result = mask_to_width(raw, result_width.max(1).min(8), false).map_err(CallError::Marshal)?;

    for pending in &pending_outputs {
        let mut data = vec![0u8; pending.len];
        unsafe { std::ptr::copy_nonoverlapping(pending.local_ptr, data.as_mut_ptr(), pending.len) };
        output_buffers[pending_index(&pending_outputs, pending.arg_index)] = data;
    }

    Ok(CallOutcome {
        result,
        buffers: output_buffers,
    })
}

fn pending_index(pending: &[PendingOutput], arg_index: usize) -> usize {
    pending
        .iter()
        .position(|p| p.arg_index == arg_index)
        .expect("arg_index always present")
}

/// The register-only fast path used by staging (§4.B) and
/// hijack-bootstrap-spawn (§4.C) before shared memory exists: every
/// argument is a plain 64-bit literal, and the only thing driving the stack
/// (if the architecture needs one at all) is `stack`.
pub fn call_registers_only(
    driver: &dyn ArchDriver,
    thread: thread_act_t,
    function: u64,
    args: &[u64],
) -> Result<u64, CallError> {
    let slots: Vec<SlotValue> = args.iter().copied().map(SlotValue).collect();
    let layout = driver.layout_args(&slots).map_err(CallError::Marshal)?;
    driver.call(thread, function, &layout, None)
}

/// Same as [`call_registers_only`] but with an explicit stack, for
/// register-and-stack architectures during Stage 0 (they need somewhere to
/// push the synthesized return address even for a zero/few-argument call).
pub fn call_registers_only_with_stack(
    driver: &dyn ArchDriver,
    thread: thread_act_t,
    function: u64,
    args: &[u64],
    stack: &StackPair,
) -> Result<u64, CallError> {
    let slots: Vec<SlotValue> = args.iter().copied().map(SlotValue).collect();
    let layout = driver.layout_args(&slots).map_err(CallError::Marshal)?;
    driver.call(thread, function, &layout, Some(stack))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_buffer_arena_bump_allocates_without_overlap() {
        // Pure layout sanity check that doesn't need a live task: reserve
        // two regions and confirm they don't alias.
        let mut backing = vec![0u8; 64];
        let shmem = SharedMemory::for_test(&mut backing);
        let mut arena = Arena::new(&shmem);
        let (l1, r1) = arena.reserve(8).unwrap();
        let (l2, r2) = arena.reserve(16).unwrap();
        assert_ne!(l1, l2);
        assert_eq!(r2 - r1, 8);
        shmem.forget();
    }

    #[test]
    fn arena_rejects_allocation_past_region_end() {
        let mut backing = vec![0u8; 16];
        let shmem = SharedMemory::for_test(&mut backing);
        let mut arena = Arena::new(&shmem);
        assert!(arena.reserve(32).is_err());
        shmem.forget();
    }
}
