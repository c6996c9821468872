//! Architecture-specific call driver (§4.A / §4.D slot layout).
//!
//! `rd` tags register state with `SupportedArch` and stores both arch's
//! register layouts behind one union (`registers.rs`); we can't reuse that
//! exact transmute trick (rd's two variants, x86/x64, are
//! register-compatible subsets of each other — ours, arm64 vs x86-64, are
//! not), so the "capability set" from Design Notes §9 becomes a trait,
//! `ArchDriver`, with one concrete implementation per architecture kind and
//! an `ArchKind` tag on the handle selecting which one to use, the same
//! dispatch shape `rd` gets from its `SupportedArch` match arms.

pub mod arm64;
pub mod x86_64;

use crate::error::{CallError, MarshalError};

/// Which of the two supported CPU families a target uses.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ArchKind {
    /// Fixed link register on call (e.g. arm64): controlled return via a
    /// link-register sentinel.
    RegisterAndLink,
    /// Return address on stack (e.g. x86-64): controlled return via a
    /// `jmp *reg` gadget.
    RegisterAndStack,
}

/// A single argument already reduced to a 64-bit slot value, classification
/// having been resolved by the marshaller (`call.rs`) into either a literal
/// value or a shared-memory pointer.
#[derive(Copy, Clone, Debug)]
pub struct SlotValue(pub u64);

/// Where a prepared call's arguments land: some in registers, the rest on
/// the remote stack (empty for register-and-link calls with <= register
/// count arguments).
#[derive(Clone, Debug, Default)]
pub struct ArgLayout {
    pub register_slots: Vec<SlotValue>,
    pub stack_slots: Vec<SlotValue>,
}

/// A local+remote stack pair, required only by register-and-stack
/// architectures (and only when excess arguments or a synthesized return
/// address need somewhere to live).
pub struct StackPair {
    /// Base (top) of the stack as mapped in our own address space, so we can
    /// write to it directly.
    pub local_base: *mut u8,
    /// The same base address as it appears in the remote task.
    pub remote_base: u64,
    pub size: usize,
}

/// The capability set from Design Notes §9: everything the marshaller needs
/// from an architecture, dispatched through one interface regardless of
/// which concrete CPU family backs it.
pub trait ArchDriver {
    fn kind(&self) -> ArchKind;

    /// How many arguments fit in registers before spilling to the stack.
    fn register_slot_count(&self) -> usize;

    /// Split a flat argument list into the per-architecture register/stack
    /// slot layout, enforcing alignment and budget rules (§4.D).
    fn layout_args(&self, args: &[SlotValue]) -> Result<ArgLayout, MarshalError>;

    /// Whether this driver can currently service a call at all (e.g. the
    /// x86-64 gadget has been found). Register-and-link never fails this.
    fn probe_capability(&self) -> bool;

    /// Drive one function call to completion on the (already suspended)
    /// remote thread and return the raw 64-bit return-register value.
    ///
    /// `thread` must be suspended on entry; it is suspended again on return,
    /// success or failure, unless the thread has become unreachable.
    fn call(
        &self,
        thread: mach2::mach_types::thread_act_t,
        function: u64,
        layout: &ArgLayout,
        stack: Option<&StackPair>,
    ) -> Result<u64, CallError>;

    /// Capture the thread's full register state, opaque to everything but
    /// this driver, for `PolicyFlags::PRESERVE`.
    fn snapshot_state(
        &self,
        thread: mach2::mach_types::thread_act_t,
    ) -> Result<Box<dyn std::any::Any + Send>, CallError>;

    /// Restore state previously returned by `snapshot_state` on the same
    /// thread. Panics if handed a snapshot from a different architecture;
    /// callers never mix these since a handle's driver is fixed for its
    /// lifetime.
    fn restore_state(
        &self,
        thread: mach2::mach_types::thread_act_t,
        saved: &(dyn std::any::Any + Send),
    ) -> Result<(), CallError>;
}

/// Mask a 64-bit value to its low `width` bytes and zero/sign-extend it back
/// out to 64 bits according to `signed`, the "already-extended 64-bit value,
/// masked to the declared width" rule from §4.D.
pub fn mask_to_width(value: u64, width: usize, signed: bool) -> Result<u64, MarshalError> {
    if width == 0 || width > 8 {
        return Err(MarshalError::OversizeValue(width));
    }
    if width == 8 {
        return Ok(value);
    }
    let shift = (8 - width) * 8;
    let low = (value << shift) >> shift;
    if signed {
        Ok(((low << shift) as i64 >> shift) as u64)
    } else {
        Ok(low)
    }
}

/// Build the concrete driver for `kind`, the dispatch point the marshaller
/// and acquisition module both go through instead of matching `ArchKind`
/// themselves.
pub fn build(kind: ArchKind, config: &crate::flags::Config) -> Box<dyn ArchDriver> {
    match kind {
        ArchKind::RegisterAndLink => Box::new(arm64::Arm64Driver::new(config)),
        ArchKind::RegisterAndStack => Box::new(x86_64::X86_64Driver::new(config)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_unsigned_narrow() {
        assert_eq!(mask_to_width(0xFFFF_FFFF_FFFF_FFFE, 1, false).unwrap(), 0xFE);
    }

    #[test]
    fn mask_signed_narrow_sign_extends() {
        // -2i8 as stored in a wide u64 slot should sign-extend back to -2i64.
        let narrow = 0xFEu64;
        let extended = mask_to_width(narrow, 1, true).unwrap();
        assert_eq!(extended as i64, -2);
    }

    #[test]
    fn mask_rejects_oversize() {
        assert!(mask_to_width(0, 9, false).is_err());
    }
}
