use mach2::kern_return::kern_return_t;

/// A Mach kernel error, i.e. a non-`KERN_SUCCESS` `kern_return_t`.
///
/// See `<mach/kern_return.h>`.
#[derive(thiserror::Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum KernelError {
    #[error("specified address is not currently valid")]
    InvalidAddress = 1,
    #[error("specified memory is valid, but does not permit the required forms of access")]
    ProtectionFailure = 2,
    #[error("the address range specified is already in use")]
    NoSpace = 3,
    #[error("the function requested was not applicable to this type of argument")]
    InvalidArgument = 4,
    #[error("the function could not be performed")]
    Failure = 5,
    #[error("system resource could not be allocated to fulfill this request")]
    ResourceShortage = 6,
    #[error("the task does not hold receive rights for the port argument")]
    NotReceiver = 7,
    #[error("bogus access restriction")]
    NoAccess = 8,
    #[error("during a page fault, the target memory object was destroyed")]
    MemoryFailure = 9,
    #[error("the name already denotes a right in the task")]
    NameExists = 13,
    #[error("the operation was aborted")]
    Aborted = 14,
    #[error("the name doesn't denote a right in the task")]
    InvalidName = 15,
    #[error("target task isn't an active task")]
    InvalidTask = 16,
    #[error("the name denotes a right, but not an appropriate right")]
    InvalidRight = 17,
    #[error("a blatant range error")]
    InvalidValue = 18,
    #[error("the supplied port capability is improper")]
    InvalidCapability = 20,
    #[error("target host isn't actually a host")]
    InvalidHost = 22,
    #[error("unknown kernel error {0}")]
    Other(kern_return_t),
}

impl KernelError {
    fn from_raw(kr: kern_return_t) -> KernelError {
        use KernelError::*;
        match kr {
            1 => InvalidAddress,
            2 => ProtectionFailure,
            3 => NoSpace,
            4 => InvalidArgument,
            5 => Failure,
            6 => ResourceShortage,
            7 => NotReceiver,
            8 => NoAccess,
            9 => MemoryFailure,
            13 => NameExists,
            14 => Aborted,
            15 => InvalidName,
            16 => InvalidTask,
            17 => InvalidRight,
            18 => InvalidValue,
            20 => InvalidCapability,
            22 => InvalidHost,
            other => Other(other),
        }
    }
}

/// Turn a raw `kern_return_t` into a `Result`, the way every wrapper in
/// `mach/` and above should at the FFI boundary.
pub fn kr_result(kr: kern_return_t) -> Result<(), KernelError> {
    if kr == mach2::kern_return::KERN_SUCCESS {
        Ok(())
    } else {
        Err(KernelError::from_raw(kr))
    }
}
