//! The error taxonomy from the design's failure-kind breakdown: one variant
//! family per domain (kernel call, acquisition, staging, call, marshalling),
//! unified under a single top-level error so callers can `?` across
//! subsystem boundaries, the way `other_examples`' mach wrapper layers a
//! `thiserror` enum per concern and `rd` keeps per-domain error types rather
//! than one monolithic error.

use crate::mach::KernelError;

/// A named Mach/libc primitive failed.
#[derive(thiserror::Error, Debug)]
#[error("{primitive} failed: {source}")]
pub struct KernelCallError {
    pub primitive: &'static str,
    #[source]
    pub source: KernelError,
}

impl KernelCallError {
    pub fn new(primitive: &'static str, source: KernelError) -> KernelCallError {
        KernelCallError { primitive, source }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AcquisitionError {
    #[error("no runnable thread found in target task")]
    NoRunnableThread,
    #[error("remote thread creation failed: {0}")]
    SpawnFailed(#[from] KernelCallError),
    #[error("could not translate pthread handle to a kernel thread port")]
    ThreadTranslationFailed,
    #[error(
        "policy flags {0:?} are incompatible with the chosen acquisition strategy"
    )]
    IncompatibleFlags(crate::flags::PolicyFlags),
    #[error("failed to bootstrap TLS on the spawned thread: {0}")]
    TlsBootstrapFailed(#[from] CallError),
}

#[derive(thiserror::Error, Debug)]
pub enum StagingError {
    #[error("failed to pair bootstrap ports: {0}")]
    PortPairing(#[from] KernelCallError),
    #[error("failed to stage shared memory: {0}")]
    SharedMemory(KernelCallError),
    #[error("remote memory allocation returned an unreadable address")]
    BadRemoteAddress,
}

#[derive(thiserror::Error, Debug)]
pub enum CallError {
    #[error("could not read remote thread state: {0}")]
    GetState(KernelCallError),
    #[error("could not set remote thread state: {0}")]
    SetState(KernelCallError),
    #[error("could not resume remote thread: {0}")]
    Resume(KernelCallError),
    #[error("could not suspend remote thread: {0}")]
    Suspend(KernelCallError),
    #[error("remote thread did not reach the completion sentinel before it stopped responding")]
    LostThread,
    #[error("no usable return-trampoline gadget could be located; call unsupported")]
    GadgetUnavailable,
    #[error("argument marshalling failed: {0}")]
    Marshal(#[from] MarshalError),
    #[error("{primitive} returned failure code {code}")]
    FunctionFailed { primitive: &'static str, code: i64 },
}

#[derive(thiserror::Error, Debug)]
pub enum MarshalError {
    #[error("unsupported argument classification for this architecture")]
    UnsupportedClassification,
    #[error("too many arguments: {count} exceeds the stack budget of {budget} bytes")]
    StackBudgetExceeded { count: usize, budget: usize },
    #[error("value of width {0} bytes does not fit in a machine word")]
    OversizeValue(usize),
    #[error("result width {0} exceeds the 8-byte return register")]
    OversizeResult(usize),
    #[error("shared memory exhausted while marshalling buffer of {0} bytes")]
    SharedMemoryExhausted(usize),
    #[error("this argument requires shared memory, but the call was given none")]
    SharedMemoryUnavailable,
    #[error("call layout requires a stack, but none was provided")]
    StackUnavailable,
    #[error("path contains an interior null byte and cannot be passed as a C string")]
    InvalidCString,
}

#[derive(thiserror::Error, Debug)]
pub enum ThreadexecError {
    #[error(transparent)]
    Kernel(#[from] KernelCallError),
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    Marshal(#[from] MarshalError),
    #[error("handle has already been torn down")]
    TornDown,
    #[error("a call is already in flight on this handle")]
    CallInProgress,
}

pub type Result<T> = std::result::Result<T, ThreadexecError>;
