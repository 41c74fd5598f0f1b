use std::path::PathBuf;

use crate::frame::{CaptureMethod, StopReason, Target};
use crate::remote::RemoteError;

/// An error that stopped a single unwind step.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("Could not read stack memory at 0x{0:x}")]
    CouldNotReadStack(u64),

    #[error("Frame pointer unwinding moved backwards")]
    FramepointerUnwindingMovedBackwards,

    #[error("Frame pointer 0x{0:x} is not aligned")]
    MisalignedFramePointer(u64),

    #[error("Neither the code address nor the stack pointer changed, would loop")]
    DidNotAdvance,

    #[error("Unwinding caused integer overflow")]
    IntegerOverflow,
}

impl Error {
    /// How a walk that ended with this error is reported.
    pub fn stop_reason(self) -> StopReason {
        match self {
            Error::CouldNotReadStack(_) => StopReason::StackReadFailed,
            _ => StopReason::ChainCorrupted,
        }
    }
}

/// An error from loading the modules of a process.
#[derive(thiserror::Error, Debug)]
pub enum ModuleError {
    #[error("Could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not parse {} as an object file: {source}", path.display())]
    Object {
        path: PathBuf,
        #[source]
        source: object::Error,
    },

    #[error("Malformed line in maps file: {0:?}")]
    MalformedMapsLine(String),

    #[error("No loadable segment of {} covers file offset 0x{offset:x}", path.display())]
    NoSegmentForOffset { path: PathBuf, offset: u64 },
}

/// The error type of [`capture`](crate::capture).
#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("{method:?} cannot capture {target:?}")]
    UnsupportedTarget { method: CaptureMethod, target: Target },
}
