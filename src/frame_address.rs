use std::fmt;

use crate::display_utils::HexNum;

/// The address of a frame in a stack, along with how it was obtained.
///
/// The innermost frame's address is the interrupted instruction pointer. All other
/// frames are return addresses, which point at the instruction *after* the call. To
/// find the unwind rule or symbol of the call instruction itself, lookups use
/// `address - 1` for return addresses; see [`FrameAddress::address_for_lookup`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameAddress {
    /// The value of the instruction pointer at the time of capture.
    InstructionPointer(u64),
    /// A return address recovered by unwinding. Never zero.
    ReturnAddress(u64),
}

impl FrameAddress {
    /// Create a [`FrameAddress::ReturnAddress`], or `None` for a null return address.
    pub fn from_return_address(return_address: u64) -> Option<Self> {
        if return_address == 0 {
            None
        } else {
            Some(FrameAddress::ReturnAddress(return_address))
        }
    }

    /// The raw address.
    pub fn address(self) -> u64 {
        match self {
            FrameAddress::InstructionPointer(address) => address,
            FrameAddress::ReturnAddress(address) => address,
        }
    }

    /// The address to use when looking up unwind rules and symbols.
    pub fn address_for_lookup(self) -> u64 {
        match self {
            FrameAddress::InstructionPointer(address) => address,
            FrameAddress::ReturnAddress(address) => address - 1,
        }
    }

    pub fn is_return_address(self) -> bool {
        matches!(self, FrameAddress::ReturnAddress(_))
    }
}

impl fmt::Debug for FrameAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameAddress::InstructionPointer(address) => {
                f.debug_tuple("InstructionPointer").field(&HexNum(*address)).finish()
            }
            FrameAddress::ReturnAddress(address) => {
                f.debug_tuple("ReturnAddress").field(&HexNum(*address)).finish()
            }
        }
    }
}
