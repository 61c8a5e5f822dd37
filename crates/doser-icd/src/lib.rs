#![cfg_attr(not(any(test, feature = "use-std")), no_std)]
//! Interface control document for the doser chain bus.
//!
//! Every message travels in a single classic 8-byte frame. Identifiers are
//! fixed by the peer firmware and a response always uses `request + 1`.

mod frame;
mod messages;
mod status;

pub use frame::*;
pub use messages::*;
pub use status::*;

/// Global pump channel address, unique across the chain.
pub type Address = u32;

/// Flow rate in ml/min. Zero means off.
pub type FlowRate = u16;

// Constants
pub const FRAME_CAPACITY: usize = 8;
pub const RESPONSE_OFFSET: u32 = 1;

/// Bus identifiers of the chain protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Rpc {
    Restart = 0x03,
    NewModule = 0x05,
    SetFlowRate = 0x07,
    LastNode = 0x09,
}

impl Rpc {
    pub const fn id(self) -> u32 {
        self as u32
    }

    /// Identifier carrying the response to this request.
    pub const fn response_id(self) -> u32 {
        self as u32 + RESPONSE_OFFSET
    }
}

impl TryFrom<u32> for Rpc {
    type Error = DecodeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x03 => Ok(Rpc::Restart),
            0x05 => Ok(Rpc::NewModule),
            0x07 => Ok(Rpc::SetFlowRate),
            0x09 => Ok(Rpc::LastNode),
            _ => Err(DecodeError::UnknownId(value)),
        }
    }
}

impl From<Rpc> for u32 {
    fn from(value: Rpc) -> Self {
        value.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_match_peer_firmware() {
        assert_eq!(Rpc::Restart.id(), 0x03);
        assert_eq!(Rpc::NewModule.id(), 0x05);
        assert_eq!(Rpc::NewModule.response_id(), 0x06);
        assert_eq!(Rpc::SetFlowRate.id(), 0x07);
        assert_eq!(Rpc::LastNode.id(), 0x09);
    }

    #[test]
    fn response_ids_are_not_requests() {
        for rpc in [Rpc::Restart, Rpc::NewModule, Rpc::SetFlowRate, Rpc::LastNode]
        {
            assert_eq!(Rpc::try_from(rpc.id()), Ok(rpc));
            assert!(Rpc::try_from(rpc.response_id()).is_err());
        }
    }
}
