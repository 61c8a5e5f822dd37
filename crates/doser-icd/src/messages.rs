use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::{Address, FlowRate, Frame, Rpc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// Identifier is not part of the chain protocol.
    UnknownId(u32),
    /// Frame carries a different message than the one requested.
    UnexpectedId { expected: u32, actual: u32 },
    /// Payload is too short for the message fields.
    Length { id: u32, required: usize, actual: usize },
}

/// A fixed-layout message payload.
///
/// Layouts are little endian and padded exactly like the peer firmware's
/// naturally aligned structs, so `WIRE_LENGTH` may exceed `MIN_LENGTH`.
pub trait Payload: Sized {
    const ID: u32;
    /// Data length code used when transmitting.
    const WIRE_LENGTH: usize;
    /// Bytes needed to decode every field.
    const MIN_LENGTH: usize;

    fn write(&self, buf: &mut [u8]);
    fn read(buf: &[u8]) -> Self;

    fn to_frame(&self) -> Frame {
        let mut data = [0u8; crate::FRAME_CAPACITY];
        self.write(&mut data[..Self::WIRE_LENGTH]);
        Frame {
            id: Self::ID,
            data: heapless::Vec::from_slice(&data[..Self::WIRE_LENGTH])
                .unwrap_or_default(),
        }
    }

    fn from_frame(frame: &Frame) -> Result<Self, DecodeError> {
        if frame.id != Self::ID {
            return Err(DecodeError::UnexpectedId {
                expected: Self::ID,
                actual: frame.id,
            });
        }
        if frame.dlc() < Self::MIN_LENGTH {
            return Err(DecodeError::Length {
                id: frame.id,
                required: Self::MIN_LENGTH,
                actual: frame.dlc(),
            });
        }
        Ok(Self::read(&frame.data))
    }
}

/// Broadcast by the controller: every module drops to a clean reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RestartCommand;

/// Sent by a module until the controller assigns it a base address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NewModuleCommand {
    pub num_dosers: u8,
    pub max_flow_rate: FlowRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NewModuleResponse {
    /// Address of the module's first channel.
    pub base_address: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetFlowRateCommand {
    pub address: Address,
    pub flow_rate: FlowRate,
}

/// Sent by the module that found no downstream neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LastNodeCommand;

impl Payload for RestartCommand {
    const ID: u32 = Rpc::Restart.id();
    const WIRE_LENGTH: usize = 1;
    const MIN_LENGTH: usize = 0;

    fn write(&self, _buf: &mut [u8]) {}

    fn read(_buf: &[u8]) -> Self {
        RestartCommand
    }
}

impl Payload for NewModuleCommand {
    const ID: u32 = Rpc::NewModule.id();
    const WIRE_LENGTH: usize = 4;
    const MIN_LENGTH: usize = 4;

    fn write(&self, buf: &mut [u8]) {
        buf[0] = self.num_dosers;
        LittleEndian::write_u16(&mut buf[2..4], self.max_flow_rate);
    }

    fn read(buf: &[u8]) -> Self {
        Self {
            num_dosers: buf[0],
            max_flow_rate: LittleEndian::read_u16(&buf[2..4]),
        }
    }
}

impl Payload for NewModuleResponse {
    const ID: u32 = Rpc::NewModule.response_id();
    const WIRE_LENGTH: usize = 4;
    const MIN_LENGTH: usize = 4;

    fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.base_address);
    }

    fn read(buf: &[u8]) -> Self {
        Self { base_address: LittleEndian::read_u32(&buf[0..4]) }
    }
}

impl Payload for SetFlowRateCommand {
    const ID: u32 = Rpc::SetFlowRate.id();
    const WIRE_LENGTH: usize = 8;
    const MIN_LENGTH: usize = 6;

    fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.address);
        LittleEndian::write_u16(&mut buf[4..6], self.flow_rate);
    }

    fn read(buf: &[u8]) -> Self {
        Self {
            address: LittleEndian::read_u32(&buf[0..4]),
            flow_rate: LittleEndian::read_u16(&buf[4..6]),
        }
    }
}

impl Payload for LastNodeCommand {
    const ID: u32 = Rpc::LastNode.id();
    const WIRE_LENGTH: usize = 1;
    const MIN_LENGTH: usize = 0;

    fn write(&self, _buf: &mut [u8]) {}

    fn read(_buf: &[u8]) -> Self {
        LastNodeCommand
    }
}

/// Any message of the chain protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Message {
    Restart(RestartCommand),
    NewModule(NewModuleCommand),
    NewModuleResponse(NewModuleResponse),
    SetFlowRate(SetFlowRateCommand),
    LastNode(LastNodeCommand),
}

impl Message {
    pub fn id(&self) -> u32 {
        match self {
            Message::Restart(_) => RestartCommand::ID,
            Message::NewModule(_) => NewModuleCommand::ID,
            Message::NewModuleResponse(_) => NewModuleResponse::ID,
            Message::SetFlowRate(_) => SetFlowRateCommand::ID,
            Message::LastNode(_) => LastNodeCommand::ID,
        }
    }

    pub fn to_frame(&self) -> Frame {
        match self {
            Message::Restart(m) => m.to_frame(),
            Message::NewModule(m) => m.to_frame(),
            Message::NewModuleResponse(m) => m.to_frame(),
            Message::SetFlowRate(m) => m.to_frame(),
            Message::LastNode(m) => m.to_frame(),
        }
    }
}

impl TryFrom<&Frame> for Message {
    type Error = DecodeError;

    fn try_from(frame: &Frame) -> Result<Self, Self::Error> {
        match frame.id {
            id if id == RestartCommand::ID => {
                RestartCommand::from_frame(frame).map(Message::Restart)
            }
            id if id == NewModuleCommand::ID => {
                NewModuleCommand::from_frame(frame).map(Message::NewModule)
            }
            id if id == NewModuleResponse::ID => {
                NewModuleResponse::from_frame(frame)
                    .map(Message::NewModuleResponse)
            }
            id if id == SetFlowRateCommand::ID => {
                SetFlowRateCommand::from_frame(frame).map(Message::SetFlowRate)
            }
            id if id == LastNodeCommand::ID => {
                LastNodeCommand::from_frame(frame).map(Message::LastNode)
            }
            id => Err(DecodeError::UnknownId(id)),
        }
    }
}

macro_rules! impl_from_payload {
    ($($variant:ident => $payload:ty),* $(,)?) => {
        $(
            impl From<$payload> for Message {
                fn from(value: $payload) -> Self {
                    Message::$variant(value)
                }
            }
        )*
    };
}

impl_from_payload! {
    Restart => RestartCommand,
    NewModule => NewModuleCommand,
    NewModuleResponse => NewModuleResponse,
    SetFlowRate => SetFlowRateCommand,
    LastNode => LastNodeCommand,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_module_layout_is_padded() {
        let frame = NewModuleCommand { num_dosers: 4, max_flow_rate: 0x013c }
            .to_frame();
        assert_eq!(frame.id, 0x05);
        assert_eq!(&frame.data[..], &[4, 0, 0x3c, 0x01]);
    }

    #[test]
    fn set_flow_rate_fills_classic_frame() {
        let frame = SetFlowRateCommand { address: 0x0102_0304, flow_rate: 60 }
            .to_frame();
        assert_eq!(frame.id, 0x07);
        assert_eq!(&frame.data[..], &[4, 3, 2, 1, 60, 0, 0, 0]);
    }

    #[test]
    fn response_uses_offset_identifier() {
        let frame = NewModuleResponse { base_address: 6 }.to_frame();
        assert_eq!(frame.id, 0x06);
        assert_eq!(&frame.data[..], &[6, 0, 0, 0]);
    }

    #[test]
    fn empty_commands_send_one_byte() {
        assert_eq!(RestartCommand.to_frame().dlc(), 1);
        assert_eq!(LastNodeCommand.to_frame().dlc(), 1);
        assert_eq!(
            Message::try_from(&Frame::new(0x09, &[]).unwrap()),
            Ok(Message::LastNode(LastNodeCommand))
        );
    }

    #[test]
    fn accepts_unpadded_flow_rate() {
        let frame = Frame::new(0x07, &[2, 0, 0, 0, 30, 0]).unwrap();
        assert_eq!(
            Message::try_from(&frame),
            Ok(Message::SetFlowRate(SetFlowRateCommand {
                address: 2,
                flow_rate: 30
            }))
        );
    }

    #[test]
    fn short_payload_is_rejected() {
        let frame = Frame::new(0x05, &[1, 0, 60]).unwrap();
        assert_eq!(
            Message::try_from(&frame),
            Err(DecodeError::Length { id: 0x05, required: 4, actual: 3 })
        );
    }

    #[test]
    fn unknown_identifier_is_reported() {
        let frame = Frame::new(0x42, &[0; 8]).unwrap();
        assert_eq!(Message::try_from(&frame), Err(DecodeError::UnknownId(0x42)));
    }

    #[test]
    fn typed_decode_checks_identifier() {
        let frame = LastNodeCommand.to_frame();
        assert_eq!(
            NewModuleResponse::from_frame(&frame),
            Err(DecodeError::UnexpectedId { expected: 0x06, actual: 0x09 })
        );
    }
}
