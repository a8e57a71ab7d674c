use std::convert::TryFrom;

use crate::error::ChannelError;

/// Wire discriminant stamped on every chunk of a message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    InvokeRequire = 1,
    InvokeResponse = 2,
    InvalidModelsCache = 3,
    MetricRequire = 4,
}

impl MessageType {
    #[inline]
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ChannelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::InvokeRequire),
            2 => Ok(MessageType::InvokeResponse),
            3 => Ok(MessageType::InvalidModelsCache),
            4 => Ok(MessageType::MetricRequire),
            other => Err(ChannelError::UnknownMessageType(other)),
        }
    }
}

/// Codec discriminant written as the first byte of every payload stream.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadType {
    InvokeRequire = 0x41,
    InvokeResponse = 0x42,
    InvalidModelsCache = 0x43,
    MetricRequire = 0x44,
}

impl PayloadType {
    #[inline]
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PayloadType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x41 => Ok(PayloadType::InvokeRequire),
            0x42 => Ok(PayloadType::InvokeResponse),
            0x43 => Ok(PayloadType::InvalidModelsCache),
            0x44 => Ok(PayloadType::MetricRequire),
            _ => Err(()),
        }
    }
}
