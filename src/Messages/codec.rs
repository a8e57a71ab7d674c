use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

use super::types::{MessageType, PayloadType};
use crate::error::{ChannelError, CodecError};

/// A payload that can travel over a channel.
///
/// On the wire a message is its `PAYLOAD_TYPE` byte followed by the encoded body.
/// Bodies are self-describing maps, so fields a receiver does not know are skipped.
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    const MESSAGE_TYPE: MessageType;
    const PAYLOAD_TYPE: PayloadType;

    fn encode_body<W: Write>(&self, writer: &mut W) -> Result<(), CodecError> {
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    fn decode_body<R: Read>(reader: &mut R) -> Result<Self, CodecError> {
        Ok(serde_json::from_reader(reader)?)
    }
}

/// Write the payload discriminant and body of `msg`.
pub fn encode_message<M: Message, W: Write>(msg: &M, writer: &mut W) -> Result<(), CodecError> {
    writer.write_all(&[M::PAYLOAD_TYPE.value()])?;
    msg.encode_body(writer)
}

/// Read a payload discriminant, check it against `M`, then decode the body.
pub fn decode_message<M: Message, R: Read>(reader: &mut R) -> Result<M, ChannelError> {
    let mut discriminant = [0u8; 1];
    match reader.read(&mut discriminant) {
        Ok(1) => {}
        Ok(_) => return Err(ChannelError::DeserializeFail(CodecError::Empty)),
        Err(e) => return Err(ChannelError::DeserializeFail(CodecError::Io(e))),
    }

    if discriminant[0] != M::PAYLOAD_TYPE.value() {
        return Err(ChannelError::DeserializeFailByMessageType {
            expected: M::PAYLOAD_TYPE.value(),
            actual: discriminant[0],
        });
    }

    M::decode_body(reader).map_err(ChannelError::DeserializeFail)
}
