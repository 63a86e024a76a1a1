use prost::Message;
use prost_reflect::{DynamicMessage, MessageDescriptor};
use tonic::codec::{BufferSettings, Codec, Decoder, Encoder};
use tonic::Status;

/// A server-side gRPC codec for prost-reflect DynamicMessage.
///
/// Unlike tonic's ProstCodec which works with compile-time generated types,
/// this codec works with runtime-resolved message descriptors, so services
/// declared in loaded protos are serviceable without code generation. The
/// decoder produces request messages, the encoder writes response messages.
pub struct DynamicCodec {
    request_desc: MessageDescriptor,
    response_desc: MessageDescriptor,
}

impl DynamicCodec {
    pub fn new(request_desc: MessageDescriptor, response_desc: MessageDescriptor) -> Self {
        DynamicCodec {
            request_desc,
            response_desc,
        }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder {
            _response_desc: self.response_desc.clone(),
        }
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder {
            request_desc: self.request_desc.clone(),
        }
    }
}

/// Encodes response DynamicMessages into protobuf wire format.
pub struct DynamicEncoder {
    _response_desc: MessageDescriptor,
}

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut tonic::codec::EncodeBuf<'_>,
    ) -> Result<(), Self::Error> {
        item.encode(dst)
            .map_err(|e| Status::internal(format!("failed to encode response: {e}")))?;
        Ok(())
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}

/// Decodes protobuf wire format into request DynamicMessages.
pub struct DynamicDecoder {
    request_desc: MessageDescriptor,
}

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(
        &mut self,
        src: &mut tonic::codec::DecodeBuf<'_>,
    ) -> Result<Option<Self::Item>, Self::Error> {
        let msg = DynamicMessage::decode(self.request_desc.clone(), src)
            .map_err(|e| Status::internal(format!("failed to decode request: {e}")))?;
        Ok(Some(msg))
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}
