//! Wire codec SPI.
//!
//! A codec owns the framing contract: it is the only place where raw bytes are
//! mapped to and from application messages. The framework feeds the inbound
//! accumulation buffer to `decode` every time more bytes arrive and writes
//! whatever `encode` produces, it never interprets payloads itself.

pub use length_field::LengthFieldCodec;
pub use text_line::TextLineCodec;

mod length_field;
mod text_line;

use bytes::BytesMut;

use crate::ServResult;

/// Translator between the raw byte stream and typed messages.
///
/// `decode` is called repeatedly as bytes arrive. It must return `Ok(None)`
/// when the buffer does not yet hold a complete frame, without consuming any
/// input, and must consume exactly one frame's bytes when it returns a
/// message. A `ServError::Frame` return closes the owning session: a byte
/// stream cannot recover from a framing desync mid-stream.
///
/// On datagram transports every received buffer is one self-contained frame,
/// so `decode` sees exactly one datagram per call and keeps no cross-call
/// state.
pub trait Codec: Send + Sync + 'static {
    type Msg: Send + 'static;

    /// Appends the encoded frame for `msg` to `dst`.
    fn encode(&self, msg: &Self::Msg, dst: &mut BytesMut) -> ServResult<()>;

    /// Consumes at most one complete frame from `src`.
    fn decode(&self, src: &mut BytesMut) -> ServResult<Option<Self::Msg>>;
}
