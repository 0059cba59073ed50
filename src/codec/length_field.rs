use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::Codec;
use crate::ServError::Incomplete;
use crate::{ServError, ServResult};

pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Binary codec with a 4-byte big-endian length prefix.
///
/// The prefix counts payload bytes only. Frames larger than the configured
/// limit and negative prefixes are rejected as framing errors.
#[derive(Debug, Clone)]
pub struct LengthFieldCodec {
    max_frame_size: usize,
}

impl Default for LengthFieldCodec {
    fn default() -> Self {
        LengthFieldCodec::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl LengthFieldCodec {
    pub fn new(max_frame_size: usize) -> Self {
        LengthFieldCodec { max_frame_size }
    }

    fn check(&self, buffer: &mut BytesMut) -> ServResult<()> {
        if buffer.remaining() < 4 {
            return Err(Incomplete);
        }
        let bytes_slice = buffer.get(0..4).unwrap();
        let body_size = i32::from_be_bytes(bytes_slice.try_into().unwrap());
        if body_size < 0 {
            return Err(ServError::Frame(format!(
                "frame size {} less than 0",
                body_size
            )));
        }
        if body_size as usize > self.max_frame_size {
            return Err(ServError::Frame(format!(
                "frame of length {} is too large",
                body_size
            )));
        }
        if buffer.remaining() < body_size as usize + 4 {
            buffer.reserve(body_size as usize + 4);
            return Err(Incomplete);
        }
        Ok(())
    }
}

impl Codec for LengthFieldCodec {
    type Msg = Bytes;

    fn encode(&self, msg: &Bytes, dst: &mut BytesMut) -> ServResult<()> {
        if msg.len() > self.max_frame_size {
            return Err(ServError::Codec(format!(
                "message of length {} exceeds max frame size {}",
                msg.len(),
                self.max_frame_size
            )));
        }
        dst.reserve(4 + msg.len());
        dst.put_i32(msg.len() as i32);
        dst.extend_from_slice(msg);
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> ServResult<Option<Bytes>> {
        match self.check(src) {
            Ok(_) => {
                let body_size = src.get_i32();
                let body = src.split_to(body_size as usize);
                Ok(Some(body.freeze()))
            }
            Err(Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let codec = LengthFieldCodec::default();
        let msg = Bytes::from_static(b"hello serv");

        let mut wire = BytesMut::new();
        codec.encode(&msg, &mut wire).unwrap();

        let decoded = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(wire.is_empty());
    }

    #[test]
    fn test_round_trip_one_byte_at_a_time() {
        let codec = LengthFieldCodec::default();
        let msg = Bytes::from_static(b"split across many partial reads");

        let mut wire = BytesMut::new();
        codec.encode(&msg, &mut wire).unwrap();

        let mut buffer = BytesMut::new();
        let mut decoded = None;
        for byte in wire.iter() {
            assert!(decoded.is_none());
            buffer.extend_from_slice(&[*byte]);
            decoded = codec.decode(&mut buffer).unwrap();
        }
        assert_eq!(decoded.unwrap(), msg);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let codec = LengthFieldCodec::default();
        let mut wire = BytesMut::new();
        codec.encode(&Bytes::from_static(b"first"), &mut wire).unwrap();
        codec.encode(&Bytes::from_static(b"second"), &mut wire).unwrap();

        assert_eq!(codec.decode(&mut wire).unwrap().unwrap(), "first");
        assert_eq!(codec.decode(&mut wire).unwrap().unwrap(), "second");
        assert_eq!(codec.decode(&mut wire).unwrap(), None);
    }

    #[test]
    fn test_negative_length_prefix() {
        let codec = LengthFieldCodec::default();
        let mut wire = BytesMut::from(&(-7i32).to_be_bytes()[..]);
        assert!(matches!(
            codec.decode(&mut wire),
            Err(ServError::Frame(_))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let codec = LengthFieldCodec::new(16);
        let mut wire = BytesMut::from(&1024i32.to_be_bytes()[..]);
        assert!(matches!(
            codec.decode(&mut wire),
            Err(ServError::Frame(_))
        ));

        let big = Bytes::from(vec![0u8; 17]);
        let mut dst = BytesMut::new();
        assert!(matches!(
            codec.encode(&big, &mut dst),
            Err(ServError::Codec(_))
        ));
    }
}
