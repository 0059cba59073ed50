use bytes::{BufMut, BytesMut};

use super::Codec;
use crate::{ServError, ServResult};

/// Newline-delimited UTF-8 codec.
///
/// Frames are lines terminated by `\n`; a trailing `\r` is stripped. Useful
/// for line-oriented protocols and debugging with plain tools.
#[derive(Debug, Clone)]
pub struct TextLineCodec {
    max_line_length: usize,
}

impl Default for TextLineCodec {
    fn default() -> Self {
        TextLineCodec::new(64 * 1024)
    }
}

impl TextLineCodec {
    pub fn new(max_line_length: usize) -> Self {
        TextLineCodec { max_line_length }
    }
}

impl Codec for TextLineCodec {
    type Msg = String;

    fn encode(&self, msg: &String, dst: &mut BytesMut) -> ServResult<()> {
        if msg.len() > self.max_line_length {
            return Err(ServError::Codec(format!(
                "line of length {} exceeds max line length {}",
                msg.len(),
                self.max_line_length
            )));
        }
        if msg.contains('\n') {
            return Err(ServError::Codec(
                "line payload must not contain a newline".to_string(),
            ));
        }
        dst.reserve(msg.len() + 1);
        dst.extend_from_slice(msg.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> ServResult<Option<String>> {
        let newline = src.iter().position(|b| *b == b'\n');
        let Some(pos) = newline else {
            if src.len() > self.max_line_length {
                return Err(ServError::Frame(format!(
                    "line exceeds max length {} without terminator",
                    self.max_line_length
                )));
            }
            return Ok(None);
        };

        let mut line = src.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        let text = String::from_utf8(line.to_vec())
            .map_err(|e| ServError::Frame(format!("line is not valid utf-8: {}", e)))?;
        Ok(Some(text))
    }
}
