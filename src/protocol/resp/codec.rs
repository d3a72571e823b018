//! RESP connection codec.

use super::parser::RespParser;
use super::types::RespValue;
use crate::commands::{Command, CommandHandler, Reply};
use crate::protocol::{Codec, Flow, FrameError};
use bytes::{Bytes, BytesMut};
use tracing::debug;

#[derive(Debug, Default)]
pub struct RespCodec {
    parser: RespParser,
}

impl RespCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Codec for RespCodec {
    type Request = Vec<Bytes>;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<Bytes>>, FrameError> {
        loop {
            let Some((ranges, consumed)) = self.parser.parse(buf)? else {
                return Ok(None);
            };
            let frame = buf.split_to(consumed).freeze();
            if ranges.is_empty() {
                continue;
            }
            return Ok(Some(ranges.into_iter().map(|r| frame.slice(r)).collect()));
        }
    }

    fn handle(&mut self, args: Vec<Bytes>, commands: &CommandHandler, out: &mut BytesMut) -> Flow {
        let result = Command::from_args(args).and_then(|command| commands.execute(command));
        match result {
            Ok(Reply::Close) => {
                RespValue::ok().serialize_into(out);
                Flow::Close
            }
            Ok(reply) => {
                RespValue::from(reply).serialize_into(out);
                Flow::Continue
            }
            Err(err) => {
                debug!(error = %err, "RESP command failed");
                RespValue::from(&err).serialize_into(out);
                Flow::Continue
            }
        }
    }

    fn encode_error(&mut self, err: &FrameError, out: &mut BytesMut) {
        RespValue::error(format!("ERR Protocol error: {}", err)).serialize_into(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageEngine;
    use std::sync::Arc;

    fn roundtrip(codec: &mut RespCodec, commands: &CommandHandler, input: &[u8]) -> (BytesMut, Vec<Flow>) {
        let mut buf = BytesMut::from(input);
        let mut out = BytesMut::new();
        let mut flows = Vec::new();
        while let Some(request) = codec.decode(&mut buf).unwrap() {
            flows.push(codec.handle(request, commands, &mut out));
        }
        (out, flows)
    }

    fn handler() -> CommandHandler {
        CommandHandler::new(Arc::new(StorageEngine::new()))
    }

    #[test]
    fn test_set_get_pipeline() {
        let commands = handler();
        let mut codec = RespCodec::new();
        let (out, _) = roundtrip(
            &mut codec,
            &commands,
            b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\nGET missing\r\n",
        );
        assert_eq!(&out[..], b"+OK\r\n$3\r\nbar\r\n$-1\r\n");
    }

    #[test]
    fn test_errors_keep_connection_open() {
        let commands = handler();
        let mut codec = RespCodec::new();
        let (out, flows) = roundtrip(&mut codec, &commands, b"NOPE\r\nGET\r\nPING\r\n");
        assert_eq!(
            &out[..],
            &b"-ERR unknown command 'NOPE'\r\n-ERR wrong number of arguments for 'get' command\r\n+PONG\r\n"[..]
        );
        assert!(flows.iter().all(|f| *f == Flow::Continue));
    }

    #[test]
    fn test_quit_closes() {
        let commands = handler();
        let mut codec = RespCodec::new();
        let (out, flows) = roundtrip(&mut codec, &commands, b"QUIT\r\n");
        assert_eq!(&out[..], b"+OK\r\n");
        assert_eq!(flows, vec![Flow::Close]);
    }

    #[test]
    fn test_partial_frame_left_in_buffer() {
        let mut codec = RespCodec::new();
        let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPI"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_empty_key_rejected() {
        let commands = handler();
        let mut codec = RespCodec::new();
        let (out, _) = roundtrip(&mut codec, &commands, b"*3\r\n$3\r\nSET\r\n$0\r\n\r\n$1\r\nv\r\n");
        assert_eq!(&out[..], b"-ERR invalid key\r\n");
    }

    #[test]
    fn test_protocol_error_rendering() {
        let mut codec = RespCodec::new();
        let mut out = BytesMut::new();
        codec.encode_error(&FrameError::malformed("expected '$', got ':'"), &mut out);
        assert_eq!(&out[..], b"-ERR Protocol error: expected '$', got ':'\r\n");
    }
}
