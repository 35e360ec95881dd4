use std::io::{self, ErrorKind, Read, Write};

use bincode::{
    Decode,
    config::{BigEndian, Configuration, Fixint, Limit},
    de::Decoder,
    decode_from_slice, encode_to_vec,
    error::DecodeError,
};
use thiserror::Error;

use super::{
    Message, MessageKind, Payload,
    message::{decode_payload, decode_text},
};

/// Default cap on a single message body.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Largest body cap a transport accepts. Byte strings claimed while decoding one
/// body are bounded by the same figure.
pub const MAX_MESSAGE_SIZE_LIMIT: usize = 64 * 1024 * 1024;

const LENGTH_PREFIX_SIZE: usize = 4;
const READ_CHUNK_SIZE: usize = 4096;
const DECODE_LIMIT: usize = MAX_MESSAGE_SIZE_LIMIT;

type WireConfig = Configuration<BigEndian, Fixint, Limit<DECODE_LIMIT>>;

fn wire_config() -> WireConfig {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
        .with_limit::<DECODE_LIMIT>()
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode message: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("message of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("stream closed after {received} of {expected} bytes")]
    Truncated { expected: usize, received: usize },
    #[error("read timed out after {received} of {expected} bytes")]
    Timeout { expected: usize, received: usize },
    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// A read stalled part way through a frame.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }

    /// The byte stream no longer lines up with message boundaries.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            TransportError::Deserialize(_)
                | TransportError::TooLarge { .. }
                | TransportError::Truncated { .. }
                | TransportError::TrailingBytes(_)
        )
    }
}

/// Outcome of one receive attempt.
#[derive(Debug, PartialEq)]
pub enum Received {
    Message(Message),
    /// The read timed out before any byte of a new frame arrived.
    Idle,
    /// The peer closed the stream cleanly between frames.
    Closed,
}

/// Decoded `(kind, payload)` body.
struct Body {
    kind: String,
    payload: Payload,
}

impl<Context> Decode<Context> for Body {
    fn decode<D: Decoder<Context = Context>>(decoder: &mut D) -> Result<Self, DecodeError> {
        Ok(Body {
            kind: decode_text(decoder)?,
            payload: decode_payload(decoder)?,
        })
    }
}

/// Frames `message` as `u32 big-endian body length || body`.
pub fn encode(message: &Message) -> Result<Vec<u8>, TransportError> {
    let body = encode_to_vec((message.kind().as_str(), message.payload()), wire_config())?;
    let len = u32::try_from(body.len()).map_err(|_| TransportError::TooLarge {
        len: body.len(),
        max: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decodes one message body (without its length prefix).
pub fn decode_body(body: &[u8]) -> Result<Message, TransportError> {
    let (decoded, read): (Body, usize) = decode_from_slice(body, wire_config())?;
    if read != body.len() {
        return Err(TransportError::TrailingBytes(body.len() - read));
    }
    Ok(Message::with_payload(
        MessageKind::from(decoded.kind.as_str()),
        decoded.payload,
    ))
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Length-framed message exchange over a bidirectional byte stream.
///
/// Reads honour whatever timeout the underlying stream carries. There is no
/// resynchronisation: once any error is returned the stream must be discarded.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
    max_message_size: usize,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self::with_max_message_size(stream, DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Caps are clamped to [`MAX_MESSAGE_SIZE_LIMIT`].
    pub fn with_max_message_size(stream: T, max_message_size: usize) -> Self {
        Self {
            stream,
            max_message_size: max_message_size.min(MAX_MESSAGE_SIZE_LIMIT),
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }

    pub fn write_message(&mut self, message: &Message) -> Result<(), TransportError> {
        let frame = encode(message)?;
        let len = frame.len() - LENGTH_PREFIX_SIZE;
        if len > self.max_message_size {
            return Err(TransportError::TooLarge {
                len,
                max: self.max_message_size,
            });
        }
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn read_message(&mut self) -> Result<Received, TransportError> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        let mut filled = 0;

        while filled < LENGTH_PREFIX_SIZE {
            match self.stream.read(&mut prefix[filled..]) {
                Ok(0) if filled == 0 => return Ok(Received::Closed),
                Ok(0) => {
                    return Err(TransportError::Truncated {
                        expected: LENGTH_PREFIX_SIZE,
                        received: filled,
                    });
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) && filled == 0 => return Ok(Received::Idle),
                Err(e) if is_timeout(&e) => {
                    return Err(TransportError::Timeout {
                        expected: LENGTH_PREFIX_SIZE,
                        received: filled,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_message_size {
            return Err(TransportError::TooLarge {
                len,
                max: self.max_message_size,
            });
        }

        let mut body = Vec::with_capacity(len.min(READ_CHUNK_SIZE));
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        while body.len() < len {
            let want = (len - body.len()).min(READ_CHUNK_SIZE);
            match self.stream.read(&mut chunk[..want]) {
                Ok(0) => {
                    return Err(TransportError::Truncated {
                        expected: len,
                        received: body.len(),
                    });
                }
                Ok(n) => body.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => {
                    return Err(TransportError::Timeout {
                        expected: len,
                        received: body.len(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        decode_body(&body).map(Received::Message)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        io::{Cursor, Seek, SeekFrom},
    };

    use super::*;
    use crate::protocol::{Value, message::MAX_NESTING_DEPTH};

    /// Stream that replays scripted read results, then reports EOF.
    struct Scripted {
        steps: VecDeque<io::Result<Vec<u8>>>,
    }

    impl Scripted {
        fn new(steps: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                steps: steps.into(),
            }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.steps.pop_front() {
                None => Ok(0),
                Some(Err(e)) => Err(e),
                Some(Ok(mut bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        self.steps.push_front(Ok(bytes.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn timeout() -> io::Error {
        io::Error::from(ErrorKind::WouldBlock)
    }

    fn sample() -> Message {
        let mut nested = Payload::new();
        nested.insert("x".to_string(), Value::Float(1.5));
        nested.insert("tags".to_string(), Value::List(vec!["a".into(), Value::Null]));

        Message::new(MessageKind::QueryResult)
            .with("status", "OK")
            .with("query_id", 42i64)
            .with("plot", (0..=255u8).collect::<Vec<u8>>())
            .with("data", nested)
    }

    #[test]
    fn read_write_message() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);

        transport.write_message(&sample()).unwrap();
        transport.stream.seek(SeekFrom::Start(0)).unwrap();

        assert_eq!(
            transport.read_message().unwrap(),
            Received::Message(sample())
        );
        assert_eq!(transport.read_message().unwrap(), Received::Closed);
    }

    #[test]
    fn prefix_is_big_endian_body_length() {
        let frame = encode(&sample()).unwrap();
        let declared = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(declared, frame.len() - 4);
    }

    #[test]
    fn unknown_kind_decodes() {
        let msg = Message::new(MessageKind::Other("PING".to_string())).with("n", 1i64);
        let frame = encode(&msg).unwrap();
        assert_eq!(decode_body(&frame[4..]).unwrap(), msg);
    }

    #[test]
    fn oversized_length_rejected_before_body_read() {
        let mut bytes = u32::MAX.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 16]);
        let mut transport = ProtocolTransport::with_max_message_size(Cursor::new(bytes), 1024);

        let err = transport.read_message().unwrap_err();
        assert!(matches!(
            err,
            TransportError::TooLarge {
                len,
                max: 1024
            } if len == u32::MAX as usize
        ));
        assert_eq!(transport.stream.position(), 4);
        assert!(err.is_framing());
    }

    #[test]
    fn oversized_write_rejected() {
        let mut transport = ProtocolTransport::with_max_message_size(Cursor::new(Vec::new()), 8);
        let err = transport.write_message(&sample()).unwrap_err();
        assert!(matches!(err, TransportError::TooLarge { max: 8, .. }));
        assert!(transport.stream.get_ref().is_empty());
    }

    #[test]
    fn empty_stream_is_graceful_close() {
        let mut transport = ProtocolTransport::new(Cursor::new(Vec::new()));
        assert_eq!(transport.read_message().unwrap(), Received::Closed);
    }

    #[test]
    fn close_inside_prefix_is_abrupt() {
        let mut transport = ProtocolTransport::new(Cursor::new(vec![0u8, 0]));
        let err = transport.read_message().unwrap_err();
        assert!(matches!(
            err,
            TransportError::Truncated {
                expected: 4,
                received: 2
            }
        ));
    }

    #[test]
    fn close_inside_body_is_abrupt() {
        let frame = encode(&sample()).unwrap();
        let cut = frame[..frame.len() - 3].to_vec();
        let mut transport = ProtocolTransport::new(Cursor::new(cut));

        let err = transport.read_message().unwrap_err();
        assert!(matches!(err, TransportError::Truncated { .. }));
    }

    #[test]
    fn timeout_before_frame_is_idle() {
        let frame = encode(&sample()).unwrap();
        let mut transport = ProtocolTransport::new(Scripted::new(vec![Err(timeout()), Ok(frame)]));

        assert_eq!(transport.read_message().unwrap(), Received::Idle);
        assert_eq!(
            transport.read_message().unwrap(),
            Received::Message(sample())
        );
    }

    #[test]
    fn timeout_inside_body_is_fatal() {
        let frame = encode(&sample()).unwrap();
        let (head, tail) = frame.split_at(10);
        let mut transport = ProtocolTransport::new(Scripted::new(vec![
            Ok(head.to_vec()),
            Err(timeout()),
            Ok(tail.to_vec()),
        ]));

        let err = transport.read_message().unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_framing());
    }

    #[test]
    fn body_split_across_reads() {
        let frame = encode(&sample()).unwrap();
        let steps = frame.chunks(3).map(|c| Ok(c.to_vec())).collect();
        let mut transport = ProtocolTransport::new(Scripted::new(steps));

        assert_eq!(
            transport.read_message().unwrap(),
            Received::Message(sample())
        );
    }

    #[test]
    fn trailing_bytes_rejected() {
        let frame = encode(&sample()).unwrap();
        let mut body = frame[4..].to_vec();
        body.push(0);

        let err = decode_body(&body).unwrap_err();
        assert!(matches!(err, TransportError::TrailingBytes(1)));
    }

    fn push_text(body: &mut Vec<u8>, text: &str) {
        body.extend_from_slice(&(text.len() as u64).to_be_bytes());
        body.extend_from_slice(text.as_bytes());
    }

    /// A QUERY body whose single `nested` entry wraps `Null` in `depth` one-element lists.
    fn nested_list_body(depth: usize) -> Vec<u8> {
        let mut body = Vec::new();
        push_text(&mut body, "QUERY");
        body.extend_from_slice(&1u64.to_be_bytes());
        push_text(&mut body, "nested");
        for _ in 0..depth {
            body.extend_from_slice(&6u32.to_be_bytes());
            body.extend_from_slice(&1u64.to_be_bytes());
        }
        body.extend_from_slice(&0u32.to_be_bytes());
        body
    }

    #[test]
    fn nesting_up_to_the_limit_decodes() {
        let mut value = Value::Null;
        for _ in 0..MAX_NESTING_DEPTH {
            value = Value::List(vec![value]);
        }
        let msg = Message::new(MessageKind::Query).with("nested", value);

        let frame = encode(&msg).unwrap();
        assert_eq!(frame[4..], nested_list_body(MAX_NESTING_DEPTH)[..]);
        assert_eq!(decode_body(&frame[4..]).unwrap(), msg);
    }

    #[test]
    fn deep_nesting_rejected() {
        let err = decode_body(&nested_list_body(MAX_NESTING_DEPTH + 1)).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Deserialize(DecodeError::Other(_))
        ));

        let err = decode_body(&nested_list_body(200_000)).unwrap_err();
        assert!(err.is_framing());
    }

    #[test]
    fn deep_nesting_over_stream_is_framing_error() {
        let body = nested_list_body(100_000);
        let mut bytes = (body.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(&body);
        let mut transport = ProtocolTransport::new(Cursor::new(bytes));

        assert!(transport.read_message().unwrap_err().is_framing());
    }

    #[test]
    fn short_body_declaring_huge_bytes_rejected() {
        let mut body = Vec::new();
        push_text(&mut body, "QUERY");
        body.extend_from_slice(&1u64.to_be_bytes());
        push_text(&mut body, "raw");
        body.extend_from_slice(&5u32.to_be_bytes());
        body.extend_from_slice(&(250u64 * 1024 * 1024).to_be_bytes());
        body.extend_from_slice(b"tiny");

        let err = decode_body(&body).unwrap_err();
        assert!(matches!(err, TransportError::Deserialize(_)));
    }

    #[test]
    fn declared_length_above_limit_rejected() {
        let mut body = Vec::new();
        body.extend_from_slice(&(DECODE_LIMIT as u64 + 1).to_be_bytes());
        body.extend_from_slice(b"QUERY");

        let err = decode_body(&body).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Deserialize(DecodeError::LimitExceeded)
        ));
    }

    #[test]
    fn cap_clamped_to_limit() {
        let stream = Cursor::new(Vec::<u8>::new());
        let transport = ProtocolTransport::with_max_message_size(stream, usize::MAX);
        assert_eq!(transport.max_message_size, MAX_MESSAGE_SIZE_LIMIT);
    }

    #[test]
    fn garbage_body_is_framing_error() {
        let mut bytes = 3u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0xff, 0xff, 0xff]);
        let mut transport = ProtocolTransport::new(Cursor::new(bytes));

        let err = transport.read_message().unwrap_err();
        assert!(err.is_framing());
    }
}
