//! Transport framing
//!
//! Every TCP stream in the system (client connections and inter-process RPC)
//! carries frames prefixed with a u32 little-endian length. This module builds
//! the codec for that framing so both sides agree on it.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::net::buffer::MAX_PACKET_SIZE;

/// Length prefix size in bytes
pub const LENGTH_PREFIX: usize = 4;

/// A stream split into length-delimited frames
pub type FramedStream<S> = Framed<S, LengthDelimitedCodec>;

/// Codec for u32 LE length-prefixed frames. Frames longer than
/// `max_frame_length` fail the stream with `InvalidData`.
pub fn frame_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .little_endian()
        .length_field_length(LENGTH_PREFIX)
        .max_frame_length(max_frame_length)
        .new_codec()
}

/// Wrap a stream with the frame codec
pub fn framed<S>(stream: S, max_frame_length: usize) -> FramedStream<S>
where
    S: AsyncRead + AsyncWrite,
{
    Framed::new(stream, frame_codec(max_frame_length))
}

/// Wrap a client stream using the default packet limit
pub fn framed_client<S>(stream: S) -> FramedStream<S>
where
    S: AsyncRead + AsyncWrite,
{
    framed(stream, MAX_PACKET_SIZE)
}

/// Encode one frame by hand (length prefix + payload)
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}
