//! `canterio`: the framed transport the game client speaks.
//!
//! Every frame on the wire is a 4-byte little-endian header followed by the
//! payload. The header folds the command id and the frame length together
//! under a non-linear mixing (see [`magic`]); the payload is scrambled with a
//! per-client 4-byte XOR key (see [`scramble`]). [`frame`] provides async
//! reader/writer halves over any `AsyncRead`/`AsyncWrite`.

pub mod frame;
pub mod magic;
pub mod scramble;

pub use frame::{FrameReader, FrameWriter};
pub use magic::{decode_header, encode_header, RECV_BUFFER_SIZE};
pub use scramble::ScrambleKey;
