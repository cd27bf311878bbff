//! The wire protocol: frame types and the codec that (de)serialises them.

mod codec;
mod frame;

pub use codec::{framed, FrameCodec, FrameError};
pub use frame::{tag, EnvVar, Frame, Listing, WireRusage};
