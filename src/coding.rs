//! Wire codec seam shared by headers, frames, and transport parameters.
//!
//! Wraps raw `Buf`/`BufMut` calls into a small fallible contract: truncated or malformed input
//! is reported through [`UnexpectedEnd`], not a panic.

use std::fmt;

use bytes::{Buf, BufMut};

use crate::varint::VarInt;

/// A value decodable from a QUIC wire buffer
pub trait Codec: Sized {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd>;
    fn encode<B: BufMut>(&self, buf: &mut B);
}

impl Codec for u8 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        if !buf.has_remaining() {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u8())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self);
    }
}

impl Codec for u16 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        if buf.remaining() < 2 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u16())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(*self);
    }
}

impl Codec for u32 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        if buf.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u32())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(*self);
    }
}

impl Codec for u64 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        if buf.remaining() < 8 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u64())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(*self);
    }
}

impl Codec for VarInt {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        VarInt::decode(buf)
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        VarInt::encode(*self, buf)
    }
}

/// Ran out of bytes while decoding
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UnexpectedEnd;

impl fmt::Display for UnexpectedEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unexpected end of buffer")
    }
}

impl std::error::Error for UnexpectedEnd {}

/// `bytes::Buf` extensions for QUIC wire parsing
pub trait BufExt {
    fn get<T: Codec>(&mut self) -> Result<T, UnexpectedEnd>;
    fn get_var(&mut self) -> Result<u64, UnexpectedEnd>;
}

impl<T: Buf> BufExt for T {
    fn get<U: Codec>(&mut self) -> Result<U, UnexpectedEnd> {
        U::decode(self)
    }

    fn get_var(&mut self) -> Result<u64, UnexpectedEnd> {
        Ok(VarInt::decode(self)?.into_inner())
    }
}

/// `bytes::BufMut` extensions for QUIC wire encoding
pub trait BufMutExt {
    fn write<T: Codec>(&mut self, x: T);
    fn write_var(&mut self, x: u64);
}

impl<T: BufMut> BufMutExt for T {
    fn write<U: Codec>(&mut self, x: U) {
        x.encode(self);
    }

    fn write_var(&mut self, x: u64) {
        VarInt::from_u64(x)
            .expect("value out of varint range")
            .encode(self);
    }
}
