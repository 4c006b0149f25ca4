#![no_std]

//! Canonical CBOR (RFC 8949) encoding into caller-supplied fixed buffers.
//!
//! Everything is written in place: no allocator, no growth, no copies of
//! the output. Container headers are back-filled when the container closes,
//! and errors are held until [`encode::Encoder::finish`] so a caller can
//! encode a whole structure without checking every call.

#[cfg(test)]
extern crate std;

pub mod encode;

mod ieee754;
