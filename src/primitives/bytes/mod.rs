#![forbid(unsafe_code)]
//! Key encoders and bounded byte readers shared across storage layers.

pub mod ord {
    //! Order-preserving encoders for multi-part keys.
    //!
    //! A multi-part key is a big-endian id followed by an opaque discriminator,
    //! so bytewise comparison groups every key of one id together and orders the
    //! discriminators inside the group.

    use core::convert::TryInto;

    /// Appends a big-endian u32.
    pub fn put_u32(dst: &mut Vec<u8>, v: u32) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a big-endian u64.
    pub fn put_u64(dst: &mut Vec<u8>, v: u64) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Builds `id ++ discriminator`.
    pub fn compound_u32(id: u32, discriminator: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(4 + discriminator.len());
        put_u32(&mut key, id);
        key.extend_from_slice(discriminator);
        key
    }

    /// Builds `id ++ be(sub)`.
    pub fn compound_u32_u64(id: u32, sub: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(12);
        put_u32(&mut key, id);
        put_u64(&mut key, sub);
        key
    }

    /// Splits a compound key into its id and discriminator.
    pub fn split_u32(key: &[u8]) -> Option<(u32, &[u8])> {
        if key.len() < 4 {
            return None;
        }
        let id = u32::from_be_bytes(key[..4].try_into().ok()?);
        Some((id, &key[4..]))
    }

    /// Decodes the trailing big-endian u64 of a `u32 ++ u64` key.
    pub fn split_u32_u64(key: &[u8]) -> Option<(u32, u64)> {
        if key.len() != 12 {
            return None;
        }
        let id = u32::from_be_bytes(key[..4].try_into().ok()?);
        let sub = u64::from_be_bytes(key[4..].try_into().ok()?);
        Some((id, sub))
    }

    /// Smallest key strictly greater than every key starting with `prefix`,
    /// or `None` when the prefix is all `0xFF`.
    pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
        let mut out = prefix.to_vec();
        while let Some(last) = out.pop() {
            if last != 0xFF {
                out.push(last + 1);
                return Some(out);
            }
        }
        None
    }
}

pub mod buf {
    //! Bounds-checked cursor over a byte slice.

    use core::convert::TryInto;

    use crate::types::{ArbolError, Result};

    /// Reads big-endian fields, reporting truncation as corruption.
    pub struct Reader<'a> {
        buf: &'a [u8],
        pos: usize,
        what: &'static str,
    }

    impl<'a> Reader<'a> {
        /// Starts reading `buf`; `what` names the structure in errors.
        pub fn new(buf: &'a [u8], what: &'static str) -> Self {
            Self { buf, pos: 0, what }
        }

        /// Takes the next `n` bytes.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .pos
                .checked_add(n)
                .filter(|&end| end <= self.buf.len())
                .ok_or(ArbolError::Corruption(self.what))?;
            let out = &self.buf[self.pos..end];
            self.pos = end;
            Ok(out)
        }

        /// Reads one byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads a big-endian u16.
        pub fn u16(&mut self) -> Result<u16> {
            Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
        }

        /// Reads a big-endian u32.
        pub fn u32(&mut self) -> Result<u32> {
            Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
        }

        /// Reads a big-endian u64.
        pub fn u64(&mut self) -> Result<u64> {
            Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
        }

        /// Reads a u32 length followed by that many bytes.
        pub fn bytes32(&mut self) -> Result<&'a [u8]> {
            let len = self.u32()? as usize;
            self.take(len)
        }

        /// Reads a u16 length followed by that many bytes.
        pub fn bytes16(&mut self) -> Result<&'a [u8]> {
            let len = self.u16()? as usize;
            self.take(len)
        }

        /// Bytes left.
        pub fn remaining(&self) -> usize {
            self.buf.len() - self.pos
        }

        /// Current offset.
        pub fn position(&self) -> usize {
            self.pos
        }
    }

    /// Appends a u32 length and the bytes.
    pub fn put_bytes32(dst: &mut Vec<u8>, src: &[u8]) {
        dst.extend_from_slice(&(src.len() as u32).to_be_bytes());
        dst.extend_from_slice(src);
    }

    /// Appends a u16 length and the bytes. Callers bound the length.
    pub fn put_bytes16(dst: &mut Vec<u8>, src: &[u8]) {
        debug_assert!(src.len() <= u16::MAX as usize);
        dst.extend_from_slice(&(src.len() as u16).to_be_bytes());
        dst.extend_from_slice(src);
    }

    /// Reads a big-endian u16 at a fixed offset.
    pub fn get_u16(src: &[u8], off: usize) -> u16 {
        u16::from_be_bytes(src[off..off + 2].try_into().unwrap())
    }

    /// Reads a big-endian u32 at a fixed offset.
    pub fn get_u32(src: &[u8], off: usize) -> u32 {
        u32::from_be_bytes(src[off..off + 4].try_into().unwrap())
    }

    /// Reads a big-endian u64 at a fixed offset.
    pub fn get_u64(src: &[u8], off: usize) -> u64 {
        u64::from_be_bytes(src[off..off + 8].try_into().unwrap())
    }

    /// Writes a big-endian u16 at a fixed offset.
    pub fn set_u16(dst: &mut [u8], off: usize, v: u16) {
        dst[off..off + 2].copy_from_slice(&v.to_be_bytes());
    }

    /// Writes a big-endian u32 at a fixed offset.
    pub fn set_u32(dst: &mut [u8], off: usize, v: u32) {
        dst[off..off + 4].copy_from_slice(&v.to_be_bytes());
    }

    /// Writes a big-endian u64 at a fixed offset.
    pub fn set_u64(dst: &mut [u8], off: usize, v: u64) {
        dst[off..off + 8].copy_from_slice(&v.to_be_bytes());
    }
}
