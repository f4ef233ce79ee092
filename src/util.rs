// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::error::{TpmErrorKindExt, TpmRcBase};
use std::num::ParseIntError;
use tpm2_protocol::{
    build_tpm2b,
    constant::TPM_MAX_COMMAND_SIZE,
    data::{TpmaNv, TpmaSession},
    parse_tpm2b, TpmBuild, TpmParse, TpmWriter,
};

/// Parses a hex string (with or without a "0x" prefix) into a u32.
///
/// # Errors
///
/// Returns a `ParseIntError` if the string is not a valid hex integer.
pub fn parse_hex_u32(s: &str) -> Result<u32, ParseIntError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u32::from_str_radix(s, 16)
}

/// Set operations on `TPMA_*` attribute words.
pub trait AttributeSet: Copy {
    /// Returns `true` when any bit of `other` is set.
    fn intersects(self, other: Self) -> bool;

    /// Clears every bit of `other`.
    fn remove(&mut self, other: Self);
}

macro_rules! attribute_set {
    ($($ty:ty),*) => {
        $(
            impl AttributeSet for $ty {
                fn intersects(self, other: Self) -> bool {
                    self.bits() & other.bits() != 0
                }

                fn remove(&mut self, other: Self) {
                    *self = Self::from_bits_truncate(self.bits() & !other.bits());
                }
            }
        )*
    };
}

attribute_set!(TpmaNv, TpmaSession);

/// A helper to build a `TpmBuild` type into a `Vec<u8>`.
///
/// # Errors
///
/// Returns a `TpmRcBase` if the object cannot be serialized.
pub fn build_to_vec<T: TpmBuild>(obj: &T) -> Result<Vec<u8>, TpmRcBase> {
    let mut buf = [0u8; TPM_MAX_COMMAND_SIZE];
    let len = {
        let mut writer = TpmWriter::new(&mut buf);
        obj.build(&mut writer).map_err(TpmErrorKindExt::to_tpm_rc)?;
        writer.len()
    };
    Ok(buf[..len].to_vec())
}

/// Growable big-endian encoder for command and response areas.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(value);
        self
    }

    /// Appends a marshaled protocol structure.
    ///
    /// # Errors
    ///
    /// Returns the response code of the build failure.
    pub fn put<T: TpmBuild>(&mut self, value: &T) -> Result<&mut Self, TpmRcBase> {
        let mut raw = vec![0u8; value.len()];
        let mut writer = TpmWriter::new(&mut raw);
        value.build(&mut writer).map_err(TpmErrorKindExt::to_tpm_rc)?;
        let len = writer.len();
        self.buf.extend_from_slice(&raw[..len]);
        Ok(self)
    }

    /// Writes a `TPM2B` buffer: a 16-bit size followed by the bytes.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Size` when the buffer does not fit the size field.
    pub fn tpm2b(&mut self, value: &[u8]) -> Result<&mut Self, TpmRcBase> {
        let mut raw = vec![0u8; value.len() + 2];
        let mut writer = TpmWriter::new(&mut raw);
        build_tpm2b(&mut writer, value).map_err(TpmErrorKindExt::to_tpm_rc)?;
        self.buf.extend_from_slice(&raw);
        Ok(self)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

/// Cursor over a byte slice parsing protocol types. Short input is
/// `TpmRcBase::Size`.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn advance(&mut self, rest: &'a [u8]) {
        self.pos = self.buf.len() - rest.len();
    }

    /// Parses the next protocol structure.
    ///
    /// # Errors
    ///
    /// Returns the response code of the parse failure.
    pub fn get<T: TpmParse>(&mut self) -> Result<T, TpmRcBase> {
        let (value, rest) = T::parse(self.rest()).map_err(TpmErrorKindExt::to_tpm_rc)?;
        self.advance(rest);
        Ok(value)
    }

    /// # Errors
    ///
    /// Returns `TpmRcBase::Size` when fewer than `n` bytes remain.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], TpmRcBase> {
        let end = self.pos.checked_add(n).ok_or(TpmRcBase::Size)?;
        let slice = self.buf.get(self.pos..end).ok_or(TpmRcBase::Size)?;
        self.pos = end;
        Ok(slice)
    }

    /// # Errors
    ///
    /// Returns `TpmRcBase::Size` on short input.
    pub fn u8(&mut self) -> Result<u8, TpmRcBase> {
        self.get()
    }

    /// # Errors
    ///
    /// Returns `TpmRcBase::Size` on short input.
    pub fn u16(&mut self) -> Result<u16, TpmRcBase> {
        self.get()
    }

    /// # Errors
    ///
    /// Returns `TpmRcBase::Size` on short input.
    pub fn u32(&mut self) -> Result<u32, TpmRcBase> {
        self.get()
    }

    /// # Errors
    ///
    /// Returns `TpmRcBase::Size` on short input.
    pub fn u64(&mut self) -> Result<u64, TpmRcBase> {
        self.get()
    }

    /// Reads a `TPM2B` buffer.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Size` on short input.
    pub fn tpm2b(&mut self) -> Result<&'a [u8], TpmRcBase> {
        let (data, rest) = parse_tpm2b(self.rest()).map_err(TpmErrorKindExt::to_tpm_rc)?;
        self.advance(rest);
        Ok(data)
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// # Errors
    ///
    /// Returns `TpmRcBase::Size` if unread bytes remain.
    pub fn finish(&self) -> Result<(), TpmRcBase> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(TpmRcBase::Size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm2_protocol::data::TpmaSession;

    #[test]
    fn test_reader_short_input() {
        let mut r = Reader::new(&[0x00, 0x05, 0xAA]);
        assert_eq!(r.tpm2b(), Err(TpmRcBase::Size));
    }

    #[test]
    fn test_writer_reader() {
        let mut w = Writer::new();
        w.u32(0x0100_0001).tpm2b(b"abc").unwrap().u8(7);
        w.put(&TpmaSession::CONTINUE_SESSION).unwrap();
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.u32(), Ok(0x0100_0001));
        assert_eq!(r.tpm2b(), Ok(&b"abc"[..]));
        assert_eq!(r.u8(), Ok(7));
        assert_eq!(r.get::<TpmaSession>(), Ok(TpmaSession::CONTINUE_SESSION));
        assert!(r.finish().is_ok());
    }

    #[test]
    fn test_tpm2b_too_large() {
        let mut w = Writer::new();
        assert_eq!(
            w.tpm2b(&vec![0; usize::from(u16::MAX) + 1]).err(),
            Some(TpmRcBase::Size)
        );
        assert!(w.is_empty());
    }
}
