//! # Buffer Handles
//!
//! Opaque 32-bit handles naming one table slot.
//!
//! ```text
//!  31                16 15 14             0
//! ┌────────────────────┬──┬────────────────┐
//! │     slot index     │S │     token      │
//! └────────────────────┴──┴────────────────┘
//! ```
//!
//! The token is the slot's generation at the time the handle was minted, so
//! a handle kept past its slot's reuse no longer matches. `S` marks buffers
//! holding protected content; it is advisory and not part of the index.

use core::fmt;

use static_assertions::const_assert_eq;

use crate::error::{Error, Result};

/// Bits reserved for the identity token
pub const TOKEN_BITS: u32 = 15;
/// Position of the secure marker
pub const SECURE_BIT: u32 = 15;
/// First bit of the slot index
pub const INDEX_SHIFT: u32 = 16;
/// Bits reserved for the slot index
pub const INDEX_BITS: u32 = 16;

/// Mask for the token field
pub const TOKEN_MASK: u32 = (1 << TOKEN_BITS) - 1;
/// Largest slot index a handle can carry
pub const MAX_INDEX: usize = (1 << INDEX_BITS) - 1;

const_assert_eq!(TOKEN_BITS + 1 + INDEX_BITS, u32::BITS);
const_assert_eq!(SECURE_BIT, TOKEN_BITS);
const_assert_eq!(INDEX_SHIFT, SECURE_BIT + 1);

/// Public handle to a buffer slot
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct BufferHandle(u32);

impl BufferHandle {
    /// Pack a slot index and identity token
    ///
    /// Only the low `TOKEN_BITS` of `token` are kept.
    #[inline]
    pub const fn encode(index: usize, token: u32) -> Self {
        Self(((index as u32) << INDEX_SHIFT) | (token & TOKEN_MASK))
    }

    /// Rebuild a handle from its raw value
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Slot index carried by the handle
    #[inline]
    pub const fn index(self) -> usize {
        (self.0 >> INDEX_SHIFT) as usize
    }

    /// Identity token carried by the handle
    #[inline]
    pub const fn token(self) -> u32 {
        self.0 & TOKEN_MASK
    }

    /// Does the handle carry the secure marker?
    #[inline]
    pub const fn is_secure(self) -> bool {
        self.0 & (1 << SECURE_BIT) != 0
    }

    /// Same handle with the secure marker set or cleared
    #[inline]
    pub const fn with_secure(self, secure: bool) -> Self {
        if secure {
            Self(self.0 | (1 << SECURE_BIT))
        } else {
            Self(self.0 & !(1 << SECURE_BIT))
        }
    }

    /// Extract the slot index, rejecting the reserved slot and anything
    /// outside a table of `capacity` slots
    #[inline]
    pub fn decode(self, capacity: usize) -> Result<usize> {
        let index = self.index();
        if index == 0 || index >= capacity {
            return Err(Error::InvalidHandle);
        }
        Ok(index)
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BufferHandle(0x{:08x} idx={} tok={}{})",
            self.0,
            self.index(),
            self.token(),
            if self.is_secure() { " secure" } else { "" }
        )
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        for &(index, token) in &[(1usize, 0u32), (7, 0x1234), (1023, TOKEN_MASK), (MAX_INDEX, 5)] {
            let handle = BufferHandle::encode(index, token);
            assert_eq!(handle.decode(MAX_INDEX + 1), Ok(index));
            assert_eq!(handle.token(), token & TOKEN_MASK);
            assert!(!handle.is_secure());
        }
    }

    #[test]
    fn test_token_truncated() {
        let handle = BufferHandle::encode(3, 0xFFFF_FFFF);
        assert_eq!(handle.index(), 3);
        assert_eq!(handle.token(), TOKEN_MASK);
        assert!(!handle.is_secure());
    }

    #[test]
    fn test_secure_bit_is_not_index() {
        let handle = BufferHandle::encode(42, 9).with_secure(true);
        assert!(handle.is_secure());
        assert_eq!(handle.index(), 42);
        assert_eq!(handle.token(), 9);
        assert_eq!(handle.with_secure(false), BufferHandle::encode(42, 9));
    }

    #[test]
    fn test_decode_rejects_out_of_range() {
        assert_eq!(BufferHandle::encode(0, 1).decode(16), Err(Error::InvalidHandle));
        assert_eq!(BufferHandle::encode(16, 1).decode(16), Err(Error::InvalidHandle));
        assert_eq!(BufferHandle::from_raw(0).decode(16), Err(Error::InvalidHandle));
        assert_eq!(BufferHandle::encode(15, 1).decode(16), Ok(15));
    }
}
