//! Guarded storage for private key bytes.
//!
//! A [`SecureBuffer`] is the only place long-lived secret bytes are kept. It
//! has a fixed length chosen at allocation, rejects reads and writes of any
//! other length, and wipes its contents when disposed or dropped. Copies handed
//! out by [`SecureBuffer::read_bytes`] and [`SecureBuffer::read_array`] are
//! wrapped in [`Zeroizing`] so they are wiped when the caller lets go of them.

use crate::Error;
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

/// Upper bound on a single guarded allocation.
pub const MAX_SECURE_BUFFER_LEN: usize = 64 * 1024;

/// A fixed-length, explicitly wiped buffer of secret bytes.
pub struct SecureBuffer {
    bytes: Box<[u8]>,
    len: usize,
    disposed: bool,
}

impl SecureBuffer {
    /// Allocates a zero-filled buffer of exactly `len` bytes.
    pub fn allocate(len: usize) -> Result<Self, Error> {
        if len == 0 {
            return Err(Error::Allocation("zero-length buffer".to_string()));
        }
        if len > MAX_SECURE_BUFFER_LEN {
            return Err(Error::Allocation(format!(
                "requested {len} bytes, limit is {MAX_SECURE_BUFFER_LEN}"
            )));
        }

        Ok(Self {
            bytes: vec![0u8; len].into_boxed_slice(),
            len,
            disposed: false,
        })
    }

    /// Allocates a buffer sized to `data` and copies it in.
    ///
    /// The caller remains responsible for wiping `data`.
    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        let mut buffer = Self::allocate(data.len())?;
        buffer.write(data)?;
        Ok(buffer)
    }

    /// Allocated length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; zero-length buffers cannot be allocated.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether [`dispose`](Self::dispose) has run.
    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn ensure_live(&self) -> Result<(), Error> {
        if self.disposed {
            return Err(Error::ObjectDisposed("SecureBuffer"));
        }
        Ok(())
    }

    fn ensure_len(&self, len: usize) -> Result<(), Error> {
        if len != self.len {
            return Err(Error::InvalidInput(format!(
                "expected {} bytes, got {len}",
                self.len
            )));
        }
        Ok(())
    }

    /// Overwrites the whole buffer with `data`.
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.ensure_live()?;
        self.ensure_len(data.len())?;
        self.bytes.copy_from_slice(data);
        Ok(())
    }

    /// Copies the whole buffer into `out`.
    pub fn read(&self, out: &mut [u8]) -> Result<(), Error> {
        self.ensure_live()?;
        self.ensure_len(out.len())?;
        out.copy_from_slice(&self.bytes);
        Ok(())
    }

    /// Returns an owned copy that is wiped when dropped.
    pub fn read_bytes(&self, len: usize) -> Result<Zeroizing<Vec<u8>>, Error> {
        self.ensure_live()?;
        self.ensure_len(len)?;
        Ok(Zeroizing::new(self.bytes.to_vec()))
    }

    /// Returns a fixed-size copy that is wiped when dropped.
    pub fn read_array<const N: usize>(&self) -> Result<Zeroizing<[u8; N]>, Error> {
        let mut out = Zeroizing::new([0u8; N]);
        self.read(out.as_mut_slice())?;
        Ok(out)
    }

    /// Runs `f` over the contents without copying them out.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, Error> {
        self.ensure_live()?;
        Ok(f(&self.bytes))
    }

    /// Allocates an independent buffer holding the same bytes.
    pub fn try_clone(&self) -> Result<Self, Error> {
        self.ensure_live()?;
        Self::from_slice(&self.bytes)
    }

    /// Constant-time equality of contents.
    pub fn ct_eq(&self, other: &Self) -> Result<bool, Error> {
        self.ensure_live()?;
        other.ensure_live()?;
        if self.len != other.len {
            return Ok(false);
        }
        Ok(self.bytes[..].ct_eq(&other.bytes[..]).into())
    }

    /// Wipes the contents and invalidates the handle.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.bytes.zeroize();
        self.disposed = true;
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureBuffer")
            .field("len", &self.len)
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}
