//! Byte transport abstraction
//!
//! The driver never opens serial ports itself. Anything that can move bytes
//! both ways over a full-duplex link (an 8N1 serial adapter, a USB CDC
//! endpoint, a test double) implements [`Transport`]. The trait is object
//! safe so a connection can hold `Box<dyn Transport>` when generics are
//! inconvenient.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying adapter failure
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// No byte arrived within the deadline
    #[error("read timed out")]
    Timeout,
    /// The link is gone; no further reads or writes will succeed
    #[error("transport closed")]
    Closed,
}

/// Full-duplex byte link to the controller.
pub trait Transport {
    /// Write the whole buffer or fail.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Block until `buf` is filled.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    /// Returns `Ok(0)` when nothing arrived in time.
    fn read_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;
}

/// Typed read helpers layered on any [`Transport`].
///
/// All scalars are little-endian, matching the wire codec.
pub trait TransportExt: Transport {
    fn read_u8(&mut self) -> Result<u8, TransportError> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&mut self) -> Result<u16, TransportError> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&mut self) -> Result<u32, TransportError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_vec(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; n];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// One byte within a deadline; [`TransportError::Timeout`] if none arrives.
    fn read_u8_within(&mut self, timeout: Duration) -> Result<u8, TransportError> {
        let mut buf = [0u8; 1];
        match self.read_with_timeout(&mut buf, timeout)? {
            0 => Err(TransportError::Timeout),
            _ => Ok(buf[0]),
        }
    }

    /// Discard whatever is sitting in the receive buffer.
    ///
    /// Reads until the link stays quiet for `idle`, returning the number of
    /// bytes thrown away.
    fn drain(&mut self, idle: Duration) -> Result<usize, TransportError> {
        let mut discarded = 0;
        let mut buf = [0u8; 64];
        loop {
            let n = self.read_with_timeout(&mut buf, idle)?;
            if n == 0 {
                return Ok(discarded);
            }
            discarded += n;
        }
    }
}

impl<T: Transport + ?Sized> TransportExt for T {}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write_all(bytes)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        (**self).read_exact(buf)
    }

    fn read_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        (**self).read_with_timeout(buf, timeout)
    }
}
