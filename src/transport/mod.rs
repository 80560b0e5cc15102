//! Encrypted stream transport.
//!
//! Two layers sit on top of the raw connection:
//!
//! 1. **Frame codec** ([`DarkStarCipher`]): seals plaintext chunks into
//!    length-prefixed AEAD frames and opens them again
//!
//! 2. **Stream session** ([`ShadowStream`]): presents an ordered byte stream
//!    (`read`, `read_up_to`, `write`, `close`) and hides frame boundaries
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                 Application                     │
//! ├────────────────────────────────────────────────┤
//! │  Stream Session (reassembly, chunking, redial) │
//! ├────────────────────────────────────────────────┤
//! │  Frame Codec (AES-256-GCM, counter nonces)     │
//! ├────────────────────────────────────────────────┤
//! │  Raw connection (TCP or any AsyncRead+Write)   │
//! └────────────────────────────────────────────────┘
//! ```

mod frame;
mod session;

pub use frame::{frame_len, CipherPair, DarkStarCipher};
pub use session::{Dialed, Endpoint, RedialFuture, Redialer, ShadowStream};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::crypto::TAG_SIZE;

/// Largest plaintext chunk a session puts in one frame.
///
/// Keeps the sealed payload at 16417 bytes.
pub const MAX_PAYLOAD_SIZE: usize = 16401;

/// Largest plaintext the codec accepts (signed 16-bit bound).
pub const MAX_PACK_SIZE: usize = i16::MAX as usize;

/// Size of the plaintext length prefix.
pub const LENGTH_SIZE: usize = 2;

/// Size of the sealed length prefix.
pub const ENCRYPTED_LENGTH_SIZE: usize = LENGTH_SIZE + TAG_SIZE;

/// Fill `buf` from `reader`, stopping early only at end of stream.
///
/// Returns the number of bytes read; less than `buf.len()` means the peer
/// closed the connection.
pub(crate) async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_frame_constants() {
        assert_eq!(ENCRYPTED_LENGTH_SIZE, 18);
        assert_eq!(MAX_PACK_SIZE, 32767);
        assert_eq!(MAX_PAYLOAD_SIZE + TAG_SIZE, 16417);
    }

    #[tokio::test]
    async fn test_read_full_short_on_eof() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);

        let mut buf = [0u8; 8];
        let n = read_full(&mut b, &mut buf).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }
}
