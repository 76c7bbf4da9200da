//! Server greeting and challenge-response authentication.
//!
//! The first 128 bytes on a fresh connection are the greeting: a version
//! string in bytes 0..64 and a base64 salt in bytes 64..108. When
//! credentials are configured the client answers with a chap-sha1
//! scramble proving password knowledge without transmitting the password.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::{BufferPool, Request, Response};

/// Greeting size in bytes (fixed, exactly 128).
pub const GREETING_SIZE: usize = 128;

/// Scramble length; one SHA-1 digest.
const SCRAMBLE_SIZE: usize = 20;

/// Parsed server greeting.
#[derive(Debug, Clone)]
pub struct Greeting {
    /// Server version line, e.g. `Tarantool 2.10.0`.
    pub version: String,
    pub(crate) salt: String,
}

/// Read and parse the greeting from a fresh socket.
pub(crate) async fn read_greeting<R>(r: &mut R) -> Result<Greeting>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; GREETING_SIZE];
    r.read_exact(&mut raw).await?;

    let version = String::from_utf8_lossy(&raw[..64])
        .trim_end_matches(['\0', '\n', ' '])
        .to_string();
    let salt = String::from_utf8_lossy(&raw[64..108]).trim_end().to_string();

    Ok(Greeting { version, salt })
}

/// Derive the chap-sha1 scramble from the greeting salt and a password.
///
/// `step1 = SHA1(password)`, `step2 = SHA1(step1)`,
/// `step3 = SHA1(decoded_salt[..20] || step2)`, result `step1 XOR step3`.
pub(crate) fn scramble(encoded_salt: &str, password: &str) -> Result<[u8; SCRAMBLE_SIZE]> {
    let salt = BASE64
        .decode(encoded_salt)
        .map_err(|e| Error::Protocol(format!("auth: bad salt: {e}")))?;
    if salt.len() < SCRAMBLE_SIZE {
        return Err(Error::Protocol("auth: salt too short".into()));
    }

    let step1 = Sha1::digest(password.as_bytes());
    let step2 = Sha1::digest(step1);
    let step3 = Sha1::new()
        .chain_update(&salt[..SCRAMBLE_SIZE])
        .chain_update(step2)
        .finalize();

    let mut out = [0u8; SCRAMBLE_SIZE];
    for (o, (a, b)) in out.iter_mut().zip(step1.iter().zip(step3.iter())) {
        *o = a ^ b;
    }

    Ok(out)
}

/// Perform the one-shot authentication exchange on a fresh socket.
///
/// Sent before the reader/writer tasks exist, with sync 0; exactly one
/// response frame is expected. A non-empty error field is an
/// authentication failure and surfaces as [`Error::Server`].
pub(crate) async fn authenticate<S>(
    sock: &mut S,
    user: &str,
    password: &str,
    greeting: &Greeting,
    pool: &BufferPool,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let scramble = scramble(&greeting.salt, password)?;
    let frame = Request::Auth {
        user: user.to_string(),
        scramble: scramble.to_vec(),
    }
    .encode_frame(0)?;

    sock.write_all(&frame).await?;
    sock.flush().await?;

    let body = crate::protocol::read_frame(sock, pool).await?;
    Response::decode(body)?.into_result()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference vector: salt = base64(0x00..0x1f), password "secret".
    const SALT: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=";

    #[test]
    fn test_scramble_reference_vector() {
        let expected: [u8; 20] = [
            0x21, 0xb3, 0xff, 0x40, 0x5f, 0x32, 0xcb, 0xe4, 0xaa, 0xff, 0xf2, 0x91, 0x39, 0x60,
            0x46, 0xea, 0x29, 0xfa, 0x3a, 0x4d,
        ];
        assert_eq!(scramble(SALT, "secret").unwrap(), expected);
    }

    #[test]
    fn test_scramble_empty_password() {
        let expected: [u8; 20] = [
            0x76, 0x7b, 0xe9, 0x3e, 0xd1, 0x97, 0x08, 0x38, 0x18, 0xf1, 0x5d, 0xb9, 0x1f, 0xd7,
            0xd5, 0x24, 0x07, 0xad, 0x35, 0x3e,
        ];
        assert_eq!(scramble(SALT, "").unwrap(), expected);
    }

    #[test]
    fn test_scramble_rejects_garbage_salt() {
        assert!(scramble("not base64!!", "secret").is_err());
        // Valid base64 but too short once decoded.
        assert!(scramble("AAAA", "secret").is_err());
    }

    #[tokio::test]
    async fn test_read_greeting() {
        let mut raw = Vec::new();
        raw.extend_from_slice(format!("{:<63}\n", "Tarantool 2.10.0 (Binary)").as_bytes());
        raw.extend_from_slice(format!("{:<63}\n", SALT).as_bytes());
        assert_eq!(raw.len(), GREETING_SIZE);

        let mut r = &raw[..];
        let greeting = read_greeting(&mut r).await.unwrap();
        assert_eq!(greeting.version, "Tarantool 2.10.0 (Binary)");
        assert_eq!(greeting.salt, SALT);
    }
}
