// src/crypto/container.rs
//! Encrypted file container
//!
//! ```text
//! [u32 BE wrapped_len][wrapped key: sealed box of the 32-byte file key]
//! [12-byte base nonce]
//! records: [u32 BE record_len][AES-256-GCM ciphertext || tag]
//! ```
//!
//! Record `i` is encrypted with `counter_nonce(base, i)` and associated data
//! `i (u64 BE) || final (u8)`. The last record carries final = 1, so a
//! truncated container fails to decrypt instead of yielding a short file.

use std::io::{Read, Write};

use log::{debug, error};
use x25519_dalek::StaticSecret;
use zeroize::Zeroizing;

use super::primitives::{
    self, counter_nonce, CryptoError, AES_IV_SIZE, AES_KEY_SIZE, AES_TAG_SIZE,
};

/// Plaintext bytes per record
pub const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on the wrapped key section
const MAX_WRAPPED_KEY_LEN: u32 = 4096;

fn record_aad(index: u64, last: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = last as u8;
    aad
}

/// Read until `buf` is full or EOF; returns the number of bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn io_err(e: std::io::Error) -> CryptoError {
    CryptoError::InvalidInputError(format!("I/O error: {}", e))
}

/// Encrypt everything from `input` into `output` for the X25519 `recipient` key.
///
/// Returns the number of plaintext bytes processed.
pub fn encrypt_stream<R: Read, W: Write>(
    input: &mut R,
    output: &mut W,
    recipient: &[u8],
) -> Result<u64, CryptoError> {
    let file_key = primitives::generate_symmetric_key();
    let wrapped = primitives::seal(recipient, &file_key[..])?;
    let base_nonce = primitives::generate_iv();

    output.write_all(&(wrapped.len() as u32).to_be_bytes()).map_err(io_err)?;
    output.write_all(&wrapped).map_err(io_err)?;
    output.write_all(&base_nonce).map_err(io_err)?;

    let mut current = vec![0u8; FILE_CHUNK_SIZE];
    let mut next = vec![0u8; FILE_CHUNK_SIZE];
    let mut current_len = read_full(input, &mut current).map_err(io_err)?;
    let mut index: u64 = 0;
    let mut total: u64 = 0;

    loop {
        // Read ahead so we know whether this record is the last one
        let next_len = if current_len == FILE_CHUNK_SIZE {
            read_full(input, &mut next).map_err(io_err)?
        } else {
            0
        };
        let last = next_len == 0;

        let nonce = counter_nonce(&base_nonce, index);
        let record = primitives::encrypt(
            &current[..current_len],
            &file_key[..],
            &nonce,
            &record_aad(index, last),
        )?;
        output.write_all(&(record.len() as u32).to_be_bytes()).map_err(io_err)?;
        output.write_all(&record).map_err(io_err)?;
        total += current_len as u64;

        if last {
            break;
        }
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
        index += 1;
    }

    output.flush().map_err(io_err)?;
    debug!("Encrypted {} bytes into {} records", total, index + 1);
    Ok(total)
}

fn read_u32<R: Read>(input: &mut R) -> Result<Option<u32>, CryptoError> {
    let mut len = [0u8; 4];
    match read_full(input, &mut len).map_err(io_err)? {
        0 => Ok(None),
        4 => Ok(Some(u32::from_be_bytes(len))),
        n => Err(CryptoError::InvalidInputError(format!("Truncated length prefix ({} bytes)", n))),
    }
}

/// Inverse of [`encrypt_stream`] using the recipient's X25519 secret.
///
/// Returns the number of plaintext bytes written.
pub fn decrypt_stream<R: Read, W: Write>(
    input: &mut R,
    output: &mut W,
    secret: &StaticSecret,
) -> Result<u64, CryptoError> {
    let wrapped_len = read_u32(input)?
        .ok_or_else(|| CryptoError::InvalidInputError("Empty container".to_string()))?;
    if wrapped_len == 0 || wrapped_len > MAX_WRAPPED_KEY_LEN {
        return Err(CryptoError::InvalidInputError(format!("Bad wrapped key length {}", wrapped_len)));
    }

    let mut wrapped = vec![0u8; wrapped_len as usize];
    if read_full(input, &mut wrapped).map_err(io_err)? != wrapped.len() {
        return Err(CryptoError::InvalidInputError("Truncated wrapped key".to_string()));
    }
    let file_key = Zeroizing::new(primitives::open(secret, &wrapped)?);
    if file_key.len() != AES_KEY_SIZE {
        return Err(CryptoError::InvalidInputError("Wrapped key has wrong size".to_string()));
    }

    let mut base_nonce = [0u8; AES_IV_SIZE];
    if read_full(input, &mut base_nonce).map_err(io_err)? != AES_IV_SIZE {
        return Err(CryptoError::InvalidInputError("Truncated nonce".to_string()));
    }

    let max_record = (FILE_CHUNK_SIZE + AES_TAG_SIZE) as u32;
    let mut index: u64 = 0;
    let mut total: u64 = 0;
    let mut record = Vec::with_capacity(max_record as usize);

    loop {
        let record_len = match read_u32(input)? {
            Some(len) => len,
            None => {
                error!("Container ended before the final record");
                return Err(CryptoError::InvalidInputError("Container truncated".to_string()));
            }
        };
        if record_len < AES_TAG_SIZE as u32 || record_len > max_record {
            return Err(CryptoError::InvalidInputError(format!("Bad record length {}", record_len)));
        }

        record.resize(record_len as usize, 0);
        if read_full(input, &mut record).map_err(io_err)? != record.len() {
            return Err(CryptoError::InvalidInputError("Truncated record".to_string()));
        }

        let nonce = counter_nonce(&base_nonce, index);
        // A record authenticates under exactly one of the two flags
        let (plaintext, last) = match primitives::decrypt(&record, &file_key, &nonce, &record_aad(index, false)) {
            Ok(p) => (p, false),
            Err(_) => (primitives::decrypt(&record, &file_key, &nonce, &record_aad(index, true))?, true),
        };

        output.write_all(&plaintext).map_err(io_err)?;
        total += plaintext.len() as u64;

        if last {
            break;
        }
        index += 1;
    }

    let mut trailing = [0u8; 1];
    if read_full(input, &mut trailing).map_err(io_err)? != 0 {
        return Err(CryptoError::InvalidInputError("Trailing data after final record".to_string()));
    }

    output.flush().map_err(io_err)?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use x25519_dalek::PublicKey;

    fn keypair() -> (StaticSecret, PublicKey) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        (secret, public)
    }

    fn roundtrip(data: &[u8]) -> Vec<u8> {
        let (secret, public) = keypair();
        let mut container = Vec::new();
        let n = encrypt_stream(&mut &data[..], &mut container, public.as_bytes()).unwrap();
        assert_eq!(n, data.len() as u64);

        let mut out = Vec::new();
        decrypt_stream(&mut &container[..], &mut out, &secret).unwrap();
        out
    }

    #[test]
    fn test_empty_and_multi_record_files() {
        assert_eq!(roundtrip(b""), b"");

        // Exactly one full chunk, and a bit more than two
        let one_chunk = vec![7u8; FILE_CHUNK_SIZE];
        assert_eq!(roundtrip(&one_chunk), one_chunk);

        let data: Vec<u8> = (0..(FILE_CHUNK_SIZE * 2 + 123)).map(|i| (i % 251) as u8).collect();
        assert_eq!(roundtrip(&data), data);
    }

    #[test]
    fn test_truncation_is_detected() {
        let (secret, public) = keypair();
        let data = vec![1u8; FILE_CHUNK_SIZE * 2 + 10];
        let mut container = Vec::new();
        encrypt_stream(&mut &data[..], &mut container, public.as_bytes()).unwrap();

        // Drop the final record entirely
        let last_record = 4 + 10 + AES_TAG_SIZE;
        let truncated = &container[..container.len() - last_record];
        let mut out = Vec::new();
        assert!(decrypt_stream(&mut &truncated[..], &mut out, &secret).is_err());

        // Trailing garbage after the final record
        let mut padded = container.clone();
        padded.push(0);
        let mut out = Vec::new();
        assert!(decrypt_stream(&mut &padded[..], &mut out, &secret).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let (_, public) = keypair();
        let (other_secret, _) = keypair();
        let mut container = Vec::new();
        encrypt_stream(&mut &b"hello"[..], &mut container, public.as_bytes()).unwrap();

        let mut out = Vec::new();
        assert!(decrypt_stream(&mut &container[..], &mut out, &other_secret).is_err());
    }
}
