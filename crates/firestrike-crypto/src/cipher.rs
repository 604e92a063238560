//! Streaming AES-256-CBC file encryption
//!
//! Blob layout: `[16-byte IV][PKCS#7-padded AES-256-CBC ciphertext]`.
//!
//! Both directions work on fixed `CHUNK_SIZE` buffers so memory use does
//! not grow with the file. Decryption withholds the most recent block
//! until end of input, because only the final block carries padding.

use crate::error::{CryptoError, Result};
use crate::keys::SymmetricKey;
use crate::{CHUNK_SIZE, IV_SIZE};
use aes::cipher::block_padding::{Padding, Pkcs7};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Block;
use rand::rngs::OsRng;
use rand::RngCore;
use std::io::{ErrorKind, Read, Write};
use tracing::trace;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size in bytes
const BLOCK_SIZE: usize = 16;

/// CBC initialization vector
pub type Iv = [u8; IV_SIZE];

/// Read into `buf` until it is full or the reader is exhausted
fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn encrypt_blocks(encryptor: &mut Aes256CbcEnc, data: &mut [u8]) {
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        encryptor.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn decrypt_blocks(decryptor: &mut Aes256CbcDec, data: &mut [u8]) {
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn encryption_io(e: std::io::Error) -> CryptoError {
    CryptoError::Encryption(format!("I/O failure: {}", e))
}

fn decryption_io(e: std::io::Error) -> CryptoError {
    CryptoError::Decryption(format!("I/O failure: {}", e))
}

/// Encrypt everything from `reader` into `writer`
///
/// Writes the IV first, then the padded ciphertext. Returns the IV and the
/// number of plaintext bytes consumed.
pub fn encrypt_stream<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    key: &SymmetricKey,
) -> Result<(Iv, u64)> {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let mut encryptor = Aes256CbcEnc::new_from_slices(key.as_bytes(), &iv)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    writer.write_all(&iv).map_err(encryption_io)?;

    // Bytes in buf[..pending] are a partial block carried to the next read
    let mut buf = vec![0u8; CHUNK_SIZE + BLOCK_SIZE];
    let mut pending = 0usize;
    let mut total = 0u64;

    loop {
        let n = read_some(&mut reader, &mut buf[pending..pending + CHUNK_SIZE])
            .map_err(encryption_io)?;
        if n == 0 {
            break;
        }
        total += n as u64;

        let available = pending + n;
        let full = available - available % BLOCK_SIZE;
        encrypt_blocks(&mut encryptor, &mut buf[..full]);
        writer.write_all(&buf[..full]).map_err(encryption_io)?;

        buf.copy_within(full..available, 0);
        pending = available - full;
    }

    // Always emit one final padded block, even for block-aligned input
    let mut last = Block::default();
    last[..pending].copy_from_slice(&buf[..pending]);
    Pkcs7::pad(&mut last, pending);
    encryptor.encrypt_block_mut(&mut last);
    writer.write_all(&last).map_err(encryption_io)?;
    writer.flush().map_err(encryption_io)?;

    trace!("Encrypted {} plaintext bytes", total);
    Ok((iv, total))
}

/// Decrypt an IV-prefixed blob from `reader` into `writer`
///
/// Returns the number of plaintext bytes written. Fails if the input is
/// shorter than an IV, is not block aligned, or has invalid padding (wrong
/// key or corrupted data). Plaintext may already have been written to
/// `writer` when a padding error is detected.
pub fn decrypt_stream<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    key: &SymmetricKey,
) -> Result<u64> {
    let mut iv = [0u8; IV_SIZE];
    let got = read_some(&mut reader, &mut iv).map_err(decryption_io)?;
    if got < IV_SIZE {
        return Err(CryptoError::Decryption(format!(
            "ciphertext shorter than IV ({} bytes)",
            got
        )));
    }

    let mut decryptor = Aes256CbcDec::new_from_slices(key.as_bytes(), &iv)
        .map_err(|e| CryptoError::Decryption(e.to_string()))?;

    let mut buf = vec![0u8; CHUNK_SIZE + BLOCK_SIZE];
    let mut pending = 0usize;
    let mut held: Option<[u8; BLOCK_SIZE]> = None;
    let mut total = 0u64;

    loop {
        let n = read_some(&mut reader, &mut buf[pending..pending + CHUNK_SIZE])
            .map_err(decryption_io)?;
        if n == 0 {
            break;
        }

        let available = pending + n;
        let full = available - available % BLOCK_SIZE;
        if full > 0 {
            decrypt_blocks(&mut decryptor, &mut buf[..full]);

            if let Some(block) = held.take() {
                writer.write_all(&block).map_err(decryption_io)?;
                total += BLOCK_SIZE as u64;
            }

            let emit = full - BLOCK_SIZE;
            writer.write_all(&buf[..emit]).map_err(decryption_io)?;
            total += emit as u64;

            let mut last = [0u8; BLOCK_SIZE];
            last.copy_from_slice(&buf[emit..full]);
            held = Some(last);
        }

        buf.copy_within(full..available, 0);
        pending = available - full;
    }

    if pending != 0 {
        return Err(CryptoError::Decryption(
            "ciphertext length is not a multiple of the block size".to_string(),
        ));
    }

    let last = held
        .map(Block::from)
        .ok_or_else(|| CryptoError::Decryption("ciphertext has no blocks".to_string()))?;

    let tail = Pkcs7::unpad(&last).map_err(|_| {
        CryptoError::Decryption("invalid padding (wrong key or corrupted data)".to_string())
    })?;

    writer.write_all(tail).map_err(decryption_io)?;
    total += tail.len() as u64;
    writer.flush().map_err(decryption_io)?;

    trace!("Decrypted {} plaintext bytes", total);
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_key;

    fn roundtrip(plaintext: &[u8]) {
        let key = generate_key();

        let mut ciphertext = Vec::new();
        let (iv, consumed) = encrypt_stream(plaintext, &mut ciphertext, &key).unwrap();
        assert_eq!(consumed, plaintext.len() as u64);
        assert_eq!(&ciphertext[..IV_SIZE], &iv);
        assert_eq!((ciphertext.len() - IV_SIZE) % BLOCK_SIZE, 0);
        assert!(ciphertext.len() > plaintext.len() + IV_SIZE - 1);

        let mut recovered = Vec::new();
        let written = decrypt_stream(&ciphertext[..], &mut recovered, &key).unwrap();
        assert_eq!(written, plaintext.len() as u64);
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn test_roundtrip_empty() {
        roundtrip(&[]);
    }

    #[test]
    fn test_roundtrip_one_byte() {
        roundtrip(&[0x42]);
    }

    #[test]
    fn test_roundtrip_exact_block() {
        roundtrip(&[7u8; BLOCK_SIZE]);
    }

    #[test]
    fn test_roundtrip_multi_chunk() {
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 + 5)).map(|i| (i * 31 % 256) as u8).collect();
        roundtrip(&data);
    }

    #[test]
    fn test_roundtrip_chunk_boundary() {
        roundtrip(&vec![1u8; CHUNK_SIZE]);
        roundtrip(&vec![2u8; CHUNK_SIZE - 1]);
        roundtrip(&vec![3u8; CHUNK_SIZE + 1]);
    }

    #[test]
    fn test_exact_block_gets_full_padding_block() {
        let key = generate_key();
        let mut ciphertext = Vec::new();
        encrypt_stream(&[0u8; BLOCK_SIZE][..], &mut ciphertext, &key).unwrap();
        assert_eq!(ciphertext.len(), IV_SIZE + 2 * BLOCK_SIZE);
    }

    #[test]
    fn test_padding_bytes_follow_pkcs7() {
        let key = generate_key();
        let mut ciphertext = Vec::new();
        let (iv, _) = encrypt_stream(&[9u8; 5][..], &mut ciphertext, &key).unwrap();

        // Decrypt the single block by hand to look at the raw padding
        let mut block = Block::clone_from_slice(&ciphertext[IV_SIZE..]);
        Aes256CbcDec::new_from_slices(key.as_bytes(), &iv)
            .unwrap()
            .decrypt_block_mut(&mut block);
        assert_eq!(&block[..5], &[9u8; 5]);
        assert!(block[5..].iter().all(|&b| b == 11));
    }

    #[test]
    fn test_decrypt_rejects_corrupted_padding() {
        let key = generate_key();
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);

        // Last byte claims 4 bytes of padding but the block holds other values
        let mut block = Block::from([1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 3, 2, 4]);
        Aes256CbcEnc::new_from_slices(key.as_bytes(), &iv)
            .unwrap()
            .encrypt_block_mut(&mut block);

        let mut blob = iv.to_vec();
        blob.extend_from_slice(&block);
        let mut out = Vec::new();
        let result = decrypt_stream(&blob[..], &mut out, &key);
        assert!(matches!(result, Err(CryptoError::Decryption(_))));
        assert!(out.is_empty());
    }

    #[test]
    fn test_fresh_iv_per_encryption() {
        let key = generate_key();
        let mut a = Vec::new();
        let mut b = Vec::new();
        encrypt_stream(&b"same"[..], &mut a, &key).unwrap();
        encrypt_stream(&b"same"[..], &mut b, &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_shorter_than_iv() {
        let key = generate_key();
        let result = decrypt_stream(&[0u8; IV_SIZE - 1][..], Vec::new(), &key);
        assert!(matches!(result, Err(CryptoError::Decryption(_))));
    }

    #[test]
    fn test_decrypt_iv_only() {
        let key = generate_key();
        let result = decrypt_stream(&[0u8; IV_SIZE][..], Vec::new(), &key);
        assert!(matches!(result, Err(CryptoError::Decryption(_))));
    }

    #[test]
    fn test_decrypt_truncated_ciphertext() {
        let key = generate_key();
        let mut ciphertext = Vec::new();
        encrypt_stream(&[5u8; 100][..], &mut ciphertext, &key).unwrap();
        ciphertext.truncate(ciphertext.len() - 3);

        let result = decrypt_stream(&ciphertext[..], Vec::new(), &key);
        assert!(matches!(result, Err(CryptoError::Decryption(_))));
    }

    #[test]
    fn test_decrypt_wrong_key_never_yields_plaintext() {
        let plaintext = b"confidential payload for a single peer".to_vec();
        let key = generate_key();
        let wrong = generate_key();

        let mut ciphertext = Vec::new();
        encrypt_stream(&plaintext[..], &mut ciphertext, &key).unwrap();

        let mut out = Vec::new();
        match decrypt_stream(&ciphertext[..], &mut out, &wrong) {
            Err(CryptoError::Decryption(_)) => {}
            Err(other) => panic!("unexpected error: {}", other),
            // Random padding can validate by chance; the bytes must still differ
            Ok(_) => assert_ne!(out, plaintext),
        }
    }

    #[test]
    fn test_encrypt_reader_failure_is_encryption_error() {
        struct FailingReader;
        impl Read for FailingReader {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(ErrorKind::Other, "disk gone"))
            }
        }

        let result = encrypt_stream(FailingReader, Vec::new(), &generate_key());
        assert!(matches!(result, Err(CryptoError::Encryption(_))));
    }
}
