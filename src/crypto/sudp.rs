//! SUDP: AES-128-CBC encryption for UDP search results (§4.G, §4.J).
//!
//! The 16 random bytes are NOT a cleartext IV: they are the *first plaintext
//! block*. The whole buffer — random block, then the real payload — is
//! PKCS#5/7-padded to a 16-byte boundary and AES-128-CBC encrypted under a
//! **zero** IV register, so the random block is what actually randomizes the
//! ciphertext (CBC chaining does the rest). This matches
//! `ClientManager::encryptSUDP`: `RAND_bytes(ivd, 16)` is written as the
//! first plaintext block, then `memset(ivd, 0, 16)` zeroes the IV register
//! before `AES_cbc_encrypt(..., ivd, AES_ENCRYPT)` runs over the whole thing.

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::error::CryptoError;

type Enc = cbc::Encryptor<Aes128>;
type Dec = cbc::Decryptor<Aes128>;

const ZERO_IV: [u8; 16] = [0u8; 16];

/// Message-class bytes a decrypted ADC frame may legally start with (§4.A).
const ADC_CLASS_BYTES: &[u8] = b"BDEFHICU";

/// Encrypts `plaintext` under `key`: prepends a random 16-byte block as the
/// first plaintext block, pads the whole thing, and encrypts it under a
/// zero IV.
#[must_use]
pub fn encrypt(key: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + plaintext.len());
    let mut random_block = [0u8; 16];
    rand::rng().fill_bytes(&mut random_block);
    buf.extend_from_slice(&random_block);
    buf.extend_from_slice(plaintext);

    Enc::new(key.into(), (&ZERO_IV).into()).encrypt_padded_vec_mut::<Pkcs7>(&buf)
}

/// Decrypts a SUDP packet: AES-128-CBC-decrypts the whole thing under a
/// zero IV, strips the PKCS#5 padding, then strips the leading 16-byte
/// random block. Rejects anything not 16-byte aligned, shorter than two
/// blocks, or whose recovered plaintext doesn't start with a printable ADC
/// command class character — a packet that decrypts "cleanly" to garbage
/// under the wrong key is otherwise indistinguishable from a real one.
pub fn decrypt(key: &[u8; 16], packet: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if packet.len() < 32 || packet.len() % 16 != 0 {
        return Err(CryptoError::SudpDecrypt(format!(
            "packet length {} is not a valid SUDP frame",
            packet.len()
        )));
    }
    let mut buf = packet.to_vec();

    let padded = Dec::new(key.into(), (&ZERO_IV).into())
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|e| CryptoError::SudpDecrypt(e.to_string()))?;

    if padded.len() < 16 {
        return Err(CryptoError::SudpDecrypt("decrypted packet shorter than the random block".into()));
    }
    let plaintext = padded[16..].to_vec();

    match plaintext.first() {
        Some(b) if ADC_CLASS_BYTES.contains(b) => Ok(plaintext),
        _ => Err(CryptoError::SudpDecrypt(
            "decrypted plaintext does not start with a printable ADC command character".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plaintext() {
        let key = [7u8; 16];
        let plaintext = b"DRES AAAB FNfile.txt SI1024";
        let packet = encrypt(&key, plaintext);
        let decrypted = decrypt(&key, &packet).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn rejects_misaligned_length() {
        let key = [7u8; 16];
        let bad = vec![0u8; 33];
        assert!(decrypt(&key, &bad).is_err());
    }

    #[test]
    fn rejects_too_short_packet() {
        let key = [7u8; 16];
        let bad = vec![0u8; 16];
        assert!(decrypt(&key, &bad).is_err());
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let key = [7u8; 16];
        let other_key = [8u8; 16];
        let packet = encrypt(&key, b"hello world12345");
        assert!(decrypt(&other_key, &packet).is_err());
    }

    #[test]
    fn rejects_plaintext_not_starting_with_a_command_class_byte() {
        let key = [7u8; 16];
        let packet = encrypt(&key, b"not a command");
        assert!(decrypt(&key, &packet).is_err());
    }

    #[test]
    fn random_block_differs_between_calls_on_identical_plaintext() {
        let key = [7u8; 16];
        let plaintext = b"SCH AAAB ANfoo TO42";
        let a = encrypt(&key, plaintext);
        let b = encrypt(&key, plaintext);
        assert_ne!(a, b);
    }
}
