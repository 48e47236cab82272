//! At-rest encryption of capture files
//!
//! Two stream transforms are supported, both addressed by absolute file
//! position so that any aligned window of a file can be decrypted on its own:
//!
//! - `aes-256-ctr`: the 16-byte counter block is the 12-byte file IV followed
//!   by the big-endian index of the 16-byte block in the file.
//! - `xor-2048`: every byte is XORed with `key[position % 256]`.
//!
//! Data encryption keys are stored wrapped; [`unwrap_dek`] recovers them from
//! the key-encryption passphrase.

use aes::{Aes192, Aes256};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher, StreamCipherSeek};
use md5::{Digest, Md5};

use crate::PcapError;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type Aes192CbcDec = cbc::Decryptor<Aes192>;
type Aes192CbcEnc = cbc::Encryptor<Aes192>;

pub const AES_256_CTR: &str = "aes-256-ctr";
pub const XOR_2048: &str = "xor-2048";

/// Decryption transform of one capture file
#[derive(Clone)]
pub enum Cipher {
    None,
    Aes256Ctr { key: [u8; 32], iv: [u8; 12] },
    Xor2048 { key: Box<[u8; 256]> },
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print key material
        f.write_str(self.name())
    }
}

impl Cipher {
    /// Build a cipher from the algorithm name, unwrapped key, and hex IV
    pub fn new(algorithm: &str, key: &[u8], iv_hex: Option<&str>) -> Result<Cipher, PcapError> {
        match algorithm {
            "" | "normal" | "none" => Ok(Cipher::None),
            AES_256_CTR => {
                let key: [u8; 32] = key.try_into().map_err(|_| {
                    PcapError::Encryption(format!("{} needs a 32-byte key, got {}", AES_256_CTR, key.len()))
                })?;
                let iv_hex = iv_hex.ok_or_else(|| PcapError::Encryption(format!("{} without iv", AES_256_CTR)))?;
                let raw = hex::decode(iv_hex).map_err(|e| PcapError::Encryption(format!("bad iv: {}", e)))?;
                if raw.len() < 12 {
                    return Err(PcapError::Encryption(format!("iv too short: {} bytes", raw.len())));
                }
                let mut iv = [0u8; 12];
                iv.copy_from_slice(&raw[..12]);
                Ok(Cipher::Aes256Ctr { key, iv })
            }
            XOR_2048 => {
                if key.len() < 256 {
                    return Err(PcapError::Encryption(format!(
                        "{} needs a 256-byte key, got {}",
                        XOR_2048,
                        key.len()
                    )));
                }
                let mut k = Box::new([0u8; 256]);
                k.copy_from_slice(&key[..256]);
                Ok(Cipher::Xor2048 { key: k })
            }
            other => Err(PcapError::Encryption(format!("unsupported encoding '{}'", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Cipher::None => "normal",
            Cipher::Aes256Ctr { .. } => AES_256_CTR,
            Cipher::Xor2048 { .. } => XOR_2048,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        !matches!(self, Cipher::None)
    }

    /// Reads must start on a multiple of this value to be decryptable
    pub fn alignment(&self) -> u64 {
        match self {
            Cipher::None => 1,
            Cipher::Aes256Ctr { .. } => 16,
            Cipher::Xor2048 { .. } => 256,
        }
    }

    /// Decrypt (or encrypt, both are the same) `buf`, which was read at `file_offset`
    pub fn apply(&self, buf: &mut [u8], file_offset: u64) {
        match self {
            Cipher::None => (),
            Cipher::Aes256Ctr { key, iv } => {
                let mut block = [0u8; 16];
                block[..12].copy_from_slice(iv);
                let mut c = Aes256Ctr::new(key.into(), (&block).into());
                c.seek(file_offset);
                c.apply_keystream(buf);
            }
            Cipher::Xor2048 { key } => {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b ^= key[((file_offset + i as u64) % 256) as usize];
                }
            }
        }
    }
}

/// OpenSSL `EVP_BytesToKey` with MD5, one round and no salt
fn bytes_to_key(passphrase: &[u8], key_len: usize, iv_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(key_len + iv_len);
    let mut prev: Vec<u8> = Vec::new();
    while out.len() < key_len + iv_len {
        let mut h = Md5::new();
        h.update(&prev);
        h.update(passphrase);
        prev = h.finalize().to_vec();
        out.extend_from_slice(&prev);
    }
    out.truncate(key_len + iv_len);
    out
}

/// Unwrap a hex-encoded data encryption key with the key-encryption passphrase (AES-192-CBC)
pub fn unwrap_dek(dek_hex: &str, kek: &[u8]) -> Result<Vec<u8>, PcapError> {
    let mut buf = hex::decode(dek_hex).map_err(|e| PcapError::Encryption(format!("bad dek: {}", e)))?;
    let material = bytes_to_key(kek, 24, 16);
    let (key, iv) = material.split_at(24);
    let dec = Aes192CbcDec::new_from_slices(key, iv)
        .map_err(|e| PcapError::Encryption(format!("bad kek: {}", e)))?;
    let plain = dec
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| PcapError::Encryption("dek unwrap failed, wrong kek?".to_string()))?;
    Ok(plain.to_vec())
}

/// Wrap a data encryption key the way the capture side stores it
pub fn wrap_dek(dek: &[u8], kek: &[u8]) -> Result<String, PcapError> {
    let material = bytes_to_key(kek, 24, 16);
    let (key, iv) = material.split_at(24);
    let enc = Aes192CbcEnc::new_from_slices(key, iv)
        .map_err(|e| PcapError::Encryption(format!("bad kek: {}", e)))?;
    Ok(hex::encode(enc.encrypt_padded_vec_mut::<Pkcs7>(dek)))
}
