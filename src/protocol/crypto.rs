//! Per-device packet cryptography
//!
//! Every device shares a 16-byte token with its owner. From it we derive
//! an AES-128-CBC key and IV:
//!
//! ```text
//! key = MD5(token)
//! iv  = MD5(key || token)
//! ```
//!
//! Packets carry an MD5 checksum over the serialized header (with the
//! checksum field replaced by the token) followed by the encrypted payload.

use aes::Aes128;
use bytes::{Bytes, BytesMut};
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use tokio::time::Instant;

use super::packet::{Header, Packet, CHECKSUM_LEN, HEADER_LEN};
use crate::core::{DeviceId, Error, Result, Token};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES block size
pub const BLOCK_SIZE: usize = 16;

/// Pads `data` to a multiple of `block_size`.
///
/// Always appends between 1 and `block_size` bytes, each holding the
/// number of bytes appended.
pub fn pad(data: &[u8], block_size: usize) -> Vec<u8> {
    let pad_len = block_size - data.len() % block_size;
    let mut padded = Vec::with_capacity(data.len() + pad_len);
    padded.extend_from_slice(data);
    padded.resize(data.len() + pad_len, pad_len as u8);
    padded
}

/// Strips padding added by [`pad`].
pub fn unpad(data: &[u8], block_size: usize) -> Result<&[u8]> {
    if data.is_empty() || data.len() % block_size != 0 {
        return Err(Error::crypto(format!(
            "Padded length {} is not a multiple of {}",
            data.len(),
            block_size
        )));
    }

    let pad_len = data[data.len() - 1] as usize;
    if pad_len == 0 || pad_len > block_size {
        return Err(Error::crypto(format!("Invalid pad length {}", pad_len)));
    }

    let (body, padding) = data.split_at(data.len() - pad_len);
    if padding.iter().any(|&b| b as usize != pad_len) {
        return Err(Error::crypto("Inconsistent padding bytes"));
    }

    Ok(body)
}

fn md5(parts: &[&[u8]]) -> [u8; CHECKSUM_LEN] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    let mut digest = [0u8; CHECKSUM_LEN];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// Cipher state for one device
pub struct Crypto {
    device_id: DeviceId,
    token: Token,
    key: [u8; 16],
    iv: [u8; 16],
    initial_stamp: u32,
    stamp_time: Instant,
}

impl std::fmt::Debug for Crypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crypto")
            .field("device_id", &self.device_id)
            .field("initial_stamp", &self.initial_stamp)
            .finish_non_exhaustive()
    }
}

impl Crypto {
    /// Derives key material from `token`, seeding the stamp with the value
    /// observed in the device's first response at `stamp_time`.
    pub fn new(device_id: DeviceId, token: Token, initial_stamp: u32, stamp_time: Instant) -> Self {
        let key = md5(&[&token.as_bytes()[..]]);
        let iv = md5(&[&key[..], &token.as_bytes()[..]]);

        Crypto {
            device_id,
            token,
            key,
            iv,
            initial_stamp,
            stamp_time,
        }
    }

    /// Device this cipher belongs to
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Shared token
    pub fn token(&self) -> &Token {
        &self.token
    }

    /// Current outgoing stamp: the seed plus whole seconds elapsed since it
    /// was observed. Devices reject stale stamps.
    pub fn stamp(&self) -> u32 {
        let elapsed = Instant::now().saturating_duration_since(self.stamp_time).as_secs();
        self.initial_stamp.wrapping_add(elapsed as u32)
    }

    /// Pads and encrypts `plaintext`
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let padded = pad(plaintext, BLOCK_SIZE);
        Aes128CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<NoPadding>(&padded)
    }

    /// Decrypts `ciphertext` and strips its padding
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(Error::crypto(format!(
                "Ciphertext length {} is not block aligned",
                ciphertext.len()
            )));
        }

        let padded = Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|e| Error::crypto(format!("Decrypt failed: {}", e)))?;

        Ok(unpad(&padded, BLOCK_SIZE)?.to_vec())
    }

    /// Checksum of `header` and `payload` keyed with the device token
    pub fn checksum(&self, header: &Header, payload: &[u8]) -> [u8; CHECKSUM_LEN] {
        let keyed = Header {
            checksum: *self.token.as_bytes(),
            ..header.clone()
        };
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        keyed.encode(&mut buf);
        md5(&[&buf[..], payload])
    }

    /// Encrypts `plaintext` into a freshly stamped, checksummed packet
    pub fn new_packet(&self, plaintext: &[u8]) -> Result<Packet> {
        let payload = Bytes::from(self.encrypt(plaintext));
        let mut packet = Packet::new(self.device_id, [0; CHECKSUM_LEN], self.stamp(), payload)?;
        packet.header.checksum = self.checksum(&packet.header, &packet.payload);
        Ok(packet)
    }

    /// Recomputes the checksum of a received packet.
    ///
    /// A mismatch means the packet is corrupt or was not produced with this
    /// device's token.
    pub fn verify_packet(&self, packet: &Packet) -> Result<()> {
        let expected = self.checksum(&packet.header, &packet.payload);
        if expected != packet.header.checksum {
            return Err(Error::crypto(format!(
                "Checksum mismatch on packet from device {}",
                packet.header.device_id
            )));
        }
        Ok(())
    }
}
