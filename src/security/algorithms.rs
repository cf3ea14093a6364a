use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use sha1::Sha1;
use sha2::Sha256;

/// RAKP authentication algorithm numbers (IPMI v2.0 table 13-17).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AuthenticationAlgorithm {
    None = 0x00,
    HmacSha1 = 0x01,
    HmacMd5 = 0x02,
    HmacSha256 = 0x03,
}

impl AuthenticationAlgorithm {
    /// Keyed digest used for RAKP auth codes and session key derivation.
    pub fn digest(&self, key: &[u8], message: &[u8]) -> Vec<u8> {
        match self {
            AuthenticationAlgorithm::None => Vec::new(),
            AuthenticationAlgorithm::HmacSha1 => hmac_sha1(key, message),
            AuthenticationAlgorithm::HmacMd5 => hmac_md5(key, message),
            AuthenticationAlgorithm::HmacSha256 => hmac_sha256(key, message),
        }
    }

    pub fn digest_len(&self) -> usize {
        match self {
            AuthenticationAlgorithm::None => 0,
            AuthenticationAlgorithm::HmacSha1 => 20,
            AuthenticationAlgorithm::HmacMd5 => 16,
            AuthenticationAlgorithm::HmacSha256 => 32,
        }
    }
}

/// Session integrity algorithm numbers (IPMI v2.0 table 13-18).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum IntegrityAlgorithm {
    None = 0x00,
    HmacSha1_96 = 0x01,
    HmacMd5_128 = 0x02,
    Md5_128 = 0x03,
    HmacSha256_128 = 0x04,
}

impl IntegrityAlgorithm {
    /// Length of the AuthCode trailer on authenticated packets.
    pub fn tag_len(&self) -> usize {
        match self {
            IntegrityAlgorithm::None => 0,
            IntegrityAlgorithm::HmacSha1_96 => 12,
            IntegrityAlgorithm::HmacMd5_128 => 16,
            IntegrityAlgorithm::Md5_128 => 16,
            IntegrityAlgorithm::HmacSha256_128 => 16,
        }
    }

    /// Computes the (already truncated) integrity tag with the session's K1.
    pub fn tag(&self, key: &[u8], message: &[u8]) -> Vec<u8> {
        let mut digest = match self {
            IntegrityAlgorithm::None => Vec::new(),
            IntegrityAlgorithm::HmacSha1_96 => hmac_sha1(key, message),
            IntegrityAlgorithm::HmacMd5_128 => hmac_md5(key, message),
            IntegrityAlgorithm::Md5_128 => keyed_md5(key, message),
            IntegrityAlgorithm::HmacSha256_128 => hmac_sha256(key, message),
        };
        digest.truncate(self.tag_len());
        digest
    }
}

/// Session confidentiality algorithm numbers (IPMI v2.0 table 13-19).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ConfidentialityAlgorithm {
    None = 0x00,
    AesCbc128 = 0x01,
    Xrc4_128 = 0x02,
    Xrc4_40 = 0x03,
}

fn hmac_sha1(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

fn hmac_md5(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Md5>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Legacy non-HMAC integrity: MD5 over key || message || key.
fn keyed_md5(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut hasher = Md5::new();
    hasher.update(key);
    hasher.update(message);
    hasher.update(key);
    hasher.finalize().to_vec()
}
