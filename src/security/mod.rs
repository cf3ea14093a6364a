//! Cipher suite registry and the session key machinery built on top of it.

pub mod algorithms;

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use rand::RngCore;

use crate::error::IpmiError;

pub use crate::security::algorithms::{
    AuthenticationAlgorithm, ConfidentialityAlgorithm, IntegrityAlgorithm,
};

const AES_BLOCK: usize = 16;

const KEY_DERIVATION_CONST_1: [u8; 20] = [0x01; 20];
const KEY_DERIVATION_CONST_2: [u8; 20] = [0x02; 20];

type Aes128CbcEncryptor = cbc::Encryptor<Aes128>;
type Aes128CbcDecryptor = cbc::Decryptor<Aes128>;

/// One of the standard IPMI v2.0 cipher suites: an immutable triple of
/// authentication, integrity and confidentiality algorithms.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct CipherSuite {
    pub id: u8,
    pub authentication: AuthenticationAlgorithm,
    pub integrity: IntegrityAlgorithm,
    pub confidentiality: ConfidentialityAlgorithm,
}

/// Keys installed into a session record after RAKP-4 validates.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SessionKeys {
    pub sik: Vec<u8>,
    pub k1: Vec<u8>,
    pub k2: Vec<u8>,
}

const fn suite(
    id: u8,
    authentication: AuthenticationAlgorithm,
    integrity: IntegrityAlgorithm,
    confidentiality: ConfidentialityAlgorithm,
) -> CipherSuite {
    CipherSuite {
        id,
        authentication,
        integrity,
        confidentiality,
    }
}

impl CipherSuite {
    /// The cipher suites this library knows, by standard suite ID.
    pub const ALL: [CipherSuite; 13] = [
        suite(
            0,
            AuthenticationAlgorithm::None,
            IntegrityAlgorithm::None,
            ConfidentialityAlgorithm::None,
        ),
        suite(
            1,
            AuthenticationAlgorithm::HmacSha1,
            IntegrityAlgorithm::None,
            ConfidentialityAlgorithm::None,
        ),
        suite(
            2,
            AuthenticationAlgorithm::HmacSha1,
            IntegrityAlgorithm::HmacSha1_96,
            ConfidentialityAlgorithm::None,
        ),
        suite(
            3,
            AuthenticationAlgorithm::HmacSha1,
            IntegrityAlgorithm::HmacSha1_96,
            ConfidentialityAlgorithm::AesCbc128,
        ),
        suite(
            6,
            AuthenticationAlgorithm::HmacMd5,
            IntegrityAlgorithm::None,
            ConfidentialityAlgorithm::None,
        ),
        suite(
            7,
            AuthenticationAlgorithm::HmacMd5,
            IntegrityAlgorithm::HmacMd5_128,
            ConfidentialityAlgorithm::None,
        ),
        suite(
            8,
            AuthenticationAlgorithm::HmacMd5,
            IntegrityAlgorithm::HmacMd5_128,
            ConfidentialityAlgorithm::AesCbc128,
        ),
        suite(
            11,
            AuthenticationAlgorithm::HmacMd5,
            IntegrityAlgorithm::Md5_128,
            ConfidentialityAlgorithm::None,
        ),
        suite(
            12,
            AuthenticationAlgorithm::HmacMd5,
            IntegrityAlgorithm::Md5_128,
            ConfidentialityAlgorithm::AesCbc128,
        ),
        suite(
            14,
            AuthenticationAlgorithm::HmacMd5,
            IntegrityAlgorithm::Md5_128,
            ConfidentialityAlgorithm::Xrc4_40,
        ),
        suite(
            15,
            AuthenticationAlgorithm::HmacSha256,
            IntegrityAlgorithm::None,
            ConfidentialityAlgorithm::None,
        ),
        suite(
            16,
            AuthenticationAlgorithm::HmacSha256,
            IntegrityAlgorithm::HmacSha256_128,
            ConfidentialityAlgorithm::None,
        ),
        suite(
            17,
            AuthenticationAlgorithm::HmacSha256,
            IntegrityAlgorithm::HmacSha256_128,
            ConfidentialityAlgorithm::AesCbc128,
        ),
    ];

    pub fn from_id(id: u8) -> Option<CipherSuite> {
        CipherSuite::ALL.iter().find(|s| s.id == id).copied()
    }

    /// Looks up the suite matching a triple of raw algorithm numbers, as
    /// echoed in an open-session response.
    pub fn from_algorithms(
        authentication: u8,
        integrity: u8,
        confidentiality: u8,
    ) -> Option<CipherSuite> {
        CipherSuite::ALL
            .iter()
            .find(|s| {
                u8::from(s.authentication) == authentication
                    && u8::from(s.integrity) == integrity
                    && u8::from(s.confidentiality) == confidentiality
            })
            .copied()
    }

    /// True when sessions on this suite carry an AuthCode trailer.
    pub fn authenticated(&self) -> bool {
        self.integrity != IntegrityAlgorithm::None
    }

    /// True when sessions on this suite encrypt the payload.
    pub fn encrypted(&self) -> bool {
        self.confidentiality != ConfidentialityAlgorithm::None
    }

    /// Derives SIK, K1 and K2 from the credentials and the two RAKP nonces.
    /// A configured BMC key (K_g) replaces the user password as the SIK key.
    #[allow(clippy::too_many_arguments)]
    pub fn derive_session_keys(
        &self,
        password: &[u8],
        bmc_key: Option<&[u8]>,
        rakp1_nonce: &[u8; 16],
        rakp2_nonce: &[u8; 16],
        privilege: u8,
        username: &[u8],
    ) -> SessionKeys {
        let key = bmc_key.filter(|k| !k.is_empty()).unwrap_or(password);

        let mut input = Vec::with_capacity(34 + username.len());
        input.extend_from_slice(rakp2_nonce);
        input.extend_from_slice(rakp1_nonce);
        input.push(privilege);
        input.push(username.len() as u8);
        input.extend_from_slice(username);
        let sik = self.authentication.digest(key, &input);

        let k1 = self.authentication.digest(&sik, &KEY_DERIVATION_CONST_1);
        let k2 = self.authentication.digest(&sik, &KEY_DERIVATION_CONST_2);

        SessionKeys { sik, k1, k2 }
    }

    /// Key-exchange auth code the BMC must present in RAKP-2.
    #[allow(clippy::too_many_arguments)]
    pub fn rakp2_auth_code(
        &self,
        password: &[u8],
        console_session_id: u32,
        managed_system_session_id: u32,
        console_nonce: &[u8; 16],
        bmc_nonce: &[u8; 16],
        bmc_guid: &[u8; 16],
        privilege: u8,
        username: &[u8],
    ) -> Vec<u8> {
        let mut input = Vec::with_capacity(42 + username.len());
        input.extend_from_slice(&console_session_id.to_le_bytes());
        input.extend_from_slice(&managed_system_session_id.to_le_bytes());
        input.extend_from_slice(console_nonce);
        input.extend_from_slice(bmc_nonce);
        input.extend_from_slice(bmc_guid);
        input.push(privilege);
        input.push(username.len() as u8);
        input.extend_from_slice(username);
        self.authentication.digest(password, &input)
    }

    /// Key-exchange auth code the console presents in RAKP-3.
    pub fn rakp3_auth_code(
        &self,
        password: &[u8],
        bmc_nonce: &[u8; 16],
        console_session_id: u32,
        privilege: u8,
        username: &[u8],
    ) -> Vec<u8> {
        let mut input = Vec::with_capacity(22 + username.len());
        input.extend_from_slice(bmc_nonce);
        input.extend_from_slice(&console_session_id.to_le_bytes());
        input.push(privilege);
        input.push(username.len() as u8);
        input.extend_from_slice(username);
        self.authentication.digest(password, &input)
    }

    /// Integrity check value the BMC must present in RAKP-4, keyed with the
    /// freshly derived SIK.
    pub fn rakp4_integrity_check(
        &self,
        sik: &[u8],
        console_nonce: &[u8; 16],
        managed_system_session_id: u32,
        bmc_guid: &[u8; 16],
    ) -> Vec<u8> {
        let mut input = Vec::with_capacity(36);
        input.extend_from_slice(console_nonce);
        input.extend_from_slice(&managed_system_session_id.to_le_bytes());
        input.extend_from_slice(bmc_guid);
        self.authentication.digest(sik, &input)
    }

    /// Wraps a payload in this suite's confidentiality envelope. AES-CBC-128
    /// prepends a random IV and pads with the `01 02 .. N` + length trailer.
    pub fn encrypt_payload(&self, k2: &[u8], payload: &[u8]) -> Result<Vec<u8>, IpmiError> {
        match self.confidentiality {
            ConfidentialityAlgorithm::None => Ok(payload.to_vec()),
            ConfidentialityAlgorithm::AesCbc128 => {
                let key = aes_key(k2)?;

                let pad_len = (AES_BLOCK - (payload.len() + 1) % AES_BLOCK) % AES_BLOCK;
                let mut buf = Vec::with_capacity(AES_BLOCK + payload.len() + pad_len + 1);
                buf.extend_from_slice(payload);
                for i in 0..pad_len {
                    buf.push((i + 1) as u8);
                }
                buf.push(pad_len as u8);

                let mut iv = [0u8; AES_BLOCK];
                rand::thread_rng().fill_bytes(&mut iv);

                let len = buf.len();
                Aes128CbcEncryptor::new_from_slices(key, &iv)
                    .map_err(|_| IpmiError::IllegalState("AES-CBC initialization".into()))?
                    .encrypt_padded_mut::<NoPadding>(&mut buf, len)
                    .map_err(|_| IpmiError::IllegalState("AES-CBC padding".into()))?;

                let mut out = iv.to_vec();
                out.append(&mut buf);
                Ok(out)
            }
            ConfidentialityAlgorithm::Xrc4_128 | ConfidentialityAlgorithm::Xrc4_40 => Err(
                IpmiError::IllegalState("xRC4 confidentiality is not implemented".into()),
            ),
        }
    }

    /// Inverts [`CipherSuite::encrypt_payload`], validating the pad pattern.
    pub fn decrypt_payload(&self, k2: &[u8], data: &[u8]) -> Result<Vec<u8>, IpmiError> {
        match self.confidentiality {
            ConfidentialityAlgorithm::None => Ok(data.to_vec()),
            ConfidentialityAlgorithm::AesCbc128 => {
                let key = aes_key(k2)?;

                if data.len() < 2 * AES_BLOCK || (data.len() - AES_BLOCK) % AES_BLOCK != 0 {
                    return Err(IpmiError::ProtocolViolation(format!(
                        "encrypted payload has invalid length {}",
                        data.len()
                    )));
                }
                let (iv, ciphertext) = data.split_at(AES_BLOCK);
                let mut buf = ciphertext.to_vec();
                Aes128CbcDecryptor::new_from_slices(key, iv)
                    .map_err(|_| IpmiError::IllegalState("AES-CBC initialization".into()))?
                    .decrypt_padded_mut::<NoPadding>(&mut buf)
                    .map_err(|_| {
                        IpmiError::ProtocolViolation("AES-CBC decryption failed".into())
                    })?;

                let pad_len = *buf.last().expect("buffer is at least one block") as usize;
                if buf.len() < pad_len + 1 {
                    return Err(IpmiError::ProtocolViolation(
                        "encrypted payload pad length exceeds payload".into(),
                    ));
                }
                let pad = &buf[buf.len() - 1 - pad_len..buf.len() - 1];
                if pad.iter().enumerate().any(|(i, b)| *b != (i + 1) as u8) {
                    return Err(IpmiError::ProtocolViolation(
                        "encrypted payload pad pattern invalid".into(),
                    ));
                }
                buf.truncate(buf.len() - 1 - pad_len);
                Ok(buf)
            }
            ConfidentialityAlgorithm::Xrc4_128 | ConfidentialityAlgorithm::Xrc4_40 => Err(
                IpmiError::IllegalState("xRC4 confidentiality is not implemented".into()),
            ),
        }
    }
}

fn aes_key(k2: &[u8]) -> Result<&[u8], IpmiError> {
    if k2.len() < AES_BLOCK {
        return Err(IpmiError::IllegalState(format!(
            "K2 too short for AES-CBC-128: {} bytes",
            k2.len()
        )));
    }
    Ok(&k2[..AES_BLOCK])
}
