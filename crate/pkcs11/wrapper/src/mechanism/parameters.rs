//! Mechanism parameter blocks.
//!
//! Blocks are built once and then only read, except for the output fields a
//! token writes during the call that consumes them (the negotiated version of
//! a master key derivation, the handles and IVs of a key material
//! derivation).

use std::fmt;

use pkcs11_sys::{CK_MECHANISM_TYPE, CK_OBJECT_HANDLE, CK_RSA_PKCS_MGF_TYPE};

use super::ParameterFamily;
use crate::{
    error::{HError, HResult},
    preview::BytesPreview,
};

/// A protocol version, `CK_VERSION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VersionParams {
    pub major: u8,
    pub minor: u8,
}

impl VersionParams {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for VersionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Client and server random nonces of an SSL/TLS handshake.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RandomDataParams {
    pub(crate) client_random: Vec<u8>,
    pub(crate) server_random: Vec<u8>,
}

impl RandomDataParams {
    /// # Errors
    /// * `InvalidParameterLength` if either random is empty
    pub fn new(client_random: Vec<u8>, server_random: Vec<u8>) -> HResult<Self> {
        for (field, random) in [
            ("client random", &client_random),
            ("server random", &server_random),
        ] {
            if random.is_empty() {
                return Err(HError::InvalidParameterLength {
                    field,
                    expected: 32,
                    actual: 0,
                });
            }
        }
        Ok(Self {
            client_random,
            server_random,
        })
    }

    #[must_use]
    pub fn client_random(&self) -> &[u8] {
        &self.client_random
    }

    #[must_use]
    pub fn server_random(&self) -> &[u8] {
        &self.server_random
    }
}

impl fmt::Debug for RandomDataParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RandomDataParams")
            .field("client_random", &BytesPreview(&self.client_random))
            .field("server_random", &BytesPreview(&self.server_random))
            .finish()
    }
}

/// `CK_SSL3_MASTER_KEY_DERIVE_PARAMS`. The token writes the client version
/// found in the pre-master secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MasterKeyDeriveParams {
    pub(crate) random_info: RandomDataParams,
    pub(crate) version: VersionParams,
}

impl MasterKeyDeriveParams {
    #[must_use]
    pub fn new(random_info: RandomDataParams) -> Self {
        Self {
            random_info,
            version: VersionParams::default(),
        }
    }

    #[must_use]
    pub const fn random_info(&self) -> &RandomDataParams {
        &self.random_info
    }

    /// The version reported by the last derivation.
    #[must_use]
    pub const fn version(&self) -> VersionParams {
        self.version
    }
}

/// `CK_TLS12_MASTER_KEY_DERIVE_PARAMS`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tls12MasterKeyDeriveParams {
    pub(crate) random_info: RandomDataParams,
    pub(crate) version: VersionParams,
    pub(crate) prf_hash_mechanism: CK_MECHANISM_TYPE,
}

impl Tls12MasterKeyDeriveParams {
    #[must_use]
    pub fn new(random_info: RandomDataParams, prf_hash_mechanism: CK_MECHANISM_TYPE) -> Self {
        Self {
            random_info,
            version: VersionParams::default(),
            prf_hash_mechanism,
        }
    }

    #[must_use]
    pub const fn random_info(&self) -> &RandomDataParams {
        &self.random_info
    }

    #[must_use]
    pub const fn version(&self) -> VersionParams {
        self.version
    }

    #[must_use]
    pub const fn prf_hash_mechanism(&self) -> CK_MECHANISM_TYPE {
        self.prf_hash_mechanism
    }
}

/// `CK_SSL3_KEY_MAT_OUT`: the keys and IVs returned by a key-and-MAC
/// derivation. The IV buffers are supplied by the caller and filled in place.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct KeyMaterialOut {
    pub(crate) client_mac_secret: Option<CK_OBJECT_HANDLE>,
    pub(crate) server_mac_secret: Option<CK_OBJECT_HANDLE>,
    pub(crate) client_key: Option<CK_OBJECT_HANDLE>,
    pub(crate) server_key: Option<CK_OBJECT_HANDLE>,
    pub(crate) client_iv: Vec<u8>,
    pub(crate) server_iv: Vec<u8>,
}

impl KeyMaterialOut {
    /// Zero-filled IV buffers of `iv_len` bytes each.
    #[must_use]
    pub fn with_iv_len(iv_len: usize) -> Self {
        Self::with_iv_buffers(vec![0; iv_len], vec![0; iv_len])
    }

    #[must_use]
    pub fn with_iv_buffers(client_iv: Vec<u8>, server_iv: Vec<u8>) -> Self {
        Self {
            client_iv,
            server_iv,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn client_mac_secret(&self) -> Option<CK_OBJECT_HANDLE> {
        self.client_mac_secret
    }

    #[must_use]
    pub const fn server_mac_secret(&self) -> Option<CK_OBJECT_HANDLE> {
        self.server_mac_secret
    }

    #[must_use]
    pub const fn client_key(&self) -> Option<CK_OBJECT_HANDLE> {
        self.client_key
    }

    #[must_use]
    pub const fn server_key(&self) -> Option<CK_OBJECT_HANDLE> {
        self.server_key
    }

    #[must_use]
    pub fn client_iv(&self) -> &[u8] {
        &self.client_iv
    }

    #[must_use]
    pub fn server_iv(&self) -> &[u8] {
        &self.server_iv
    }

    fn check_iv_buffers(&self, iv_size_bits: u64) -> HResult<()> {
        if iv_size_bits % 8 != 0 {
            return Err(HError::InvalidParameterLength {
                field: "IV size in bits",
                expected: usize::try_from(iv_size_bits.next_multiple_of(8))?,
                actual: usize::try_from(iv_size_bits)?,
            });
        }
        let expected = usize::try_from(iv_size_bits / 8)?;
        for (field, buffer) in [
            ("client IV buffer", &self.client_iv),
            ("server IV buffer", &self.server_iv),
        ] {
            if buffer.len() != expected {
                return Err(HError::InvalidParameterLength {
                    field,
                    expected,
                    actual: buffer.len(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for KeyMaterialOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterialOut")
            .field("client_mac_secret", &self.client_mac_secret)
            .field("server_mac_secret", &self.server_mac_secret)
            .field("client_key", &self.client_key)
            .field("server_key", &self.server_key)
            .field("client_iv", &BytesPreview(&self.client_iv))
            .field("server_iv", &BytesPreview(&self.server_iv))
            .finish()
    }
}

/// `CK_SSL3_KEY_MAT_PARAMS`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyMaterialParams {
    pub(crate) mac_size_bits: u64,
    pub(crate) key_size_bits: u64,
    pub(crate) iv_size_bits: u64,
    pub(crate) is_export: bool,
    pub(crate) random_info: RandomDataParams,
    pub(crate) returned: KeyMaterialOut,
}

impl KeyMaterialParams {
    /// The IV buffers of `returned` must hold exactly `iv_size_bits / 8` bytes.
    pub fn new(
        mac_size_bits: u64,
        key_size_bits: u64,
        iv_size_bits: u64,
        is_export: bool,
        random_info: RandomDataParams,
        returned: KeyMaterialOut,
    ) -> HResult<Self> {
        returned.check_iv_buffers(iv_size_bits)?;
        Ok(Self {
            mac_size_bits,
            key_size_bits,
            iv_size_bits,
            is_export,
            random_info,
            returned,
        })
    }

    #[must_use]
    pub const fn returned(&self) -> &KeyMaterialOut {
        &self.returned
    }

    #[must_use]
    pub const fn random_info(&self) -> &RandomDataParams {
        &self.random_info
    }
}

/// `CK_TLS12_KEY_MAT_PARAMS`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tls12KeyMaterialParams {
    pub(crate) mac_size_bits: u64,
    pub(crate) key_size_bits: u64,
    pub(crate) iv_size_bits: u64,
    pub(crate) is_export: bool,
    pub(crate) random_info: RandomDataParams,
    pub(crate) returned: KeyMaterialOut,
    pub(crate) prf_hash_mechanism: CK_MECHANISM_TYPE,
}

impl Tls12KeyMaterialParams {
    pub fn new(
        mac_size_bits: u64,
        key_size_bits: u64,
        iv_size_bits: u64,
        random_info: RandomDataParams,
        returned: KeyMaterialOut,
        prf_hash_mechanism: CK_MECHANISM_TYPE,
    ) -> HResult<Self> {
        returned.check_iv_buffers(iv_size_bits)?;
        Ok(Self {
            mac_size_bits,
            key_size_bits,
            iv_size_bits,
            is_export: false,
            random_info,
            returned,
            prf_hash_mechanism,
        })
    }

    #[must_use]
    pub const fn returned(&self) -> &KeyMaterialOut {
        &self.returned
    }

    #[must_use]
    pub const fn prf_hash_mechanism(&self) -> CK_MECHANISM_TYPE {
        self.prf_hash_mechanism
    }
}

/// A bare initialization vector, for the CBC/OFB/CFB modes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct IvParams {
    pub(crate) iv: Vec<u8>,
}

impl IvParams {
    #[must_use]
    pub const fn new(iv: Vec<u8>) -> Self {
        Self { iv }
    }

    #[must_use]
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }
}

impl fmt::Debug for IvParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IvParams")
            .field("iv", &BytesPreview(&self.iv))
            .finish()
    }
}

/// `CK_DES_CBC_ENCRYPT_DATA_PARAMS` or `CK_AES_CBC_ENCRYPT_DATA_PARAMS`,
/// selected by the IV length (8 or 16 bytes).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CbcEncryptDataParams {
    pub(crate) iv: Vec<u8>,
    pub(crate) data: Vec<u8>,
}

impl CbcEncryptDataParams {
    pub fn new(iv: Vec<u8>, data: Vec<u8>) -> HResult<Self> {
        if iv.len() != 8 && iv.len() != 16 {
            return Err(HError::InvalidParameterLength {
                field: "CBC encrypt data IV",
                expected: 16,
                actual: iv.len(),
            });
        }
        Ok(Self { iv, data })
    }

    #[must_use]
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for CbcEncryptDataParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CbcEncryptDataParams")
            .field("iv", &BytesPreview(&self.iv))
            .field("data", &BytesPreview(&self.data))
            .finish()
    }
}

/// `CK_RSA_PKCS_OAEP_PARAMS`; a source label, when present, uses `CKZ_DATA_SPECIFIED`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RsaOaepParams {
    pub(crate) hash: CK_MECHANISM_TYPE,
    pub(crate) mgf: CK_RSA_PKCS_MGF_TYPE,
    pub(crate) source_data: Option<Vec<u8>>,
}

impl RsaOaepParams {
    #[must_use]
    pub const fn new(
        hash: CK_MECHANISM_TYPE,
        mgf: CK_RSA_PKCS_MGF_TYPE,
        source_data: Option<Vec<u8>>,
    ) -> Self {
        Self {
            hash,
            mgf,
            source_data,
        }
    }

    #[must_use]
    pub const fn hash(&self) -> CK_MECHANISM_TYPE {
        self.hash
    }

    #[must_use]
    pub const fn mgf(&self) -> CK_RSA_PKCS_MGF_TYPE {
        self.mgf
    }
}

impl fmt::Debug for RsaOaepParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaOaepParams")
            .field("hash", &super::mechanism_name(self.hash))
            .field("mgf", &self.mgf)
            .field("source_data", &self.source_data.as_deref().map(BytesPreview))
            .finish()
    }
}

/// `CK_RSA_PKCS_PSS_PARAMS`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RsaPssParams {
    pub(crate) hash: CK_MECHANISM_TYPE,
    pub(crate) mgf: CK_RSA_PKCS_MGF_TYPE,
    pub(crate) salt_length: u64,
}

impl RsaPssParams {
    #[must_use]
    pub const fn new(hash: CK_MECHANISM_TYPE, mgf: CK_RSA_PKCS_MGF_TYPE, salt_length: u64) -> Self {
        Self {
            hash,
            mgf,
            salt_length,
        }
    }
}

/// `CK_GCM_PARAMS`
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct GcmParams {
    pub(crate) iv: Vec<u8>,
    pub(crate) aad: Vec<u8>,
    pub(crate) tag_bits: u64,
}

impl GcmParams {
    pub fn new(iv: Vec<u8>, aad: Vec<u8>, tag_bits: u64) -> HResult<Self> {
        if tag_bits > 128 || tag_bits % 8 != 0 {
            return Err(HError::InvalidParameterLength {
                field: "GCM tag",
                expected: 16,
                actual: usize::try_from(tag_bits / 8)?,
            });
        }
        if iv.is_empty() {
            return Err(HError::InvalidParameterLength {
                field: "GCM IV",
                expected: 12,
                actual: 0,
            });
        }
        Ok(Self { iv, aad, tag_bits })
    }

    #[must_use]
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    #[must_use]
    pub fn aad(&self) -> &[u8] {
        &self.aad
    }

    #[must_use]
    pub const fn tag_bits(&self) -> u64 {
        self.tag_bits
    }
}

impl fmt::Debug for GcmParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcmParams")
            .field("iv", &BytesPreview(&self.iv))
            .field("aad", &BytesPreview(&self.aad))
            .field("tag_bits", &self.tag_bits)
            .finish()
    }
}

/// `CK_CCM_PARAMS`
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CcmParams {
    pub(crate) data_len: u64,
    pub(crate) nonce: Vec<u8>,
    pub(crate) aad: Vec<u8>,
    pub(crate) mac_len: u64,
}

impl CcmParams {
    /// Nonces are 7 to 13 bytes; MACs an even length from 4 to 16 bytes.
    pub fn new(data_len: u64, nonce: Vec<u8>, aad: Vec<u8>, mac_len: u64) -> HResult<Self> {
        if !(7..=13).contains(&nonce.len()) {
            return Err(HError::InvalidParameterLength {
                field: "CCM nonce",
                expected: nonce.len().clamp(7, 13),
                actual: nonce.len(),
            });
        }
        if !(4..=16).contains(&mac_len) || mac_len % 2 != 0 {
            return Err(HError::InvalidParameterLength {
                field: "CCM MAC",
                expected: usize::try_from(mac_len.clamp(4, 16) & !1)?,
                actual: usize::try_from(mac_len)?,
            });
        }
        Ok(Self {
            data_len,
            nonce,
            aad,
            mac_len,
        })
    }

    #[must_use]
    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    #[must_use]
    pub const fn mac_len(&self) -> u64 {
        self.mac_len
    }
}

impl fmt::Debug for CcmParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CcmParams")
            .field("data_len", &self.data_len)
            .field("nonce", &BytesPreview(&self.nonce))
            .field("aad", &BytesPreview(&self.aad))
            .field("mac_len", &self.mac_len)
            .finish()
    }
}

/// A typed parameter block, one variant per family.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParameterBlock {
    Version(VersionParams),
    RandomData(RandomDataParams),
    MasterKeyDerive(MasterKeyDeriveParams),
    Tls12MasterKeyDerive(Tls12MasterKeyDeriveParams),
    KeyMaterial(KeyMaterialParams),
    Tls12KeyMaterial(Tls12KeyMaterialParams),
    InitializationVector(IvParams),
    CbcEncryptData(CbcEncryptDataParams),
    RsaOaep(RsaOaepParams),
    RsaPss(RsaPssParams),
    Gcm(GcmParams),
    Ccm(CcmParams),
}

impl ParameterBlock {
    #[must_use]
    pub const fn family(&self) -> ParameterFamily {
        match self {
            Self::Version(_) => ParameterFamily::Version,
            Self::RandomData(_) => ParameterFamily::RandomData,
            Self::MasterKeyDerive(_) => ParameterFamily::MasterKeyDerive,
            Self::Tls12MasterKeyDerive(_) => ParameterFamily::Tls12MasterKeyDerive,
            Self::KeyMaterial(_) => ParameterFamily::KeyMaterial,
            Self::Tls12KeyMaterial(_) => ParameterFamily::Tls12KeyMaterial,
            Self::InitializationVector(_) => ParameterFamily::InitializationVector,
            Self::CbcEncryptData(_) => ParameterFamily::CbcEncryptData,
            Self::RsaOaep(_) => ParameterFamily::RsaOaep,
            Self::RsaPss(_) => ParameterFamily::RsaPss,
            Self::Gcm(_) => ParameterFamily::Gcm,
            Self::Ccm(_) => ParameterFamily::Ccm,
        }
    }

    /// The key material returned by a key-and-MAC derivation, if this block carries one.
    #[must_use]
    pub const fn returned_key_material(&self) -> Option<&KeyMaterialOut> {
        match self {
            Self::KeyMaterial(p) => Some(&p.returned),
            Self::Tls12KeyMaterial(p) => Some(&p.returned),
            _ => None,
        }
    }

    /// The version written back by a master key derivation.
    #[must_use]
    pub const fn negotiated_version(&self) -> Option<VersionParams> {
        match self {
            Self::MasterKeyDerive(p) => Some(p.version),
            Self::Tls12MasterKeyDerive(p) => Some(p.version),
            _ => None,
        }
    }
}
