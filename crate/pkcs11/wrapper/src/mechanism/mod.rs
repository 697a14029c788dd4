//! Mechanisms and the checked pairing of mechanism ids with parameter blocks.

use std::fmt;

use cosmian_logger::debug;
use pkcs11_sys::*;

use crate::error::{HError, HResult};

mod host_runtime;
#[allow(non_snake_case)]
mod native;
pub mod parameters;

pub use host_runtime::HostCapabilities;
pub use native::{NativeParams, WireMechanism};
use parameters::ParameterBlock;

/// The families of mechanism parameter blocks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum ParameterFamily {
    Version,
    RandomData,
    MasterKeyDerive,
    Tls12MasterKeyDerive,
    KeyMaterial,
    Tls12KeyMaterial,
    InitializationVector,
    CbcEncryptData,
    RsaOaep,
    RsaPss,
    Gcm,
    Ccm,
}

impl ParameterFamily {
    /// Families whose native layout is only present in some host runtimes.
    #[must_use]
    pub const fn requires_host_runtime(self) -> bool {
        matches!(
            self,
            Self::Gcm | Self::Ccm | Self::Tls12MasterKeyDerive | Self::Tls12KeyMaterial
        )
    }
}

/// What a mechanism accepts as parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterExpectation {
    NoParameters,
    Family(ParameterFamily),
    /// Vendor-defined and unknown mechanisms: any block, or none
    Unchecked,
}

impl fmt::Display for ParameterExpectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoParameters => write!(f, "no parameters"),
            Self::Family(family) => write!(f, "{family} parameters"),
            Self::Unchecked => write!(f, "any parameters"),
        }
    }
}

pub(crate) fn family_label(family: Option<ParameterFamily>) -> String {
    family.map_or_else(|| "no parameters".to_owned(), |f| format!("{f} parameters"))
}

macro_rules! mechanism_table {
    ($($id:ident => $expectation:expr),+ $(,)?) => {
        fn lookup(mechanism: CK_MECHANISM_TYPE) -> Option<(&'static str, ParameterExpectation)> {
            #[allow(unused_imports)]
            use ParameterExpectation::{Family, NoParameters};
            #[allow(unused_imports)]
            use ParameterFamily::*;
            match mechanism {
                $($id => Some((stringify!($id), $expectation)),)+
                _ => None,
            }
        }
    };
}

mechanism_table! {
    CKM_RSA_PKCS_KEY_PAIR_GEN => NoParameters,
    CKM_RSA_PKCS => NoParameters,
    CKM_RSA_X_509 => NoParameters,
    CKM_SHA1_RSA_PKCS => NoParameters,
    CKM_SHA256_RSA_PKCS => NoParameters,
    CKM_SHA384_RSA_PKCS => NoParameters,
    CKM_SHA512_RSA_PKCS => NoParameters,
    CKM_RSA_PKCS_OAEP => Family(RsaOaep),
    CKM_RSA_PKCS_PSS => Family(RsaPss),
    CKM_SHA1_RSA_PKCS_PSS => Family(RsaPss),
    CKM_SHA256_RSA_PKCS_PSS => Family(RsaPss),
    CKM_SHA384_RSA_PKCS_PSS => Family(RsaPss),
    CKM_SHA512_RSA_PKCS_PSS => Family(RsaPss),
    CKM_DSA_KEY_PAIR_GEN => NoParameters,
    CKM_DSA => NoParameters,
    CKM_DH_PKCS_KEY_PAIR_GEN => NoParameters,
    CKM_EC_KEY_PAIR_GEN => NoParameters,
    CKM_ECDSA => NoParameters,
    CKM_ECDSA_SHA256 => NoParameters,
    CKM_GENERIC_SECRET_KEY_GEN => NoParameters,
    CKM_MD5 => NoParameters,
    CKM_SHA_1 => NoParameters,
    CKM_SHA256 => NoParameters,
    CKM_SHA384 => NoParameters,
    CKM_SHA512 => NoParameters,
    CKM_SHA_1_HMAC => NoParameters,
    CKM_SHA256_HMAC => NoParameters,
    CKM_DES_KEY_GEN => NoParameters,
    CKM_DES_ECB => NoParameters,
    CKM_DES_CBC => Family(InitializationVector),
    CKM_DES_CBC_PAD => Family(InitializationVector),
    CKM_DES3_KEY_GEN => NoParameters,
    CKM_DES3_ECB => NoParameters,
    CKM_DES3_CBC => Family(InitializationVector),
    CKM_DES3_CBC_PAD => Family(InitializationVector),
    CKM_AES_KEY_GEN => NoParameters,
    CKM_AES_ECB => NoParameters,
    CKM_AES_MAC => NoParameters,
    CKM_AES_CMAC => NoParameters,
    CKM_AES_CBC => Family(InitializationVector),
    CKM_AES_CBC_PAD => Family(InitializationVector),
    CKM_AES_OFB => Family(InitializationVector),
    CKM_AES_CFB128 => Family(InitializationVector),
    CKM_AES_GCM => Family(Gcm),
    CKM_AES_CCM => Family(Ccm),
    CKM_DES_CBC_ENCRYPT_DATA => Family(CbcEncryptData),
    CKM_DES3_CBC_ENCRYPT_DATA => Family(CbcEncryptData),
    CKM_AES_CBC_ENCRYPT_DATA => Family(CbcEncryptData),
    CKM_SSL3_PRE_MASTER_KEY_GEN => Family(Version),
    CKM_TLS_PRE_MASTER_KEY_GEN => Family(Version),
    CKM_SSL3_MASTER_KEY_DERIVE => Family(MasterKeyDerive),
    CKM_TLS_MASTER_KEY_DERIVE => Family(MasterKeyDerive),
    CKM_SSL3_KEY_AND_MAC_DERIVE => Family(KeyMaterial),
    CKM_TLS_KEY_AND_MAC_DERIVE => Family(KeyMaterial),
    CKM_TLS12_MASTER_KEY_DERIVE => Family(Tls12MasterKeyDerive),
    CKM_TLS12_KEY_AND_MAC_DERIVE => Family(Tls12KeyMaterial),
}

/// The parameter family a mechanism id accepts.
#[must_use]
pub fn expected_parameters(mechanism: CK_MECHANISM_TYPE) -> ParameterExpectation {
    lookup(mechanism).map_or(ParameterExpectation::Unchecked, |(_, e)| e)
}

/// The printable `CKM_*` name of a mechanism id.
#[must_use]
pub fn mechanism_name(mechanism: CK_MECHANISM_TYPE) -> String {
    lookup(mechanism).map_or_else(
        || {
            if mechanism & CKM_VENDOR_DEFINED == CKM_VENDOR_DEFINED {
                format!("CKM_VENDOR_DEFINED+{:#x}", mechanism & !CKM_VENDOR_DEFINED)
            } else {
                format!("{mechanism:#x}")
            }
        },
        |(name, _)| name.to_owned(),
    )
}

/// A mechanism id with its optional parameter block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mechanism {
    id: CK_MECHANISM_TYPE,
    parameters: Option<ParameterBlock>,
}

impl Mechanism {
    #[must_use]
    pub const fn new(id: CK_MECHANISM_TYPE) -> Self {
        Self {
            id,
            parameters: None,
        }
    }

    #[must_use]
    pub const fn with_parameters(id: CK_MECHANISM_TYPE, parameters: ParameterBlock) -> Self {
        Self {
            id,
            parameters: Some(parameters),
        }
    }

    #[must_use]
    pub const fn id(&self) -> CK_MECHANISM_TYPE {
        self.id
    }

    #[must_use]
    pub const fn parameters(&self) -> Option<&ParameterBlock> {
        self.parameters.as_ref()
    }

    /// Check the parameter block against the family the mechanism expects.
    pub fn validate(&self) -> HResult<()> {
        let actual = self.parameters.as_ref().map(ParameterBlock::family);
        let expected = expected_parameters(self.id);
        let consistent = match expected {
            ParameterExpectation::Unchecked => true,
            ParameterExpectation::NoParameters => actual.is_none(),
            ParameterExpectation::Family(family) => actual == Some(family),
        };
        if consistent {
            Ok(())
        } else {
            Err(HError::ParameterMismatch {
                mechanism: self.id,
                expected,
                actual,
            })
        }
    }

    /// Marshal to the native layout with the process-wide host capabilities.
    ///
    /// The returned mechanism borrows the parameter buffers; output fields
    /// written by the token are reflected back on [`WireMechanism::complete`].
    pub fn to_native(&mut self) -> HResult<WireMechanism<'_>> {
        self.to_native_with(HostCapabilities::process())
    }

    pub fn to_native_with<'a>(
        &'a mut self,
        host: &HostCapabilities,
    ) -> HResult<WireMechanism<'a>> {
        self.validate()?;
        debug!("marshalling {}", self);
        let params = match self.parameters.as_mut() {
            None => NativeParams::None,
            Some(block) => host.build(block)?,
        };
        Ok(WireMechanism::new(self.id, params))
    }
}

impl From<CK_MECHANISM_TYPE> for Mechanism {
    fn from(id: CK_MECHANISM_TYPE) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.parameters {
            None => write!(f, "{}", mechanism_name(self.id)),
            Some(block) => write!(f, "{} ({block:?})", mechanism_name(self.id)),
        }
    }
}
