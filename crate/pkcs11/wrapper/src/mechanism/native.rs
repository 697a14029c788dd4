//! Native `CK_MECHANISM` layouts.
//!
//! A [`WireMechanism`] mutably borrows the parameter block it was built from:
//! the native structures point straight into the block's buffers, so the
//! token can fill output buffers in place and the block cannot be touched
//! while the call is in flight.

use std::{ffi::c_void, fmt, marker::PhantomData, mem::size_of, ptr};

use pkcs11_sys::*;

use super::{
    ParameterFamily,
    parameters::{
        CbcEncryptDataParams, CcmParams, GcmParams, KeyMaterialOut, ParameterBlock,
        RandomDataParams, RsaOaepParams, RsaPssParams, VersionParams,
    },
};
use crate::error::{HError, HResult};

/// Native parameter storage. Structures are boxed so that their addresses,
/// and the addresses of the output structures they point to, stay put when
/// the enclosing mechanism moves.
pub enum NativeParams<'a> {
    None,
    Version(Box<CK_VERSION>),
    Bytes(&'a mut [u8]),
    RandomData(Box<CK_SSL3_RANDOM_DATA>, PhantomData<&'a mut [u8]>),
    MasterKeyDerive {
        raw: Box<CK_SSL3_MASTER_KEY_DERIVE_PARAMS>,
        version: Box<CK_VERSION>,
        out: &'a mut VersionParams,
    },
    Tls12MasterKeyDerive {
        raw: Box<CK_TLS12_MASTER_KEY_DERIVE_PARAMS>,
        version: Box<CK_VERSION>,
        out: &'a mut VersionParams,
    },
    KeyMaterial {
        raw: Box<CK_SSL3_KEY_MAT_PARAMS>,
        returned: Box<CK_SSL3_KEY_MAT_OUT>,
        out: &'a mut KeyMaterialOut,
    },
    Tls12KeyMaterial {
        raw: Box<CK_TLS12_KEY_MAT_PARAMS>,
        returned: Box<CK_SSL3_KEY_MAT_OUT>,
        out: &'a mut KeyMaterialOut,
    },
    DesCbcEncryptData(Box<CK_DES_CBC_ENCRYPT_DATA_PARAMS>, PhantomData<&'a mut [u8]>),
    AesCbcEncryptData(Box<CK_AES_CBC_ENCRYPT_DATA_PARAMS>, PhantomData<&'a mut [u8]>),
    RsaOaep(Box<CK_RSA_PKCS_OAEP_PARAMS>, PhantomData<&'a mut [u8]>),
    RsaPss(Box<CK_RSA_PKCS_PSS_PARAMS>),
    Gcm(Box<CK_GCM_PARAMS>, PhantomData<&'a mut [u8]>),
    Ccm(Box<CK_CCM_PARAMS>, PhantomData<&'a mut [u8]>),
}

impl NativeParams<'_> {
    /// Raw `pParameter` and `ulParameterLen`.
    fn raw_parts(&mut self) -> (*mut c_void, CK_ULONG) {
        fn boxed<T>(b: &mut Box<T>) -> (*mut c_void, CK_ULONG) {
            (ptr::from_mut::<T>(b).cast(), struct_len::<T>())
        }
        match self {
            Self::None => (ptr::null_mut(), 0),
            Self::Version(b) => boxed(b),
            Self::Bytes(bytes) => {
                // the length was checked against CK_ULONG when the parameters were built
                #[allow(clippy::cast_possible_truncation)]
                let len = bytes.len() as CK_ULONG;
                if len == 0 {
                    (ptr::null_mut(), 0)
                } else {
                    (bytes.as_mut_ptr().cast(), len)
                }
            }
            Self::RandomData(b, _) => boxed(b),
            Self::MasterKeyDerive { raw, .. } => boxed(raw),
            Self::Tls12MasterKeyDerive { raw, .. } => boxed(raw),
            Self::KeyMaterial { raw, .. } => boxed(raw),
            Self::Tls12KeyMaterial { raw, .. } => boxed(raw),
            Self::DesCbcEncryptData(b, _) => boxed(b),
            Self::AesCbcEncryptData(b, _) => boxed(b),
            Self::RsaOaep(b, _) => boxed(b),
            Self::RsaPss(b) => boxed(b),
            Self::Gcm(b, _) => boxed(b),
            Self::Ccm(b, _) => boxed(b),
        }
    }

    /// The raw bytes of an IV-style parameter.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    const fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Version(_) => "CK_VERSION",
            Self::Bytes(_) => "bytes",
            Self::RandomData(..) => "CK_SSL3_RANDOM_DATA",
            Self::MasterKeyDerive { .. } => "CK_SSL3_MASTER_KEY_DERIVE_PARAMS",
            Self::Tls12MasterKeyDerive { .. } => "CK_TLS12_MASTER_KEY_DERIVE_PARAMS",
            Self::KeyMaterial { .. } => "CK_SSL3_KEY_MAT_PARAMS",
            Self::Tls12KeyMaterial { .. } => "CK_TLS12_KEY_MAT_PARAMS",
            Self::DesCbcEncryptData(..) => "CK_DES_CBC_ENCRYPT_DATA_PARAMS",
            Self::AesCbcEncryptData(..) => "CK_AES_CBC_ENCRYPT_DATA_PARAMS",
            Self::RsaOaep(..) => "CK_RSA_PKCS_OAEP_PARAMS",
            Self::RsaPss(_) => "CK_RSA_PKCS_PSS_PARAMS",
            Self::Gcm(..) => "CK_GCM_PARAMS",
            Self::Ccm(..) => "CK_CCM_PARAMS",
        }
    }
}

impl fmt::Debug for NativeParams<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A mechanism in its native form, ready to hand to the token.
#[derive(Debug)]
pub struct WireMechanism<'a> {
    mechanism: CK_MECHANISM_TYPE,
    params: NativeParams<'a>,
}

impl<'a> WireMechanism<'a> {
    pub(crate) const fn new(mechanism: CK_MECHANISM_TYPE, params: NativeParams<'a>) -> Self {
        Self { mechanism, params }
    }

    #[must_use]
    pub const fn mechanism_type(&self) -> CK_MECHANISM_TYPE {
        self.mechanism
    }

    #[must_use]
    pub const fn params(&self) -> &NativeParams<'a> {
        &self.params
    }

    /// The `CK_MECHANISM` to pass across the native boundary.
    /// Its pointers are valid for as long as `self` is neither moved out of nor dropped.
    pub fn as_raw(&mut self) -> CK_MECHANISM {
        let (pParameter, ulParameterLen) = self.params.raw_parts();
        CK_MECHANISM {
            mechanism: self.mechanism,
            pParameter,
            ulParameterLen,
        }
    }

    /// Copy what the token wrote into the native output structures back to
    /// the parameter block. IV buffers are filled in place and need no copy.
    pub(crate) fn complete(self) {
        match self.params {
            NativeParams::MasterKeyDerive { version, out, .. }
            | NativeParams::Tls12MasterKeyDerive { version, out, .. } => {
                *out = VersionParams::new(version.major, version.minor);
            }
            NativeParams::KeyMaterial { returned, out, .. }
            | NativeParams::Tls12KeyMaterial { returned, out, .. } => {
                out.client_mac_secret = live_handle(returned.hClientMacSecret);
                out.server_mac_secret = live_handle(returned.hServerMacSecret);
                out.client_key = live_handle(returned.hClientKey);
                out.server_key = live_handle(returned.hServerKey);
            }
            _ => {}
        }
    }
}

const fn live_handle(handle: CK_OBJECT_HANDLE) -> Option<CK_OBJECT_HANDLE> {
    if handle == CK_INVALID_HANDLE {
        None
    } else {
        Some(handle)
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn struct_len<T>() -> CK_ULONG {
    size_of::<T>() as CK_ULONG
}

/// Pointer and length of a buffer; empty buffers are passed as NULL.
fn buffer(bytes: &mut [u8]) -> HResult<(CK_BYTE_PTR, CK_ULONG)> {
    let len = CK_ULONG::try_from(bytes.len())?;
    Ok(if len == 0 {
        (ptr::null_mut(), 0)
    } else {
        (bytes.as_mut_ptr(), len)
    })
}

fn random_data(random: &mut RandomDataParams) -> HResult<CK_SSL3_RANDOM_DATA> {
    let (pClientRandom, ulClientRandomLen) = buffer(&mut random.client_random)?;
    let (pServerRandom, ulServerRandomLen) = buffer(&mut random.server_random)?;
    Ok(CK_SSL3_RANDOM_DATA {
        pClientRandom,
        ulClientRandomLen,
        pServerRandom,
        ulServerRandomLen,
    })
}

fn key_mat_out(out: &mut KeyMaterialOut) -> HResult<Box<CK_SSL3_KEY_MAT_OUT>> {
    let (pIVClient, _) = buffer(&mut out.client_iv)?;
    let (pIVServer, _) = buffer(&mut out.server_iv)?;
    Ok(Box::new(CK_SSL3_KEY_MAT_OUT {
        hClientMacSecret: CK_INVALID_HANDLE,
        hServerMacSecret: CK_INVALID_HANDLE,
        hClientKey: CK_INVALID_HANDLE,
        hServerKey: CK_INVALID_HANDLE,
        pIVClient,
        pIVServer,
    }))
}

fn bbool(value: bool) -> CK_BBOOL {
    CK_BBOOL::from(value)
}

fn wrong_builder(layout: &str, family: ParameterFamily) -> HError {
    HError::Default(format!("{layout} layout requested for {family} parameters"))
}

/// Layouts present in every runtime.
pub(super) fn build_portable(block: &mut ParameterBlock) -> HResult<NativeParams<'_>> {
    let family = block.family();
    Ok(match block {
        ParameterBlock::Version(v) => NativeParams::Version(Box::new(CK_VERSION {
            major: v.major,
            minor: v.minor,
        })),
        ParameterBlock::RandomData(random) => {
            NativeParams::RandomData(Box::new(random_data(random)?), PhantomData)
        }
        ParameterBlock::MasterKeyDerive(p) => {
            let mut version = Box::new(CK_VERSION::default());
            let raw = Box::new(CK_SSL3_MASTER_KEY_DERIVE_PARAMS {
                RandomInfo: random_data(&mut p.random_info)?,
                pVersion: ptr::from_mut::<CK_VERSION>(&mut version),
            });
            NativeParams::MasterKeyDerive {
                raw,
                version,
                out: &mut p.version,
            }
        }
        ParameterBlock::KeyMaterial(p) => {
            let mut returned = key_mat_out(&mut p.returned)?;
            let raw = Box::new(CK_SSL3_KEY_MAT_PARAMS {
                ulMacSizeInBits: CK_ULONG::try_from(p.mac_size_bits)?,
                ulKeySizeInBits: CK_ULONG::try_from(p.key_size_bits)?,
                ulIVSizeInBits: CK_ULONG::try_from(p.iv_size_bits)?,
                bIsExport: bbool(p.is_export),
                RandomInfo: random_data(&mut p.random_info)?,
                pReturnedKeyMaterial: ptr::from_mut::<CK_SSL3_KEY_MAT_OUT>(&mut returned),
            });
            NativeParams::KeyMaterial {
                raw,
                returned,
                out: &mut p.returned,
            }
        }
        ParameterBlock::InitializationVector(p) => {
            CK_ULONG::try_from(p.iv.len())?;
            NativeParams::Bytes(&mut p.iv)
        }
        ParameterBlock::CbcEncryptData(p) => build_cbc_encrypt_data(p)?,
        ParameterBlock::RsaOaep(p) => build_rsa_oaep(p)?,
        ParameterBlock::RsaPss(p) => build_rsa_pss(p)?,
        ParameterBlock::Tls12MasterKeyDerive(_)
        | ParameterBlock::Tls12KeyMaterial(_)
        | ParameterBlock::Gcm(_)
        | ParameterBlock::Ccm(_) => return Err(wrong_builder("portable", family)),
    })
}

fn build_cbc_encrypt_data(p: &mut CbcEncryptDataParams) -> HResult<NativeParams<'_>> {
    let (pData, length) = buffer(&mut p.data)?;
    Ok(match p.iv.len() {
        8 => NativeParams::DesCbcEncryptData(
            Box::new(CK_DES_CBC_ENCRYPT_DATA_PARAMS {
                iv: p.iv.as_slice().try_into()?,
                pData,
                length,
            }),
            PhantomData,
        ),
        16 => NativeParams::AesCbcEncryptData(
            Box::new(CK_AES_CBC_ENCRYPT_DATA_PARAMS {
                iv: p.iv.as_slice().try_into()?,
                pData,
                length,
            }),
            PhantomData,
        ),
        other => {
            return Err(HError::InvalidParameterLength {
                field: "CBC encrypt data IV",
                expected: 16,
                actual: other,
            });
        }
    })
}

fn build_rsa_oaep(p: &mut RsaOaepParams) -> HResult<NativeParams<'_>> {
    let (source, pSourceData, ulSourceDataLen) = match p.source_data.as_mut() {
        Some(label) => {
            let (data, len) = buffer(label)?;
            (CKZ_DATA_SPECIFIED, data.cast::<c_void>(), len)
        }
        None => (0, ptr::null_mut(), 0),
    };
    Ok(NativeParams::RsaOaep(
        Box::new(CK_RSA_PKCS_OAEP_PARAMS {
            hashAlg: p.hash,
            mgf: p.mgf,
            source,
            pSourceData,
            ulSourceDataLen,
        }),
        PhantomData,
    ))
}

fn build_rsa_pss(p: &RsaPssParams) -> HResult<NativeParams<'static>> {
    Ok(NativeParams::RsaPss(Box::new(CK_RSA_PKCS_PSS_PARAMS {
        hashAlg: p.hash,
        mgf: p.mgf,
        sLen: CK_ULONG::try_from(p.salt_length)?,
    })))
}

pub(super) fn build_gcm(block: &mut ParameterBlock) -> HResult<NativeParams<'_>> {
    let family = block.family();
    let ParameterBlock::Gcm(GcmParams { iv, aad, tag_bits }) = block else {
        return Err(wrong_builder("GCM", family));
    };
    let iv_bits = CK_ULONG::try_from(iv.len() * 8)?;
    let (pIv, ulIvLen) = buffer(iv)?;
    let (pAAD, ulAADLen) = buffer(aad)?;
    Ok(NativeParams::Gcm(
        Box::new(CK_GCM_PARAMS {
            pIv,
            ulIvLen,
            ulIvBits: iv_bits,
            pAAD,
            ulAADLen,
            ulTagBits: CK_ULONG::try_from(*tag_bits)?,
        }),
        PhantomData,
    ))
}

pub(super) fn build_ccm(block: &mut ParameterBlock) -> HResult<NativeParams<'_>> {
    let family = block.family();
    let ParameterBlock::Ccm(CcmParams {
        data_len,
        nonce,
        aad,
        mac_len,
    }) = block
    else {
        return Err(wrong_builder("CCM", family));
    };
    let (pNonce, ulNonceLen) = buffer(nonce)?;
    let (pAAD, ulAADLen) = buffer(aad)?;
    Ok(NativeParams::Ccm(
        Box::new(CK_CCM_PARAMS {
            ulDataLen: CK_ULONG::try_from(*data_len)?,
            pNonce,
            ulNonceLen,
            pAAD,
            ulAADLen,
            ulMACLen: CK_ULONG::try_from(*mac_len)?,
        }),
        PhantomData,
    ))
}

pub(super) fn build_tls12_master_key_derive(
    block: &mut ParameterBlock,
) -> HResult<NativeParams<'_>> {
    let family = block.family();
    let ParameterBlock::Tls12MasterKeyDerive(p) = block else {
        return Err(wrong_builder("TLS 1.2 master key derive", family));
    };
    let mut version = Box::new(CK_VERSION::default());
    let raw = Box::new(CK_TLS12_MASTER_KEY_DERIVE_PARAMS {
        RandomInfo: random_data(&mut p.random_info)?,
        pVersion: ptr::from_mut::<CK_VERSION>(&mut version),
        prfHashMechanism: p.prf_hash_mechanism,
    });
    Ok(NativeParams::Tls12MasterKeyDerive {
        raw,
        version,
        out: &mut p.version,
    })
}

pub(super) fn build_tls12_key_material(block: &mut ParameterBlock) -> HResult<NativeParams<'_>> {
    let family = block.family();
    let ParameterBlock::Tls12KeyMaterial(p) = block else {
        return Err(wrong_builder("TLS 1.2 key material", family));
    };
    let mut returned = key_mat_out(&mut p.returned)?;
    let raw = Box::new(CK_TLS12_KEY_MAT_PARAMS {
        ulMacSizeInBits: CK_ULONG::try_from(p.mac_size_bits)?,
        ulKeySizeInBits: CK_ULONG::try_from(p.key_size_bits)?,
        ulIVSizeInBits: CK_ULONG::try_from(p.iv_size_bits)?,
        bIsExport: bbool(p.is_export),
        RandomInfo: random_data(&mut p.random_info)?,
        pReturnedKeyMaterial: ptr::from_mut::<CK_SSL3_KEY_MAT_OUT>(&mut returned),
        prfHashMechanism: p.prf_hash_mechanism,
    });
    Ok(NativeParams::Tls12KeyMaterial {
        raw,
        returned,
        out: &mut p.returned,
    })
}

#[cfg(test)]
mod tests {
    use super::{super::parameters::*, *};

    #[test]
    fn iv_points_into_the_block() {
        let mut block = ParameterBlock::InitializationVector(IvParams::new(vec![7; 16]));
        let mut wire = WireMechanism::new(CKM_AES_CBC_PAD, build_portable(&mut block).unwrap());
        let raw = wire.as_raw();
        assert_eq!(raw.mechanism, CKM_AES_CBC_PAD);
        assert_eq!(raw.ulParameterLen, 16);
        assert_eq!(wire.params().as_bytes(), Some(&[7_u8; 16][..]));
    }

    #[test]
    fn gcm_layout() {
        let mut block =
            ParameterBlock::Gcm(GcmParams::new(vec![1; 12], vec![2; 20], 128).unwrap());
        let mut wire = WireMechanism::new(CKM_AES_GCM, build_gcm(&mut block).unwrap());
        let raw = wire.as_raw();
        assert_eq!(raw.ulParameterLen, struct_len::<CK_GCM_PARAMS>());
        let NativeParams::Gcm(params, _) = wire.params() else {
            panic!("GCM layout expected");
        };
        assert_eq!(params.ulIvLen, 12);
        assert_eq!(params.ulIvBits, 96);
        assert_eq!(params.ulAADLen, 20);
        assert_eq!(params.ulTagBits, 128);
    }

    #[test]
    fn empty_buffers_are_null() {
        let mut block =
            ParameterBlock::Gcm(GcmParams::new(vec![1; 12], Vec::new(), 96).unwrap());
        let wire = WireMechanism::new(CKM_AES_GCM, build_gcm(&mut block).unwrap());
        let NativeParams::Gcm(params, _) = wire.params() else {
            panic!("GCM layout expected");
        };
        assert!(params.pAAD.is_null());
        assert_eq!(params.ulAADLen, 0);
    }

    #[test]
    fn cbc_encrypt_data_layout_follows_iv_length() {
        let mut des = ParameterBlock::CbcEncryptData(
            CbcEncryptDataParams::new(vec![0; 8], vec![1; 24]).unwrap(),
        );
        assert!(matches!(
            build_portable(&mut des).unwrap(),
            NativeParams::DesCbcEncryptData(..)
        ));
        let mut aes = ParameterBlock::CbcEncryptData(
            CbcEncryptDataParams::new(vec![0; 16], vec![1; 32]).unwrap(),
        );
        assert!(matches!(
            build_portable(&mut aes).unwrap(),
            NativeParams::AesCbcEncryptData(..)
        ));
    }

    #[test]
    fn master_key_version_is_reflected() {
        let mut block = ParameterBlock::MasterKeyDerive(MasterKeyDeriveParams::new(
            RandomDataParams::new(vec![1; 32], vec![2; 32]).unwrap(),
        ));
        let mut wire = WireMechanism::new(CKM_TLS_MASTER_KEY_DERIVE, build_portable(&mut block).unwrap());
        let raw = wire.as_raw();
        // what a token does with the out-parameter
        unsafe {
            let params = raw.pParameter.cast::<CK_SSL3_MASTER_KEY_DERIVE_PARAMS>();
            (*(*params).pVersion).major = 3;
            (*(*params).pVersion).minor = 1;
        }
        wire.complete();
        assert_eq!(block.negotiated_version(), Some(VersionParams::new(3, 1)));
    }

    #[test]
    fn portable_builder_refuses_host_layouts() {
        let mut block =
            ParameterBlock::Gcm(GcmParams::new(vec![1; 12], Vec::new(), 96).unwrap());
        assert!(build_portable(&mut block).is_err());
    }
}
