//! Copyright 2024 Cosmian Tech SAS
//!
//! Typed access to a PKCS#11 token's object store and cryptographic engine.
//!
//! The crate marshals strongly-typed objects, attributes and mechanism
//! parameters to and from the native PKCS#11 binary layouts, and drives the
//! multi-part init/update/final operations. The native call boundary itself
//! is abstracted behind [`TokenBackend`]: this crate never performs a
//! `C_*` call directly.

mod error;

pub use attribute::{
    Attribute, AttributeKind, AttributeState, AttributeValue, WireAttribute, WireValue,
    attribute_name,
};
pub use backend::{AttributeReadout, RawValue, TokenBackend};
pub use error::{HError, HResult, ckr_name, render_status};
pub use hsm_capabilities::{DefaultCapabilityProvider, HsmCapabilities, HsmProvider};
pub use info::{
    Counter, MechanismInfo, ModuleInfo, SessionInfo, SessionState, TokenInfo, Version,
};
pub use mechanism::{
    HostCapabilities, Mechanism, NativeParams, ParameterExpectation, ParameterFamily,
    WireMechanism, expected_parameters, mechanism_name,
    parameters::{
        CbcEncryptDataParams, CcmParams, GcmParams, IvParams, KeyMaterialOut, KeyMaterialParams,
        MasterKeyDeriveParams, ParameterBlock, RandomDataParams, RsaOaepParams, RsaPssParams,
        Tls12KeyMaterialParams, Tls12MasterKeyDeriveParams, VersionParams,
    },
};
pub use object::{
    AsymmetricKeyType, CertificateType, DomainParameterType, HardwareFeatureType, KeyPair, Object,
    ObjectState, ObjectVariant, SecretKeyType,
};
pub use operation::{OperationContext, OperationKind, Phase};
pub use session::Session;

mod attribute;
mod backend;
mod hsm_capabilities;
mod info;
mod mechanism;
mod object;
mod operation;
mod preview;
mod session;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic_in_result_fn)]
mod tests;
