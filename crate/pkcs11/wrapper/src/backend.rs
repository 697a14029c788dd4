use std::fmt;

use pkcs11_sys::{
    CK_ATTRIBUTE_TYPE, CK_INFO, CK_MECHANISM_INFO, CK_MECHANISM_TYPE, CK_OBJECT_HANDLE, CK_RV,
    CK_SESSION_HANDLE, CK_SESSION_INFO, CK_SLOT_ID, CK_TOKEN_INFO, CK_ULONG,
};

use crate::{
    attribute::{WireAttribute, attribute_name},
    mechanism::WireMechanism,
    preview::BytesPreview,
    render_status,
};

/// What the token returned for one attribute of a batched read.
#[derive(Clone, PartialEq, Eq)]
pub enum RawValue {
    Bytes(Vec<u8>),
    Nested(Vec<WireAttribute>),
    /// No value was copied; only `ulValueLen` is known, possibly
    /// `CK_UNAVAILABLE_INFORMATION`.
    Length(CK_ULONG),
}

impl fmt::Debug for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&BytesPreview(bytes)).finish(),
            Self::Nested(attributes) => f.debug_tuple("Nested").field(attributes).finish(),
            Self::Length(length) => f.debug_tuple("Length").field(length).finish(),
        }
    }
}

/// Per-attribute result of `C_GetAttributeValue`.
#[derive(Clone, PartialEq, Eq)]
pub struct AttributeReadout {
    pub type_: CK_ATTRIBUTE_TYPE,
    pub status: CK_RV,
    pub value: RawValue,
}

impl fmt::Debug for AttributeReadout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeReadout")
            .field("type_", &attribute_name(self.type_))
            .field("status", &render_status(self.status))
            .field("value", &self.value)
            .finish()
    }
}

/// The native PKCS#11 call boundary.
///
/// Implementations perform the `C_*` calls of a loaded module. All methods
/// report failure with the raw `CKR_*` status; translating it is the
/// caller's business. Mechanisms are handed over already marshalled to
/// their native layout and stay valid for the duration of the call only.
pub trait TokenBackend: Send + Sync {
    /// Read several attributes of one object in a single call.
    /// The readouts are returned in request order.
    fn get_attribute_values(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        types: &[CK_ATTRIBUTE_TYPE],
    ) -> Result<Vec<AttributeReadout>, CK_RV>;

    fn create_object(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[WireAttribute],
    ) -> Result<CK_OBJECT_HANDLE, CK_RV>;

    fn generate_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &mut WireMechanism<'_>,
        template: &[WireAttribute],
    ) -> Result<CK_OBJECT_HANDLE, CK_RV>;

    fn generate_key_pair(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &mut WireMechanism<'_>,
        public_template: &[WireAttribute],
        private_template: &[WireAttribute],
    ) -> Result<(CK_OBJECT_HANDLE, CK_OBJECT_HANDLE), CK_RV>;

    /// Derive a key. Mechanisms such as the TLS key-and-MAC derivation
    /// return their keys through the mechanism parameters instead, in which
    /// case no handle is returned.
    fn derive_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &mut WireMechanism<'_>,
        base_key: CK_OBJECT_HANDLE,
        template: &[WireAttribute],
    ) -> Result<Option<CK_OBJECT_HANDLE>, CK_RV>;

    fn destroy_object(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> Result<(), CK_RV>;

    fn encrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &mut WireMechanism<'_>,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), CK_RV>;

    /// Returns the number of bytes written to `output`.
    fn encrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, CK_RV>;

    fn encrypt_final(&self, session: CK_SESSION_HANDLE, output: &mut [u8])
    -> Result<usize, CK_RV>;

    fn decrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &mut WireMechanism<'_>,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), CK_RV>;

    fn decrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, CK_RV>;

    fn decrypt_final(&self, session: CK_SESSION_HANDLE, output: &mut [u8])
    -> Result<usize, CK_RV>;

    fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &mut WireMechanism<'_>,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), CK_RV>;

    fn sign_update(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> Result<(), CK_RV>;

    fn sign_final(&self, session: CK_SESSION_HANDLE) -> Result<Vec<u8>, CK_RV>;

    fn verify_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &mut WireMechanism<'_>,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), CK_RV>;

    fn verify_update(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> Result<(), CK_RV>;

    fn verify_final(&self, session: CK_SESSION_HANDLE, signature: &[u8]) -> Result<(), CK_RV>;

    fn digest_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &mut WireMechanism<'_>,
    ) -> Result<(), CK_RV>;

    fn digest_update(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> Result<(), CK_RV>;

    fn digest_final(&self, session: CK_SESSION_HANDLE) -> Result<Vec<u8>, CK_RV>;

    fn get_session_info(&self, session: CK_SESSION_HANDLE) -> Result<CK_SESSION_INFO, CK_RV>;

    fn get_token_info(&self, slot: CK_SLOT_ID) -> Result<CK_TOKEN_INFO, CK_RV>;

    fn get_mechanism_info(
        &self,
        slot: CK_SLOT_ID,
        mechanism: CK_MECHANISM_TYPE,
    ) -> Result<CK_MECHANISM_INFO, CK_RV>;

    fn get_info(&self) -> Result<CK_INFO, CK_RV>;
}
