//! Scenario tests driving a [`Session`] against an in-process software token.

use std::sync::Arc;

use cosmian_logger::log_init;
use pkcs11_sys::{
    CK_SESSION_HANDLE, CKA_DECRYPT, CKA_ENCRYPT, CKA_LABEL, CKA_SENSITIVE, CKA_SIGN, CKA_VALUE,
    CKA_VERIFY, CKM_AES_CBC_PAD,
};
use rand::{TryRngCore, rngs::OsRng};

use crate::{
    AttributeValue, HError, HResult, HsmCapabilities, IvParams, Mechanism, Object, ObjectVariant,
    ParameterBlock, SecretKeyType, Session,
};

mod streaming;

use soft_token::SoftToken;

const SESSION_HANDLE: CK_SESSION_HANDLE = 7;

fn session_with(capabilities: HsmCapabilities) -> (Arc<SoftToken>, Session) {
    log_init(None);
    let token = Arc::new(SoftToken::new());
    let session = Session::new(token.clone(), SESSION_HANDLE, 0, capabilities);
    (token, session)
}

fn random_bytes<const T: usize>() -> HResult<[u8; T]> {
    let mut bytes = [0_u8; T];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| HError::Default(format!("Error generating random data: {e}")))?;
    Ok(bytes)
}

/// A sensitive AES key created from known key bytes.
fn aes_key(session: &Session, value: &[u8]) -> HResult<Object> {
    let template = Object::new(ObjectVariant::SecretKey(SecretKeyType::Aes))?
        .with(CKA_LABEL, AttributeValue::Bytes(b"test key".to_vec()))?
        .with(CKA_VALUE, AttributeValue::Bytes(value.to_vec()))?
        .with(CKA_SENSITIVE, AttributeValue::Bool(true))?
        .with(CKA_ENCRYPT, AttributeValue::Bool(true))?
        .with(CKA_DECRYPT, AttributeValue::Bool(true))?
        .with(CKA_SIGN, AttributeValue::Bool(true))?
        .with(CKA_VERIFY, AttributeValue::Bool(true))?;
    session.create_object(&template)
}

fn cbc(iv: [u8; 16]) -> Mechanism {
    Mechanism::with_parameters(
        CKM_AES_CBC_PAD,
        ParameterBlock::InitializationVector(IvParams::new(iv.to_vec())),
    )
}
