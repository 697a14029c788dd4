use std::{
    array::TryFromSliceError, convert::Infallible, num::TryFromIntError, string::FromUtf8Error,
};

use pkcs11_sys::{CK_ATTRIBUTE_TYPE, CK_MECHANISM_TYPE, CK_OBJECT_CLASS, CK_OBJECT_HANDLE, CK_RV, CK_ULONG};
use thiserror::Error;

use crate::{
    attribute::attribute_name,
    mechanism::{ParameterExpectation, ParameterFamily, family_label, mechanism_name},
    operation::OperationKind,
};

mod ckr_names;

pub use ckr_names::{ckr_name, render_status};

pub type HResult<T> = Result<T, HError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HError {
    // The native boundary reported a non-success status; the code is kept verbatim
    #[error("PKCS#11 device status: {}", render_status(*.0))]
    DeviceStatus(CK_RV),

    #[error("unsupported object variant: class {class:#x}, subtype {subtype:?}")]
    UnsupportedObjectVariant {
        class: CK_OBJECT_CLASS,
        subtype: Option<CK_ULONG>,
    },

    #[error("the host runtime has no native layout for {0} parameters")]
    UnsupportedInHostRuntime(ParameterFamily),

    #[error("invalid length for {field}: expected {expected} bytes, got {actual}")]
    InvalidParameterLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error(
        "mechanism {} expects {expected}, got {}",
        mechanism_name(*.mechanism),
        family_label(*.actual)
    )]
    ParameterMismatch {
        mechanism: CK_MECHANISM_TYPE,
        expected: ParameterExpectation,
        actual: Option<ParameterFamily>,
    },

    #[error("a {0} operation is already active on this session")]
    OperationAlreadyActive(OperationKind),

    #[error("no {0} operation is active on this session")]
    OperationNotActive(OperationKind),

    #[error("attribute {} is unavailable on the token", attribute_name(*.0))]
    AttributeUnavailable(CK_ATTRIBUTE_TYPE),

    #[error("attribute {} carries no value", attribute_name(*.0))]
    AttributeNotSet(CK_ATTRIBUTE_TYPE),

    #[error("attribute {} identifies the object variant and cannot be changed", attribute_name(*.0))]
    ImmutableAttribute(CK_ATTRIBUTE_TYPE),

    #[error("attribute {} is not declared by {variant}", attribute_name(*.attribute))]
    UndeclaredAttribute {
        attribute: CK_ATTRIBUTE_TYPE,
        variant: String,
    },

    #[error("unknown attribute type {0:#x}")]
    UnknownAttributeType(CK_ATTRIBUTE_TYPE),

    #[error("attribute {} holds {expected:?} values", attribute_name(*.attribute))]
    AttributeKindMismatch {
        attribute: CK_ATTRIBUTE_TYPE,
        expected: crate::attribute::AttributeKind,
    },

    #[error("invalid native value for attribute {}: {reason}", attribute_name(*.attribute))]
    InvalidAttributeValue {
        attribute: CK_ATTRIBUTE_TYPE,
        reason: String,
    },

    #[error("object handle {0} refers to a destroyed object")]
    StaleObject(CK_OBJECT_HANDLE),

    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("{0}")]
    Default(String),
}

impl HError {
    /// Status code reported by the token, when the error came from the native boundary.
    #[must_use]
    pub const fn device_status(&self) -> Option<CK_RV> {
        match self {
            Self::DeviceStatus(rv) => Some(*rv),
            _ => None,
        }
    }
}

// `CK_ULONG` is `u64` on most targets, where the word conversions cannot fail
impl From<Infallible> for HError {
    fn from(e: Infallible) -> Self {
        match e {}
    }
}

impl From<TryFromIntError> for HError {
    fn from(e: TryFromIntError) -> Self {
        Self::Conversion(e.to_string())
    }
}

impl From<TryFromSliceError> for HError {
    fn from(e: TryFromSliceError) -> Self {
        Self::Conversion(e.to_string())
    }
}

impl From<FromUtf8Error> for HError {
    fn from(e: FromUtf8Error) -> Self {
        Self::Conversion(e.to_string())
    }
}

impl From<time::error::ComponentRange> for HError {
    fn from(e: time::error::ComponentRange) -> Self {
        Self::Conversion(e.to_string())
    }
}
