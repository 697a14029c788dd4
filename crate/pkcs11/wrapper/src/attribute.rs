//! Typed PKCS#11 attributes and their native byte encodings.
//!
//! Every attribute type this crate understands is listed once in a static
//! table giving its printable name and the kind of value it holds. The kind
//! drives both the native encoding of template values and the decoding of
//! values read back from a token.

use std::{collections::HashMap, fmt, mem::size_of};

use once_cell::sync::Lazy;
use pkcs11_sys::*;
use time::{Date, Month};

use crate::{
    error::{HError, HResult},
    preview::BytesPreview,
};

/// The shape of the value an attribute type holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    Bool,
    Ulong,
    Bytes,
    Date,
    MechanismArray,
    AttributeArray,
}

impl AttributeKind {
    /// Sequence kinds have a natural empty value, so a zero-length native
    /// value decodes to an empty sequence rather than to `Null`.
    const fn is_sequence(self) -> bool {
        matches!(
            self,
            Self::Bytes | Self::MechanismArray | Self::AttributeArray
        )
    }
}

struct AttributeDef {
    id: CK_ATTRIBUTE_TYPE,
    name: &'static str,
    kind: AttributeKind,
}

macro_rules! attribute_def {
    ($id:ident as $kind:ident) => {
        AttributeDef {
            id: $id,
            name: stringify!($id),
            kind: AttributeKind::$kind,
        }
    };
}

static ATTRIBUTE_DEFS: &[AttributeDef] = &[
    attribute_def!(CKA_CLASS as Ulong),
    attribute_def!(CKA_TOKEN as Bool),
    attribute_def!(CKA_PRIVATE as Bool),
    attribute_def!(CKA_LABEL as Bytes),
    attribute_def!(CKA_APPLICATION as Bytes),
    attribute_def!(CKA_VALUE as Bytes),
    attribute_def!(CKA_OBJECT_ID as Bytes),
    attribute_def!(CKA_CERTIFICATE_TYPE as Ulong),
    attribute_def!(CKA_ISSUER as Bytes),
    attribute_def!(CKA_SERIAL_NUMBER as Bytes),
    attribute_def!(CKA_TRUSTED as Bool),
    attribute_def!(CKA_CERTIFICATE_CATEGORY as Ulong),
    attribute_def!(CKA_JAVA_MIDP_SECURITY_DOMAIN as Ulong),
    attribute_def!(CKA_URL as Bytes),
    attribute_def!(CKA_HASH_OF_SUBJECT_PUBLIC_KEY as Bytes),
    attribute_def!(CKA_HASH_OF_ISSUER_PUBLIC_KEY as Bytes),
    attribute_def!(CKA_NAME_HASH_ALGORITHM as Ulong),
    attribute_def!(CKA_CHECK_VALUE as Bytes),
    attribute_def!(CKA_KEY_TYPE as Ulong),
    attribute_def!(CKA_SUBJECT as Bytes),
    attribute_def!(CKA_ID as Bytes),
    attribute_def!(CKA_SENSITIVE as Bool),
    attribute_def!(CKA_ENCRYPT as Bool),
    attribute_def!(CKA_DECRYPT as Bool),
    attribute_def!(CKA_WRAP as Bool),
    attribute_def!(CKA_UNWRAP as Bool),
    attribute_def!(CKA_SIGN as Bool),
    attribute_def!(CKA_SIGN_RECOVER as Bool),
    attribute_def!(CKA_VERIFY as Bool),
    attribute_def!(CKA_VERIFY_RECOVER as Bool),
    attribute_def!(CKA_DERIVE as Bool),
    attribute_def!(CKA_START_DATE as Date),
    attribute_def!(CKA_END_DATE as Date),
    attribute_def!(CKA_MODULUS as Bytes),
    attribute_def!(CKA_MODULUS_BITS as Ulong),
    attribute_def!(CKA_PUBLIC_EXPONENT as Bytes),
    attribute_def!(CKA_PRIVATE_EXPONENT as Bytes),
    attribute_def!(CKA_PRIME_1 as Bytes),
    attribute_def!(CKA_PRIME_2 as Bytes),
    attribute_def!(CKA_EXPONENT_1 as Bytes),
    attribute_def!(CKA_EXPONENT_2 as Bytes),
    attribute_def!(CKA_COEFFICIENT as Bytes),
    attribute_def!(CKA_PUBLIC_KEY_INFO as Bytes),
    attribute_def!(CKA_PRIME as Bytes),
    attribute_def!(CKA_SUBPRIME as Bytes),
    attribute_def!(CKA_BASE as Bytes),
    attribute_def!(CKA_PRIME_BITS as Ulong),
    attribute_def!(CKA_SUB_PRIME_BITS as Ulong),
    attribute_def!(CKA_VALUE_BITS as Ulong),
    attribute_def!(CKA_VALUE_LEN as Ulong),
    attribute_def!(CKA_EXTRACTABLE as Bool),
    attribute_def!(CKA_LOCAL as Bool),
    attribute_def!(CKA_NEVER_EXTRACTABLE as Bool),
    attribute_def!(CKA_ALWAYS_SENSITIVE as Bool),
    attribute_def!(CKA_KEY_GEN_MECHANISM as Ulong),
    attribute_def!(CKA_MODIFIABLE as Bool),
    attribute_def!(CKA_COPYABLE as Bool),
    attribute_def!(CKA_DESTROYABLE as Bool),
    attribute_def!(CKA_EC_PARAMS as Bytes),
    attribute_def!(CKA_EC_POINT as Bytes),
    attribute_def!(CKA_ALWAYS_AUTHENTICATE as Bool),
    attribute_def!(CKA_WRAP_WITH_TRUSTED as Bool),
    attribute_def!(CKA_WRAP_TEMPLATE as AttributeArray),
    attribute_def!(CKA_UNWRAP_TEMPLATE as AttributeArray),
    attribute_def!(CKA_DERIVE_TEMPLATE as AttributeArray),
    attribute_def!(CKA_HW_FEATURE_TYPE as Ulong),
    attribute_def!(CKA_RESET_ON_INIT as Bool),
    attribute_def!(CKA_HAS_RESET as Bool),
    attribute_def!(CKA_PIXEL_X as Ulong),
    attribute_def!(CKA_PIXEL_Y as Ulong),
    attribute_def!(CKA_RESOLUTION as Ulong),
    attribute_def!(CKA_CHAR_ROWS as Ulong),
    attribute_def!(CKA_CHAR_COLUMNS as Ulong),
    attribute_def!(CKA_BITS_PER_PIXEL as Ulong),
    attribute_def!(CKA_CHAR_SETS as Bytes),
    attribute_def!(CKA_ENCODING_METHODS as Bytes),
    attribute_def!(CKA_MIME_TYPES as Bytes),
    attribute_def!(CKA_ALLOWED_MECHANISMS as MechanismArray),
];

static ATTRIBUTE_INDEX: Lazy<HashMap<CK_ATTRIBUTE_TYPE, &'static AttributeDef>> =
    Lazy::new(|| ATTRIBUTE_DEFS.iter().map(|def| (def.id, def)).collect());

fn attribute_def(type_: CK_ATTRIBUTE_TYPE) -> HResult<&'static AttributeDef> {
    ATTRIBUTE_INDEX
        .get(&type_)
        .copied()
        .ok_or(HError::UnknownAttributeType(type_))
}

/// The printable `CKA_*` name of an attribute type.
#[must_use]
pub fn attribute_name(type_: CK_ATTRIBUTE_TYPE) -> String {
    ATTRIBUTE_INDEX.get(&type_).map_or_else(
        || {
            if type_ & CKA_VENDOR_DEFINED == CKA_VENDOR_DEFINED {
                format!("CKA_VENDOR_DEFINED+{:#x}", type_ & !CKA_VENDOR_DEFINED)
            } else {
                format!("{type_:#x}")
            }
        },
        |def| def.name.to_owned(),
    )
}

/// The value kind of a known attribute type.
pub fn attribute_kind(type_: CK_ATTRIBUTE_TYPE) -> HResult<AttributeKind> {
    attribute_def(type_).map(|def| def.kind)
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum AttributeValue {
    Bool(bool),
    Ulong(u64),
    Bytes(Vec<u8>),
    Date(Date),
    MechanismArray(Vec<CK_MECHANISM_TYPE>),
    AttributeArray(Vec<Attribute>),
}

impl AttributeValue {
    #[must_use]
    pub const fn kind(&self) -> AttributeKind {
        match self {
            Self::Bool(_) => AttributeKind::Bool,
            Self::Ulong(_) => AttributeKind::Ulong,
            Self::Bytes(_) => AttributeKind::Bytes,
            Self::Date(_) => AttributeKind::Date,
            Self::MechanismArray(_) => AttributeKind::MechanismArray,
            Self::AttributeArray(_) => AttributeKind::AttributeArray,
        }
    }

    fn encode(&self, type_: CK_ATTRIBUTE_TYPE) -> HResult<WireValue> {
        Ok(match self {
            Self::Bool(b) => WireValue::Bytes(vec![CK_BBOOL::from(*b)]),
            Self::Ulong(v) => WireValue::Bytes(CK_ULONG::try_from(*v)?.to_ne_bytes().to_vec()),
            Self::Bytes(bytes) => WireValue::Bytes(bytes.clone()),
            Self::Date(date) => WireValue::Bytes(encode_date(type_, *date)?),
            Self::MechanismArray(mechanisms) => WireValue::Bytes(
                mechanisms
                    .iter()
                    .flat_map(|m| m.to_ne_bytes())
                    .collect(),
            ),
            Self::AttributeArray(attributes) => WireValue::Nested(
                attributes
                    .iter()
                    .map(Attribute::to_wire)
                    .filter_map(Result::transpose)
                    .collect::<HResult<Vec<_>>>()?,
            ),
        })
    }
}

impl fmt::Debug for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Ulong(v) => write!(f, "{v:#x}"),
            Self::Bytes(bytes) => write!(f, "{}", BytesPreview(bytes)),
            Self::Date(date) => write!(f, "{date}"),
            Self::MechanismArray(mechanisms) => f
                .debug_list()
                .entries(mechanisms.iter().map(|m| crate::mechanism::mechanism_name(*m)))
                .finish(),
            Self::AttributeArray(attributes) => f.debug_list().entries(attributes).finish(),
        }
    }
}

/// Where an attribute stands, independently of its value kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum AttributeState {
    /// Not part of any template, never read
    #[default]
    Absent,
    /// The token would not reveal it (sensitive, or not valid for the object)
    Unavailable,
    /// Present, with no value
    Null,
    Value(AttributeValue),
}

/// One typed attribute of an object.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Attribute {
    type_: CK_ATTRIBUTE_TYPE,
    kind: AttributeKind,
    state: AttributeState,
}

impl Attribute {
    /// An absent attribute of a known type.
    pub fn new(type_: CK_ATTRIBUTE_TYPE) -> HResult<Self> {
        Ok(Self {
            type_,
            kind: attribute_kind(type_)?,
            state: AttributeState::Absent,
        })
    }

    pub fn with_value(type_: CK_ATTRIBUTE_TYPE, value: AttributeValue) -> HResult<Self> {
        let mut attribute = Self::new(type_)?;
        attribute.set(value)?;
        Ok(attribute)
    }

    #[must_use]
    pub const fn type_(&self) -> CK_ATTRIBUTE_TYPE {
        self.type_
    }

    #[must_use]
    pub const fn kind(&self) -> AttributeKind {
        self.kind
    }

    #[must_use]
    pub const fn state(&self) -> &AttributeState {
        &self.state
    }

    /// Present in a template, either with a value or explicitly null.
    #[must_use]
    pub const fn is_present(&self) -> bool {
        matches!(self.state, AttributeState::Null | AttributeState::Value(_))
    }

    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self.state, AttributeState::Unavailable)
    }

    #[must_use]
    pub const fn value(&self) -> Option<&AttributeValue> {
        match &self.state {
            AttributeState::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn set(&mut self, value: AttributeValue) -> HResult<()> {
        if value.kind() != self.kind {
            return Err(HError::AttributeKindMismatch {
                attribute: self.type_,
                expected: self.kind,
            });
        }
        self.state = AttributeState::Value(value);
        Ok(())
    }

    /// Mark the attribute present without a value.
    /// For sequence kinds the empty sequence stands for the null value.
    pub fn set_null(&mut self) {
        self.state = match self.kind {
            AttributeKind::Bytes => AttributeState::Value(AttributeValue::Bytes(Vec::new())),
            AttributeKind::MechanismArray => {
                AttributeState::Value(AttributeValue::MechanismArray(Vec::new()))
            }
            AttributeKind::AttributeArray => {
                AttributeState::Value(AttributeValue::AttributeArray(Vec::new()))
            }
            AttributeKind::Bool | AttributeKind::Ulong | AttributeKind::Date => {
                AttributeState::Null
            }
        };
    }

    pub fn clear(&mut self) {
        self.state = AttributeState::Absent;
    }

    pub(crate) fn mark_unavailable(&mut self) {
        self.state = AttributeState::Unavailable;
    }

    fn require(&self) -> HResult<&AttributeValue> {
        match &self.state {
            AttributeState::Value(v) => Ok(v),
            AttributeState::Unavailable => Err(HError::AttributeUnavailable(self.type_)),
            AttributeState::Absent | AttributeState::Null => {
                Err(HError::AttributeNotSet(self.type_))
            }
        }
    }

    fn kind_mismatch(&self) -> HError {
        HError::AttributeKindMismatch {
            attribute: self.type_,
            expected: self.kind,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self.value()? {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_ulong(&self) -> Option<u64> {
        match self.value()? {
            AttributeValue::Ulong(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self.value()? {
            AttributeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_date(&self) -> Option<Date> {
        match self.value()? {
            AttributeValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn require_bool(&self) -> HResult<bool> {
        match self.require()? {
            AttributeValue::Bool(b) => Ok(*b),
            _ => Err(self.kind_mismatch()),
        }
    }

    pub fn require_ulong(&self) -> HResult<u64> {
        match self.require()? {
            AttributeValue::Ulong(v) => Ok(*v),
            _ => Err(self.kind_mismatch()),
        }
    }

    pub fn require_bytes(&self) -> HResult<&[u8]> {
        match self.require()? {
            AttributeValue::Bytes(b) => Ok(b),
            _ => Err(self.kind_mismatch()),
        }
    }

    pub fn require_date(&self) -> HResult<Date> {
        match self.require()? {
            AttributeValue::Date(d) => Ok(*d),
            _ => Err(self.kind_mismatch()),
        }
    }

    pub fn require_mechanisms(&self) -> HResult<&[CK_MECHANISM_TYPE]> {
        match self.require()? {
            AttributeValue::MechanismArray(m) => Ok(m),
            _ => Err(self.kind_mismatch()),
        }
    }

    /// Native template entry for this attribute.
    /// Absent and unavailable attributes are not part of a template.
    pub fn to_wire(&self) -> HResult<Option<WireAttribute>> {
        let value = match &self.state {
            AttributeState::Absent | AttributeState::Unavailable => return Ok(None),
            AttributeState::Null => WireValue::Bytes(Vec::new()),
            AttributeState::Value(v) => v.encode(self.type_)?,
        };
        Ok(Some(WireAttribute {
            type_: self.type_,
            value,
        }))
    }

    /// Replace the state with the decoding of a native value.
    pub fn load_wire(&mut self, value: &WireValue) -> HResult<()> {
        self.state = decode(self.type_, self.kind, value)?;
        Ok(())
    }

    pub fn from_wire(wire: &WireAttribute) -> HResult<Self> {
        let mut attribute = Self::new(wire.type_)?;
        attribute.load_wire(&wire.value)?;
        Ok(attribute)
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            AttributeState::Absent => write!(f, "{}: <absent>", attribute_name(self.type_)),
            AttributeState::Unavailable => {
                write!(f, "{}: <unavailable>", attribute_name(self.type_))
            }
            AttributeState::Null => write!(f, "{}: <null>", attribute_name(self.type_)),
            AttributeState::Value(v) => write!(f, "{}: {v:?}", attribute_name(self.type_)),
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A native attribute value: raw bytes, or a nested template for
/// attribute-array types.
#[derive(Clone, PartialEq, Eq)]
pub enum WireValue {
    Bytes(Vec<u8>),
    Nested(Vec<WireAttribute>),
}

impl WireValue {
    /// The `ulValueLen` of the native encoding.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Bytes(b) => b.len(),
            Self::Nested(attributes) => attributes.len() * size_of::<CK_ATTRIBUTE>(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for WireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&BytesPreview(bytes)).finish(),
            Self::Nested(attributes) => f.debug_tuple("Nested").field(attributes).finish(),
        }
    }
}

/// One `CK_ATTRIBUTE` entry of a native template, owning its value buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct WireAttribute {
    pub type_: CK_ATTRIBUTE_TYPE,
    pub value: WireValue,
}

impl fmt::Debug for WireAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireAttribute")
            .field("type_", &attribute_name(self.type_))
            .field("value", &self.value)
            .finish()
    }
}

fn invalid(attribute: CK_ATTRIBUTE_TYPE, reason: impl Into<String>) -> HError {
    HError::InvalidAttributeValue {
        attribute,
        reason: reason.into(),
    }
}

fn encode_date(type_: CK_ATTRIBUTE_TYPE, date: Date) -> HResult<Vec<u8>> {
    if !(0..=9999).contains(&date.year()) {
        return Err(invalid(type_, format!("year {} does not fit CK_DATE", date.year())));
    }
    Ok(format!(
        "{:04}{:02}{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
    .into_bytes())
}

fn decode_date(type_: CK_ATTRIBUTE_TYPE, bytes: &[u8]) -> HResult<Date> {
    if bytes.len() != 8 || !bytes.iter().all(u8::is_ascii_digit) {
        return Err(invalid(type_, "CK_DATE must be 8 ASCII digits"));
    }
    let digits = |range: std::ops::Range<usize>| -> u16 {
        bytes[range]
            .iter()
            .fold(0_u16, |acc, b| acc * 10 + u16::from(b - b'0'))
    };
    let month = Month::try_from(u8::try_from(digits(4..6))?)?;
    Ok(Date::from_calendar_date(
        i32::from(digits(0..4)),
        month,
        u8::try_from(digits(6..8))?,
    )?)
}

fn decode(
    type_: CK_ATTRIBUTE_TYPE,
    kind: AttributeKind,
    value: &WireValue,
) -> HResult<AttributeState> {
    let bytes = match value {
        WireValue::Nested(nested) => {
            if kind != AttributeKind::AttributeArray {
                return Err(invalid(type_, "nested template for a scalar attribute"));
            }
            let attributes = nested
                .iter()
                .map(Attribute::from_wire)
                .collect::<HResult<Vec<_>>>()?;
            return Ok(AttributeState::Value(AttributeValue::AttributeArray(
                attributes,
            )));
        }
        WireValue::Bytes(bytes) => bytes,
    };
    if bytes.is_empty() && !kind.is_sequence() {
        return Ok(AttributeState::Null);
    }
    let word = size_of::<CK_ULONG>();
    let value = match kind {
        AttributeKind::Bool => match bytes.as_slice() {
            [b] => AttributeValue::Bool(*b != 0),
            _ => return Err(invalid(type_, format!("CK_BBOOL of {} bytes", bytes.len()))),
        },
        AttributeKind::Ulong => {
            let raw: [u8; size_of::<CK_ULONG>()] = bytes
                .as_slice()
                .try_into()
                .map_err(|_e| invalid(type_, format!("CK_ULONG of {} bytes", bytes.len())))?;
            AttributeValue::Ulong(u64::from(CK_ULONG::from_ne_bytes(raw)))
        }
        AttributeKind::Bytes => AttributeValue::Bytes(bytes.clone()),
        AttributeKind::Date => AttributeValue::Date(decode_date(type_, bytes)?),
        AttributeKind::MechanismArray => {
            if bytes.len() % word != 0 {
                return Err(invalid(
                    type_,
                    format!("{} bytes is not a whole number of CK_ULONG", bytes.len()),
                ));
            }
            AttributeValue::MechanismArray(
                bytes
                    .chunks_exact(word)
                    .map(|chunk| chunk.try_into().map(CK_MECHANISM_TYPE::from_ne_bytes))
                    .collect::<Result<Vec<_>, _>>()?,
            )
        }
        AttributeKind::AttributeArray => {
            if !bytes.is_empty() {
                return Err(invalid(type_, "attribute array given as raw bytes"));
            }
            AttributeValue::AttributeArray(Vec::new())
        }
    };
    Ok(AttributeState::Value(value))
}
