//! Token objects: a variant, a lifecycle state and a typed attribute set.

use std::{
    fmt,
    hash::{Hash, Hasher},
};

use cosmian_logger::{debug, trace};
use pkcs11_sys::{
    CK_ATTRIBUTE_TYPE, CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_ULONG, CKA_CERTIFICATE_TYPE,
    CKA_CLASS, CKA_HW_FEATURE_TYPE, CKA_KEY_TYPE, CKR_ATTRIBUTE_SENSITIVE,
    CKR_ATTRIBUTE_TYPE_INVALID, CKR_OK,
};
use time::Date;

use crate::{
    attribute::{Attribute, AttributeState, AttributeValue, WireAttribute, WireValue},
    backend::{RawValue, TokenBackend},
    error::{HError, HResult},
};

mod variant;

pub use variant::{
    AsymmetricKeyType, CertificateType, DomainParameterType, HardwareFeatureType, ObjectVariant,
    SecretKeyType,
};

/// `CK_UNAVAILABLE_INFORMATION`; the constant is not exported on every target.
pub(crate) const UNAVAILABLE_INFORMATION: CK_ULONG = CK_ULONG::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Built locally, not yet on a token
    Template,
    Bound(CK_OBJECT_HANDLE),
    /// Destroyed on the token; the handle is kept for diagnostics only
    Destroyed(CK_OBJECT_HANDLE),
}

/// A PKCS#11 object.
///
/// The attribute set is exactly the declared set of the variant, in
/// declaration order. The class and subtype attributes are always present
/// and never change.
#[derive(Clone)]
pub struct Object {
    variant: ObjectVariant,
    state: ObjectState,
    attributes: Vec<Attribute>,
}

/// The two halves of a generated key pair.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public_key: Object,
    pub private_key: Object,
}

impl Object {
    /// A local template of `variant` with only its identity attributes set.
    pub fn new(variant: ObjectVariant) -> HResult<Self> {
        let attributes = variant
            .declared_attributes()
            .into_iter()
            .map(|type_| {
                let mut attribute = Attribute::new(type_)?;
                if type_ == CKA_CLASS {
                    attribute.set(AttributeValue::Ulong(u64::from(variant.class())))?;
                } else if variant.subtype_attribute() == Some(type_) {
                    if let Some(code) = variant.subtype() {
                        attribute.set(AttributeValue::Ulong(u64::from(code)))?;
                    }
                }
                Ok(attribute)
            })
            .collect::<HResult<Vec<_>>>()?;
        Ok(Self {
            variant,
            state: ObjectState::Template,
            attributes,
        })
    }

    /// A template for the variant designated by raw class and subtype codes.
    pub fn from_codes(
        class: pkcs11_sys::CK_OBJECT_CLASS,
        subtype: Option<CK_ULONG>,
    ) -> HResult<Self> {
        Self::new(ObjectVariant::resolve(class, subtype)?)
    }

    pub(crate) fn bound(variant: ObjectVariant, handle: CK_OBJECT_HANDLE) -> HResult<Self> {
        let mut object = Self::new(variant)?;
        object.state = ObjectState::Bound(handle);
        Ok(object)
    }

    #[must_use]
    pub const fn variant(&self) -> ObjectVariant {
        self.variant
    }

    #[must_use]
    pub const fn state(&self) -> ObjectState {
        self.state
    }

    /// The token handle, for objects currently on a token.
    #[must_use]
    pub const fn handle(&self) -> Option<CK_OBJECT_HANDLE> {
        match self.state {
            ObjectState::Bound(h) => Some(h),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_destroyed(&self) -> bool {
        matches!(self.state, ObjectState::Destroyed(_))
    }

    /// The handle of a bound object, refusing templates and destroyed objects.
    pub(crate) fn live_handle(&self) -> HResult<CK_OBJECT_HANDLE> {
        match self.state {
            ObjectState::Bound(h) => Ok(h),
            ObjectState::Destroyed(h) => Err(HError::StaleObject(h)),
            ObjectState::Template => Err(HError::Default(format!(
                "{} is a local template and has no token handle",
                self.variant
            ))),
        }
    }

    pub(crate) fn mark_destroyed(&mut self) -> HResult<CK_OBJECT_HANDLE> {
        let handle = self.live_handle()?;
        self.state = ObjectState::Destroyed(handle);
        Ok(handle)
    }

    #[must_use]
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    #[must_use]
    pub fn attribute(&self, type_: CK_ATTRIBUTE_TYPE) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.type_() == type_)
    }

    /// The declared attribute `type_`, failing for undeclared types.
    pub fn get(&self, type_: CK_ATTRIBUTE_TYPE) -> HResult<&Attribute> {
        self.attribute(type_).ok_or_else(|| self.undeclared(type_))
    }

    fn undeclared(&self, type_: CK_ATTRIBUTE_TYPE) -> HError {
        HError::UndeclaredAttribute {
            attribute: type_,
            variant: self.variant.to_string(),
        }
    }

    fn mutable_attribute(&mut self, type_: CK_ATTRIBUTE_TYPE) -> HResult<&mut Attribute> {
        if self.variant.is_identity(type_) {
            return Err(HError::ImmutableAttribute(type_));
        }
        let variant = self.variant;
        self.attributes
            .iter_mut()
            .find(|a| a.type_() == type_)
            .ok_or_else(|| HError::UndeclaredAttribute {
                attribute: type_,
                variant: variant.to_string(),
            })
    }

    pub fn set(&mut self, type_: CK_ATTRIBUTE_TYPE, value: AttributeValue) -> HResult<&mut Self> {
        self.mutable_attribute(type_)?.set(value)?;
        Ok(self)
    }

    pub fn set_bool(&mut self, type_: CK_ATTRIBUTE_TYPE, value: bool) -> HResult<&mut Self> {
        self.set(type_, AttributeValue::Bool(value))
    }

    pub fn set_ulong(&mut self, type_: CK_ATTRIBUTE_TYPE, value: u64) -> HResult<&mut Self> {
        self.set(type_, AttributeValue::Ulong(value))
    }

    pub fn set_bytes(
        &mut self,
        type_: CK_ATTRIBUTE_TYPE,
        value: impl Into<Vec<u8>>,
    ) -> HResult<&mut Self> {
        self.set(type_, AttributeValue::Bytes(value.into()))
    }

    pub fn set_date(&mut self, type_: CK_ATTRIBUTE_TYPE, value: Date) -> HResult<&mut Self> {
        self.set(type_, AttributeValue::Date(value))
    }

    pub fn set_null(&mut self, type_: CK_ATTRIBUTE_TYPE) -> HResult<&mut Self> {
        self.mutable_attribute(type_)?.set_null();
        Ok(self)
    }

    /// Drop `type_` from the template.
    pub fn clear(&mut self, type_: CK_ATTRIBUTE_TYPE) -> HResult<&mut Self> {
        self.mutable_attribute(type_)?.clear();
        Ok(self)
    }

    /// Consuming form of [`Object::set`] for building templates.
    pub fn with(mut self, type_: CK_ATTRIBUTE_TYPE, value: AttributeValue) -> HResult<Self> {
        self.set(type_, value)?;
        Ok(self)
    }

    pub fn require_bool(&self, type_: CK_ATTRIBUTE_TYPE) -> HResult<bool> {
        self.get(type_)?.require_bool()
    }

    pub fn require_ulong(&self, type_: CK_ATTRIBUTE_TYPE) -> HResult<u64> {
        self.get(type_)?.require_ulong()
    }

    pub fn require_bytes(&self, type_: CK_ATTRIBUTE_TYPE) -> HResult<&[u8]> {
        self.get(type_)?.require_bytes()
    }

    pub fn require_date(&self, type_: CK_ATTRIBUTE_TYPE) -> HResult<Date> {
        self.get(type_)?.require_date()
    }

    /// The native template: present attributes only, in declaration order.
    pub fn to_wire_template(&self) -> HResult<Vec<WireAttribute>> {
        self.attributes
            .iter()
            .map(Attribute::to_wire)
            .filter_map(Result::transpose)
            .collect()
    }

    /// Rebuild a template of `variant` from a native template.
    /// Identity entries must agree with the variant; undeclared entries are refused.
    pub fn from_wire_template(variant: ObjectVariant, wire: &[WireAttribute]) -> HResult<Self> {
        let mut object = Self::new(variant)?;
        for entry in wire {
            let position = object
                .attributes
                .iter()
                .position(|a| a.type_() == entry.type_)
                .ok_or_else(|| object.undeclared(entry.type_))?;
            let mut decoded = object.attributes[position].clone();
            decoded.load_wire(&entry.value)?;
            if variant.is_identity(entry.type_) {
                if decoded != object.attributes[position] {
                    return Err(HError::ImmutableAttribute(entry.type_));
                }
                continue;
            }
            object.attributes[position] = decoded;
        }
        Ok(object)
    }

    /// Identify the object behind `handle` and read all its declared attributes.
    ///
    /// The class and every possible subtype attribute are fetched in one
    /// batched call, the variant is resolved from them, then a second batched
    /// call fills the attribute table.
    pub fn read_from(
        backend: &dyn TokenBackend,
        session: CK_SESSION_HANDLE,
        handle: CK_OBJECT_HANDLE,
    ) -> HResult<Self> {
        const IDENTITY: [CK_ATTRIBUTE_TYPE; 4] = [
            CKA_CLASS,
            CKA_KEY_TYPE,
            CKA_CERTIFICATE_TYPE,
            CKA_HW_FEATURE_TYPE,
        ];
        let readouts = backend
            .get_attribute_values(session, handle, &IDENTITY)
            .map_err(HError::DeviceStatus)?;
        let code_of = |type_: CK_ATTRIBUTE_TYPE| -> HResult<Option<CK_ULONG>> {
            let Some(readout) = readouts.iter().find(|r| r.type_ == type_) else {
                return Ok(None);
            };
            match (readout.status, &readout.value) {
                (CKR_OK, RawValue::Bytes(bytes)) => {
                    let mut attribute = Attribute::new(type_)?;
                    attribute.load_wire(&WireValue::Bytes(bytes.clone()))?;
                    attribute
                        .as_ulong()
                        .map(CK_ULONG::try_from)
                        .transpose()
                        .map_err(HError::from)
                }
                (CKR_OK | CKR_ATTRIBUTE_TYPE_INVALID | CKR_ATTRIBUTE_SENSITIVE, _) => Ok(None),
                (status, _) => Err(HError::DeviceStatus(status)),
            }
        };
        let class = code_of(CKA_CLASS)?.ok_or(HError::AttributeUnavailable(CKA_CLASS))?;
        let subtype = match ObjectVariant::subtype_attribute_of(class) {
            Some(type_) => code_of(type_)?,
            None => None,
        };
        let variant = ObjectVariant::resolve(class, subtype)?;
        trace!("handle {handle} identified as {variant}");
        let mut object = Self::bound(variant, handle)?;
        object.read_all(backend, session)?;
        Ok(object)
    }

    /// Read every declared attribute of the bound object in one batched call.
    ///
    /// Attributes the token reports as invalid for the object, sensitive, or
    /// with an unavailable length become `Unavailable`. Any other per-attribute
    /// failure aborts the whole read, leaving the object untouched.
    pub fn read_all(
        &mut self,
        backend: &dyn TokenBackend,
        session: CK_SESSION_HANDLE,
    ) -> HResult<()> {
        let handle = self.live_handle()?;
        let types: Vec<CK_ATTRIBUTE_TYPE> = self.attributes.iter().map(Attribute::type_).collect();
        debug!(
            "reading {} attributes of {} (handle {handle})",
            types.len(),
            self.variant
        );
        let readouts = backend
            .get_attribute_values(session, handle, &types)
            .map_err(HError::DeviceStatus)?;
        if readouts.len() != types.len() {
            return Err(HError::Default(format!(
                "attribute read returned {} entries for {} requested",
                readouts.len(),
                types.len()
            )));
        }

        let mut refreshed = self.attributes.clone();
        for (attribute, readout) in refreshed.iter_mut().zip(readouts) {
            if readout.type_ != attribute.type_() {
                return Err(HError::Default(format!(
                    "attribute read answered {:#x} for {:#x}",
                    readout.type_,
                    attribute.type_()
                )));
            }
            match (readout.status, readout.value) {
                (CKR_ATTRIBUTE_TYPE_INVALID | CKR_ATTRIBUTE_SENSITIVE, _)
                | (CKR_OK, RawValue::Length(UNAVAILABLE_INFORMATION)) => {
                    trace!("{} is unavailable", attribute);
                    attribute.mark_unavailable();
                }
                (CKR_OK, RawValue::Length(len)) => {
                    return Err(HError::InvalidAttributeValue {
                        attribute: attribute.type_(),
                        reason: format!("only the length ({len}) was returned"),
                    });
                }
                (CKR_OK, RawValue::Bytes(bytes)) => {
                    attribute.load_wire(&WireValue::Bytes(bytes))?;
                }
                (CKR_OK, RawValue::Nested(nested)) => {
                    attribute.load_wire(&WireValue::Nested(nested))?;
                }
                (status, _) => return Err(HError::DeviceStatus(status)),
            }
        }

        // identity attributes stay as bound; the token must not contradict them
        for (fresh, current) in refreshed.iter_mut().zip(&self.attributes) {
            if !self.variant.is_identity(fresh.type_()) {
                continue;
            }
            if fresh.is_unavailable() {
                fresh.clone_from(current);
            } else if fresh.value() != current.value() {
                return Err(HError::Default(format!(
                    "token reports {fresh} for a {}",
                    self.variant
                )));
            }
        }
        self.attributes = refreshed;
        Ok(())
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.variant == other.variant && self.attributes == other.attributes
    }
}

impl Eq for Object {}

impl Hash for Object {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.variant.hash(state);
        self.attributes.hash(state);
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("variant", &self.variant)
            .field("state", &self.state)
            .field(
                "attributes",
                &self
                    .attributes
                    .iter()
                    .filter(|a| !matches!(a.state(), AttributeState::Absent))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state {
            ObjectState::Template => writeln!(f, "{} (template)", self.variant)?,
            ObjectState::Bound(h) => writeln!(f, "{} (handle {h})", self.variant)?,
            ObjectState::Destroyed(h) => writeln!(f, "{} (destroyed, was {h})", self.variant)?,
        }
        for attribute in &self.attributes {
            writeln!(f, "  {attribute}")?;
        }
        Ok(())
    }
}
