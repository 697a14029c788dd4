//! The closed set of object variants and the attributes each one declares.

use std::fmt;

use pkcs11_sys::*;

use crate::error::{HError, HResult};

macro_rules! subtype_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            #[must_use]
            pub const fn code(self) -> CK_ULONG {
                match self {
                    $(Self::$variant => $code),+
                }
            }

            #[must_use]
            pub const fn from_code(code: CK_ULONG) -> Option<Self> {
                match code {
                    $($code => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

subtype_enum!(
    /// `CKA_CERTIFICATE_TYPE` values
    CertificateType { X509 = CKC_X_509 }
);

subtype_enum!(
    /// `CKA_KEY_TYPE` values of secret keys
    SecretKeyType {
        GenericSecret = CKK_GENERIC_SECRET,
        Aes = CKK_AES,
        Des = CKK_DES,
        Des2 = CKK_DES2,
        Des3 = CKK_DES3,
        Camellia = CKK_CAMELLIA,
    }
);

subtype_enum!(
    /// `CKA_KEY_TYPE` values of public and private keys
    AsymmetricKeyType {
        Rsa = CKK_RSA,
        Ec = CKK_EC,
        Dsa = CKK_DSA,
        Dh = CKK_DH,
        X942Dh = CKK_X9_42_DH,
    }
);

subtype_enum!(
    /// `CKA_KEY_TYPE` values of domain parameter objects
    DomainParameterType {
        Dsa = CKK_DSA,
        Dh = CKK_DH,
        X942Dh = CKK_X9_42_DH,
    }
);

subtype_enum!(
    /// `CKA_HW_FEATURE_TYPE` values
    HardwareFeatureType {
        Clock = CKH_CLOCK,
        MonotonicCounter = CKH_MONOTONIC_COUNTER,
        UserInterface = CKH_USER_INTERFACE,
    }
);

/// An object variant is fully determined by its class and, for every class
/// but data objects, a subtype code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectVariant {
    Data,
    Certificate(CertificateType),
    SecretKey(SecretKeyType),
    PublicKey(AsymmetricKeyType),
    PrivateKey(AsymmetricKeyType),
    DomainParameters(DomainParameterType),
    HardwareFeature(HardwareFeatureType),
}

const STORAGE: &[CK_ATTRIBUTE_TYPE] = &[
    CKA_CLASS,
    CKA_TOKEN,
    CKA_PRIVATE,
    CKA_MODIFIABLE,
    CKA_LABEL,
    CKA_COPYABLE,
    CKA_DESTROYABLE,
];

const DATA: &[CK_ATTRIBUTE_TYPE] = &[CKA_APPLICATION, CKA_OBJECT_ID, CKA_VALUE];

const CERTIFICATE: &[CK_ATTRIBUTE_TYPE] = &[
    CKA_CERTIFICATE_TYPE,
    CKA_TRUSTED,
    CKA_CERTIFICATE_CATEGORY,
    CKA_CHECK_VALUE,
    CKA_START_DATE,
    CKA_END_DATE,
];

const X509: &[CK_ATTRIBUTE_TYPE] = &[
    CKA_SUBJECT,
    CKA_ID,
    CKA_ISSUER,
    CKA_SERIAL_NUMBER,
    CKA_VALUE,
    CKA_URL,
    CKA_HASH_OF_SUBJECT_PUBLIC_KEY,
    CKA_HASH_OF_ISSUER_PUBLIC_KEY,
    CKA_JAVA_MIDP_SECURITY_DOMAIN,
    CKA_NAME_HASH_ALGORITHM,
];

const KEY: &[CK_ATTRIBUTE_TYPE] = &[
    CKA_KEY_TYPE,
    CKA_ID,
    CKA_START_DATE,
    CKA_END_DATE,
    CKA_DERIVE,
    CKA_LOCAL,
    CKA_KEY_GEN_MECHANISM,
    CKA_ALLOWED_MECHANISMS,
];

const SECRET_KEY: &[CK_ATTRIBUTE_TYPE] = &[
    CKA_SENSITIVE,
    CKA_ENCRYPT,
    CKA_DECRYPT,
    CKA_SIGN,
    CKA_VERIFY,
    CKA_WRAP,
    CKA_UNWRAP,
    CKA_EXTRACTABLE,
    CKA_ALWAYS_SENSITIVE,
    CKA_NEVER_EXTRACTABLE,
    CKA_CHECK_VALUE,
    CKA_WRAP_WITH_TRUSTED,
    CKA_TRUSTED,
    CKA_WRAP_TEMPLATE,
    CKA_UNWRAP_TEMPLATE,
    CKA_DERIVE_TEMPLATE,
];

const PUBLIC_KEY: &[CK_ATTRIBUTE_TYPE] = &[
    CKA_SUBJECT,
    CKA_ENCRYPT,
    CKA_VERIFY,
    CKA_VERIFY_RECOVER,
    CKA_WRAP,
    CKA_TRUSTED,
    CKA_WRAP_TEMPLATE,
    CKA_PUBLIC_KEY_INFO,
];

const PRIVATE_KEY: &[CK_ATTRIBUTE_TYPE] = &[
    CKA_SUBJECT,
    CKA_SENSITIVE,
    CKA_DECRYPT,
    CKA_SIGN,
    CKA_SIGN_RECOVER,
    CKA_UNWRAP,
    CKA_EXTRACTABLE,
    CKA_ALWAYS_SENSITIVE,
    CKA_NEVER_EXTRACTABLE,
    CKA_WRAP_WITH_TRUSTED,
    CKA_UNWRAP_TEMPLATE,
    CKA_ALWAYS_AUTHENTICATE,
    CKA_PUBLIC_KEY_INFO,
];

const DOMAIN_PARAMETERS: &[CK_ATTRIBUTE_TYPE] = &[CKA_KEY_TYPE, CKA_LOCAL];

const HARDWARE_FEATURE: &[CK_ATTRIBUTE_TYPE] = &[CKA_CLASS, CKA_HW_FEATURE_TYPE];

impl SecretKeyType {
    const fn attributes(self) -> &'static [CK_ATTRIBUTE_TYPE] {
        match self {
            Self::GenericSecret | Self::Aes | Self::Camellia => &[CKA_VALUE, CKA_VALUE_LEN],
            Self::Des | Self::Des2 | Self::Des3 => &[CKA_VALUE],
        }
    }
}

impl AsymmetricKeyType {
    const fn public_attributes(self) -> &'static [CK_ATTRIBUTE_TYPE] {
        match self {
            Self::Rsa => &[CKA_MODULUS, CKA_MODULUS_BITS, CKA_PUBLIC_EXPONENT],
            Self::Ec => &[CKA_EC_PARAMS, CKA_EC_POINT],
            Self::Dsa | Self::X942Dh => &[CKA_PRIME, CKA_SUBPRIME, CKA_BASE, CKA_VALUE],
            Self::Dh => &[CKA_PRIME, CKA_BASE, CKA_VALUE],
        }
    }

    const fn private_attributes(self) -> &'static [CK_ATTRIBUTE_TYPE] {
        match self {
            Self::Rsa => &[
                CKA_MODULUS,
                CKA_PUBLIC_EXPONENT,
                CKA_PRIVATE_EXPONENT,
                CKA_PRIME_1,
                CKA_PRIME_2,
                CKA_EXPONENT_1,
                CKA_EXPONENT_2,
                CKA_COEFFICIENT,
            ],
            Self::Ec => &[CKA_EC_PARAMS, CKA_VALUE],
            Self::Dsa | Self::X942Dh => &[CKA_PRIME, CKA_SUBPRIME, CKA_BASE, CKA_VALUE],
            Self::Dh => &[CKA_PRIME, CKA_BASE, CKA_VALUE, CKA_VALUE_BITS],
        }
    }
}

impl DomainParameterType {
    const fn attributes(self) -> &'static [CK_ATTRIBUTE_TYPE] {
        match self {
            Self::Dsa => &[CKA_PRIME, CKA_SUBPRIME, CKA_BASE, CKA_PRIME_BITS],
            Self::Dh => &[CKA_PRIME, CKA_BASE, CKA_PRIME_BITS],
            Self::X942Dh => &[
                CKA_PRIME,
                CKA_BASE,
                CKA_SUBPRIME,
                CKA_PRIME_BITS,
                CKA_SUB_PRIME_BITS,
            ],
        }
    }
}

impl HardwareFeatureType {
    const fn attributes(self) -> &'static [CK_ATTRIBUTE_TYPE] {
        match self {
            Self::Clock => &[CKA_VALUE],
            Self::MonotonicCounter => &[CKA_RESET_ON_INIT, CKA_HAS_RESET, CKA_VALUE],
            Self::UserInterface => &[
                CKA_PIXEL_X,
                CKA_PIXEL_Y,
                CKA_RESOLUTION,
                CKA_CHAR_ROWS,
                CKA_CHAR_COLUMNS,
                CKA_BITS_PER_PIXEL,
                CKA_CHAR_SETS,
                CKA_ENCODING_METHODS,
                CKA_MIME_TYPES,
            ],
        }
    }
}

impl ObjectVariant {
    /// Select the variant for a class code and optional subtype code.
    /// Data objects ignore the subtype; every other class requires one.
    pub fn resolve(class: CK_OBJECT_CLASS, subtype: Option<CK_ULONG>) -> HResult<Self> {
        let unsupported = || HError::UnsupportedObjectVariant { class, subtype };
        if class == CKO_DATA {
            return Ok(Self::Data);
        }
        let code = subtype.ok_or_else(unsupported)?;
        let variant = match class {
            CKO_CERTIFICATE => CertificateType::from_code(code).map(Self::Certificate),
            CKO_SECRET_KEY => SecretKeyType::from_code(code).map(Self::SecretKey),
            CKO_PUBLIC_KEY => AsymmetricKeyType::from_code(code).map(Self::PublicKey),
            CKO_PRIVATE_KEY => AsymmetricKeyType::from_code(code).map(Self::PrivateKey),
            CKO_DOMAIN_PARAMETERS => {
                DomainParameterType::from_code(code).map(Self::DomainParameters)
            }
            CKO_HW_FEATURE => HardwareFeatureType::from_code(code).map(Self::HardwareFeature),
            _ => None,
        };
        variant.ok_or_else(unsupported)
    }

    /// The attribute holding the subtype code for objects of `class`.
    #[must_use]
    pub const fn subtype_attribute_of(class: CK_OBJECT_CLASS) -> Option<CK_ATTRIBUTE_TYPE> {
        match class {
            CKO_CERTIFICATE => Some(CKA_CERTIFICATE_TYPE),
            CKO_SECRET_KEY | CKO_PUBLIC_KEY | CKO_PRIVATE_KEY | CKO_DOMAIN_PARAMETERS => {
                Some(CKA_KEY_TYPE)
            }
            CKO_HW_FEATURE => Some(CKA_HW_FEATURE_TYPE),
            _ => None,
        }
    }

    #[must_use]
    pub const fn class(self) -> CK_OBJECT_CLASS {
        match self {
            Self::Data => CKO_DATA,
            Self::Certificate(_) => CKO_CERTIFICATE,
            Self::SecretKey(_) => CKO_SECRET_KEY,
            Self::PublicKey(_) => CKO_PUBLIC_KEY,
            Self::PrivateKey(_) => CKO_PRIVATE_KEY,
            Self::DomainParameters(_) => CKO_DOMAIN_PARAMETERS,
            Self::HardwareFeature(_) => CKO_HW_FEATURE,
        }
    }

    #[must_use]
    pub const fn subtype(self) -> Option<CK_ULONG> {
        match self {
            Self::Data => None,
            Self::Certificate(t) => Some(t.code()),
            Self::SecretKey(t) => Some(t.code()),
            Self::PublicKey(t) | Self::PrivateKey(t) => Some(t.code()),
            Self::DomainParameters(t) => Some(t.code()),
            Self::HardwareFeature(t) => Some(t.code()),
        }
    }

    #[must_use]
    pub const fn subtype_attribute(self) -> Option<CK_ATTRIBUTE_TYPE> {
        Self::subtype_attribute_of(self.class())
    }

    /// Whether `type_` identifies the variant and therefore cannot change.
    #[must_use]
    pub fn is_identity(self, type_: CK_ATTRIBUTE_TYPE) -> bool {
        type_ == CKA_CLASS || self.subtype_attribute() == Some(type_)
    }

    /// Every attribute this variant declares, in declaration order, without duplicates.
    #[must_use]
    pub fn declared_attributes(self) -> Vec<CK_ATTRIBUTE_TYPE> {
        let groups: Vec<&[CK_ATTRIBUTE_TYPE]> = match self {
            Self::Data => vec![STORAGE, DATA],
            Self::Certificate(CertificateType::X509) => vec![STORAGE, CERTIFICATE, X509],
            Self::SecretKey(t) => vec![STORAGE, KEY, SECRET_KEY, t.attributes()],
            Self::PublicKey(t) => vec![STORAGE, KEY, PUBLIC_KEY, t.public_attributes()],
            Self::PrivateKey(t) => vec![STORAGE, KEY, PRIVATE_KEY, t.private_attributes()],
            Self::DomainParameters(t) => vec![STORAGE, DOMAIN_PARAMETERS, t.attributes()],
            Self::HardwareFeature(t) => vec![HARDWARE_FEATURE, t.attributes()],
        };
        let mut declared: Vec<CK_ATTRIBUTE_TYPE> = Vec::new();
        for type_ in groups.into_iter().flatten() {
            if !declared.contains(type_) {
                declared.push(*type_);
            }
        }
        declared
    }
}

impl fmt::Display for ObjectVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => write!(f, "data object"),
            Self::Certificate(t) => write!(f, "{t} certificate"),
            Self::SecretKey(t) => write!(f, "{t} secret key"),
            Self::PublicKey(t) => write!(f, "{t} public key"),
            Self::PrivateKey(t) => write!(f, "{t} private key"),
            Self::DomainParameters(t) => write!(f, "{t} domain parameters"),
            Self::HardwareFeature(t) => write!(f, "{t} hardware feature"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_every_known_combination() -> HResult<()> {
        assert_eq!(ObjectVariant::resolve(CKO_DATA, None)?, ObjectVariant::Data);
        assert_eq!(
            ObjectVariant::resolve(CKO_CERTIFICATE, Some(CKC_X_509))?,
            ObjectVariant::Certificate(CertificateType::X509)
        );
        for t in [
            SecretKeyType::GenericSecret,
            SecretKeyType::Aes,
            SecretKeyType::Des,
            SecretKeyType::Des2,
            SecretKeyType::Des3,
            SecretKeyType::Camellia,
        ] {
            assert_eq!(
                ObjectVariant::resolve(CKO_SECRET_KEY, Some(t.code()))?,
                ObjectVariant::SecretKey(t)
            );
        }
        for t in [
            AsymmetricKeyType::Rsa,
            AsymmetricKeyType::Ec,
            AsymmetricKeyType::Dsa,
            AsymmetricKeyType::Dh,
            AsymmetricKeyType::X942Dh,
        ] {
            assert_eq!(
                ObjectVariant::resolve(CKO_PUBLIC_KEY, Some(t.code()))?,
                ObjectVariant::PublicKey(t)
            );
            assert_eq!(
                ObjectVariant::resolve(CKO_PRIVATE_KEY, Some(t.code()))?,
                ObjectVariant::PrivateKey(t)
            );
        }
        for t in [
            DomainParameterType::Dsa,
            DomainParameterType::Dh,
            DomainParameterType::X942Dh,
        ] {
            assert_eq!(
                ObjectVariant::resolve(CKO_DOMAIN_PARAMETERS, Some(t.code()))?,
                ObjectVariant::DomainParameters(t)
            );
        }
        for t in [
            HardwareFeatureType::Clock,
            HardwareFeatureType::MonotonicCounter,
            HardwareFeatureType::UserInterface,
        ] {
            assert_eq!(
                ObjectVariant::resolve(CKO_HW_FEATURE, Some(t.code()))?,
                ObjectVariant::HardwareFeature(t)
            );
        }
        Ok(())
    }

    #[test]
    fn unknown_combinations_are_rejected() {
        assert_eq!(
            ObjectVariant::resolve(CKO_SECRET_KEY, Some(CKK_RSA)),
            Err(HError::UnsupportedObjectVariant {
                class: CKO_SECRET_KEY,
                subtype: Some(CKK_RSA),
            })
        );
        assert!(ObjectVariant::resolve(CKO_PUBLIC_KEY, None).is_err());
        assert!(ObjectVariant::resolve(CKO_DOMAIN_PARAMETERS, Some(CKK_AES)).is_err());
        assert!(ObjectVariant::resolve(CKO_VENDOR_DEFINED, Some(0)).is_err());
    }

    #[test]
    fn declared_attributes_include_identity() {
        let variant = ObjectVariant::SecretKey(SecretKeyType::Aes);
        let declared = variant.declared_attributes();
        assert_eq!(declared.first(), Some(&CKA_CLASS));
        assert!(declared.contains(&CKA_KEY_TYPE));
        assert!(declared.contains(&CKA_VALUE_LEN));
        assert!(variant.is_identity(CKA_KEY_TYPE));
        assert!(!variant.is_identity(CKA_LABEL));

        let counter = ObjectVariant::HardwareFeature(HardwareFeatureType::MonotonicCounter);
        assert!(counter.declared_attributes().contains(&CKA_HAS_RESET));
        assert!(!counter.declared_attributes().contains(&CKA_TOKEN));
    }
}
