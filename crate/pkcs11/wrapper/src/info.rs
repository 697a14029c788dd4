//! Immutable snapshots of session, token, mechanism and module information.
//!
//! A snapshot is decoded once from the native structure and never re-queries
//! the token; take a new one to observe changes.

use std::fmt;

use pkcs11_sys::*;
use time::{Date, Month, PrimitiveDateTime, Time};

use crate::{object::UNAVAILABLE_INFORMATION, preview::padded_string};

/// `CK_EFFECTIVELY_INFINITE`
const EFFECTIVELY_INFINITE: CK_ULONG = 0;

macro_rules! flag_predicates {
    ($($(#[$doc:meta])* $name:ident => $flag:ident),+ $(,)?) => {
        $(
            $(#[$doc])*
            #[must_use]
            pub const fn $name(&self) -> bool {
                self.flags & $flag != 0
            }
        )+
    };
}

/// A cryptoki or firmware version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl From<CK_VERSION> for Version {
    fn from(v: CK_VERSION) -> Self {
        Self {
            major: v.major,
            minor: v.minor,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A token counter that may carry one of the reserved sentinels.
///
/// The sentinels never compare equal to a finite count, zero included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Unavailable,
    EffectivelyInfinite,
    Finite(u64),
}

impl Counter {
    /// Decode a limit, where `CK_EFFECTIVELY_INFINITE` (zero) means no limit.
    #[must_use]
    pub fn from_limit(raw: CK_ULONG) -> Self {
        match raw {
            UNAVAILABLE_INFORMATION => Self::Unavailable,
            EFFECTIVELY_INFINITE => Self::EffectivelyInfinite,
            n => Self::Finite(u64::from(n)),
        }
    }

    /// Decode a count or an amount, where zero is an ordinary value.
    #[must_use]
    pub fn from_count(raw: CK_ULONG) -> Self {
        match raw {
            UNAVAILABLE_INFORMATION => Self::Unavailable,
            n => Self::Finite(u64::from(n)),
        }
    }

    #[must_use]
    pub const fn finite(self) -> Option<u64> {
        match self {
            Self::Finite(n) => Some(n),
            _ => None,
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "unavailable"),
            Self::EffectivelyInfinite => write!(f, "effectively infinite"),
            Self::Finite(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    RoPublic,
    RoUser,
    RwPublic,
    RwUser,
    RwSecurityOfficer,
    /// A state code outside the standard set
    Unknown(CK_STATE),
}

impl From<CK_STATE> for SessionState {
    fn from(state: CK_STATE) -> Self {
        match state {
            CKS_RO_PUBLIC_SESSION => Self::RoPublic,
            CKS_RO_USER_FUNCTIONS => Self::RoUser,
            CKS_RW_PUBLIC_SESSION => Self::RwPublic,
            CKS_RW_USER_FUNCTIONS => Self::RwUser,
            CKS_RW_SO_FUNCTIONS => Self::RwSecurityOfficer,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoPublic => write!(f, "CKS_RO_PUBLIC_SESSION"),
            Self::RoUser => write!(f, "CKS_RO_USER_FUNCTIONS"),
            Self::RwPublic => write!(f, "CKS_RW_PUBLIC_SESSION"),
            Self::RwUser => write!(f, "CKS_RW_USER_FUNCTIONS"),
            Self::RwSecurityOfficer => write!(f, "CKS_RW_SO_FUNCTIONS"),
            Self::Unknown(code) => write!(f, "unknown session state {code:#x}"),
        }
    }
}

/// `CK_SESSION_INFO`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    slot_id: CK_SLOT_ID,
    state: SessionState,
    flags: CK_FLAGS,
    device_error: CK_ULONG,
}

impl SessionInfo {
    #[must_use]
    pub const fn slot_id(&self) -> CK_SLOT_ID {
        self.slot_id
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// The vendor-defined device error code.
    #[must_use]
    pub const fn device_error(&self) -> CK_ULONG {
        self.device_error
    }

    #[must_use]
    pub const fn flags(&self) -> CK_FLAGS {
        self.flags
    }

    flag_predicates! {
        is_read_write => CKF_RW_SESSION,
        is_serial => CKF_SERIAL_SESSION,
    }
}

impl From<CK_SESSION_INFO> for SessionInfo {
    fn from(info: CK_SESSION_INFO) -> Self {
        Self {
            slot_id: info.slotID,
            state: SessionState::from(info.state),
            flags: info.flags,
            device_error: info.ulDeviceError,
        }
    }
}

impl fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slot {}: {} ({}), device error {:#x}",
            self.slot_id,
            self.state,
            if self.is_read_write() { "rw" } else { "ro" },
            self.device_error
        )
    }
}

/// `CK_TOKEN_INFO`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub label: String,
    pub manufacturer_id: String,
    pub model: String,
    pub serial_number: String,
    flags: CK_FLAGS,
    pub max_session_count: Counter,
    pub session_count: Counter,
    pub max_rw_session_count: Counter,
    pub rw_session_count: Counter,
    pub max_pin_len: u64,
    pub min_pin_len: u64,
    pub total_public_memory: Counter,
    pub free_public_memory: Counter,
    pub total_private_memory: Counter,
    pub free_private_memory: Counter,
    pub hardware_version: Version,
    pub firmware_version: Version,
    /// Only tokens with a clock report a time
    pub utc_time: Option<PrimitiveDateTime>,
}

impl TokenInfo {
    #[must_use]
    pub const fn flags(&self) -> CK_FLAGS {
        self.flags
    }

    flag_predicates! {
        has_rng => CKF_RNG,
        is_write_protected => CKF_WRITE_PROTECTED,
        is_login_required => CKF_LOGIN_REQUIRED,
        is_user_pin_initialized => CKF_USER_PIN_INITIALIZED,
        is_restore_key_not_needed => CKF_RESTORE_KEY_NOT_NEEDED,
        has_clock_on_token => CKF_CLOCK_ON_TOKEN,
        has_protected_authentication_path => CKF_PROTECTED_AUTHENTICATION_PATH,
        supports_dual_crypto_operations => CKF_DUAL_CRYPTO_OPERATIONS,
        is_token_initialized => CKF_TOKEN_INITIALIZED,
        is_user_pin_count_low => CKF_USER_PIN_COUNT_LOW,
        is_user_pin_final_try => CKF_USER_PIN_FINAL_TRY,
        is_user_pin_locked => CKF_USER_PIN_LOCKED,
        is_user_pin_to_be_changed => CKF_USER_PIN_TO_BE_CHANGED,
        is_so_pin_count_low => CKF_SO_PIN_COUNT_LOW,
        is_so_pin_final_try => CKF_SO_PIN_FINAL_TRY,
        is_so_pin_locked => CKF_SO_PIN_LOCKED,
        is_so_pin_to_be_changed => CKF_SO_PIN_TO_BE_CHANGED,
        is_in_error_state => CKF_ERROR_STATE,
    }
}

impl From<CK_TOKEN_INFO> for TokenInfo {
    fn from(info: CK_TOKEN_INFO) -> Self {
        let utc_time = if info.flags & CKF_CLOCK_ON_TOKEN == 0 {
            None
        } else {
            parse_utc_time(&info.utcTime)
        };
        Self {
            label: padded_string(&info.label),
            manufacturer_id: padded_string(&info.manufacturerID),
            model: padded_string(&info.model),
            serial_number: padded_string(&info.serialNumber),
            flags: info.flags,
            max_session_count: Counter::from_limit(info.ulMaxSessionCount),
            session_count: Counter::from_count(info.ulSessionCount),
            max_rw_session_count: Counter::from_limit(info.ulMaxRwSessionCount),
            rw_session_count: Counter::from_count(info.ulRwSessionCount),
            max_pin_len: u64::from(info.ulMaxPinLen),
            min_pin_len: u64::from(info.ulMinPinLen),
            total_public_memory: Counter::from_count(info.ulTotalPublicMemory),
            free_public_memory: Counter::from_count(info.ulFreePublicMemory),
            total_private_memory: Counter::from_count(info.ulTotalPrivateMemory),
            free_private_memory: Counter::from_count(info.ulFreePrivateMemory),
            hardware_version: info.hardwareVersion.into(),
            firmware_version: info.firmwareVersion.into(),
            utc_time,
        }
    }
}

impl fmt::Display for TokenInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} ({} {}, serial {})",
            self.label, self.manufacturer_id, self.model, self.serial_number
        )?;
        writeln!(
            f,
            "  sessions: {} of {}, rw sessions: {} of {}",
            self.session_count,
            self.max_session_count,
            self.rw_session_count,
            self.max_rw_session_count
        )?;
        writeln!(
            f,
            "  public memory: {} free of {}, private memory: {} free of {}",
            self.free_public_memory,
            self.total_public_memory,
            self.free_private_memory,
            self.total_private_memory
        )?;
        write!(
            f,
            "  hardware {}, firmware {}",
            self.hardware_version, self.firmware_version
        )
    }
}

/// `YYYYMMDDhhmmss00`
fn parse_utc_time(raw: &[u8]) -> Option<PrimitiveDateTime> {
    let text = std::str::from_utf8(raw.get(..14)?).ok()?;
    let field = |range: std::ops::Range<usize>| text.get(range)?.parse::<u16>().ok();
    let date = Date::from_calendar_date(
        i32::from(field(0..4)?),
        Month::try_from(u8::try_from(field(4..6)?).ok()?).ok()?,
        u8::try_from(field(6..8)?).ok()?,
    )
    .ok()?;
    let time = Time::from_hms(
        u8::try_from(field(8..10)?).ok()?,
        u8::try_from(field(10..12)?).ok()?,
        u8::try_from(field(12..14)?).ok()?,
    )
    .ok()?;
    Some(PrimitiveDateTime::new(date, time))
}

/// `CK_MECHANISM_INFO`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MechanismInfo {
    pub min_key_size: u64,
    pub max_key_size: u64,
    flags: CK_FLAGS,
}

impl MechanismInfo {
    #[must_use]
    pub const fn flags(&self) -> CK_FLAGS {
        self.flags
    }

    flag_predicates! {
        /// Performed by the device itself
        is_hardware => CKF_HW,
        can_encrypt => CKF_ENCRYPT,
        can_decrypt => CKF_DECRYPT,
        can_digest => CKF_DIGEST,
        can_sign => CKF_SIGN,
        can_sign_recover => CKF_SIGN_RECOVER,
        can_verify => CKF_VERIFY,
        can_verify_recover => CKF_VERIFY_RECOVER,
        can_generate => CKF_GENERATE,
        can_generate_key_pair => CKF_GENERATE_KEY_PAIR,
        can_wrap => CKF_WRAP,
        can_unwrap => CKF_UNWRAP,
        can_derive => CKF_DERIVE,
    }
}

impl From<CK_MECHANISM_INFO> for MechanismInfo {
    fn from(info: CK_MECHANISM_INFO) -> Self {
        Self {
            min_key_size: u64::from(info.ulMinKeySize),
            max_key_size: u64::from(info.ulMaxKeySize),
            flags: info.flags,
        }
    }
}

/// `CK_INFO`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub cryptoki_version: Version,
    pub manufacturer_id: String,
    pub library_description: String,
    pub library_version: Version,
}

impl From<CK_INFO> for ModuleInfo {
    fn from(info: CK_INFO) -> Self {
        Self {
            cryptoki_version: info.cryptokiVersion.into(),
            manufacturer_id: padded_string(&info.manufacturerID),
            library_description: padded_string(&info.libraryDescription),
            library_version: info.libraryVersion.into(),
        }
    }
}

impl fmt::Display for ModuleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (cryptoki {}, library {})",
            self.manufacturer_id,
            self.library_description,
            self.cryptoki_version,
            self.library_version
        )
    }
}
