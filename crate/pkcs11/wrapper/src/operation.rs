//! The init/update/final protocol shared by the streaming operations.
//!
//! A context moves `Uninitialized -> Initialized -> Finalized`. `update`
//! and `finish` are only accepted while `Initialized`; `init` is refused while
//! an operation is running. A running operation ends with its final call,
//! with a terminal token error, or when it is abandoned or reset. The token call itself is passed in as a closure,
//! so the context only decides whether a call may happen and what the
//! outcome does to the phase.

use cosmian_logger::{debug, trace};
use pkcs11_sys::{CK_OBJECT_HANDLE, CK_RV, CKR_BUFFER_TOO_SMALL};

use crate::{
    HError, HResult,
    mechanism::{HostCapabilities, Mechanism, WireMechanism},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum OperationKind {
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    Digest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Uninitialized,
    Initialized,
    Finalized,
}

/// State of one operation kind on one session.
#[derive(Debug)]
pub struct OperationContext {
    kind: OperationKind,
    mechanism: Option<Mechanism>,
    key: Option<CK_OBJECT_HANDLE>,
    phase: Phase,
}

impl OperationContext {
    #[must_use]
    pub const fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            mechanism: None,
            key: None,
            phase: Phase::Uninitialized,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        self.kind
    }

    /// The mechanism of the current or last operation.
    #[must_use]
    pub const fn mechanism(&self) -> Option<&Mechanism> {
        self.mechanism.as_ref()
    }

    #[must_use]
    pub const fn key(&self) -> Option<CK_OBJECT_HANDLE> {
        self.key
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.phase == Phase::Initialized
    }

    /// Start an operation.
    ///
    /// The mechanism is marshalled before `call` runs: a mismatched or
    /// unsupported parameter block fails here without reaching the token.
    /// A finalized context may be initialized again.
    ///
    /// # Errors
    /// * `OperationAlreadyActive` if an operation of this kind is running
    /// * marshalling errors of [`Mechanism::to_native_with`]
    /// * `DeviceStatus` if the token refuses the init; the phase is unchanged
    pub fn init<F>(
        &mut self,
        mechanism: &mut Mechanism,
        key: Option<CK_OBJECT_HANDLE>,
        host: &HostCapabilities,
        call: F,
    ) -> HResult<()>
    where
        F: FnOnce(&mut WireMechanism<'_>) -> Result<(), CK_RV>,
    {
        if self.is_active() {
            return Err(HError::OperationAlreadyActive(self.kind));
        }
        debug!("{} init: {mechanism}, key {key:?}", self.kind);
        let mut wire = mechanism.to_native_with(host)?;
        call(&mut wire).map_err(HError::DeviceStatus)?;
        wire.complete();
        self.mechanism = Some(mechanism.clone());
        self.key = key;
        self.phase = Phase::Initialized;
        Ok(())
    }

    /// Run one update call of the active operation.
    ///
    /// A `CKR_BUFFER_TOO_SMALL` answer leaves the operation running so the
    /// caller can retry with more room; any other failure ends it.
    pub fn update<T, F>(&mut self, call: F) -> HResult<T>
    where
        F: FnOnce() -> Result<T, CK_RV>,
    {
        self.ensure_active()?;
        let outcome = call();
        self.settle(outcome, false)
    }

    /// Run the final call of the active operation. Success ends the operation.
    pub fn finish<T, F>(&mut self, call: F) -> HResult<T>
    where
        F: FnOnce() -> Result<T, CK_RV>,
    {
        self.ensure_active()?;
        let outcome = call();
        self.settle(outcome, true)
    }

    /// End a running operation without a final call.
    /// Idle or finished contexts are left untouched.
    pub fn abandon(&mut self) {
        if self.is_active() {
            debug!("{} abandoned", self.kind);
            self.phase = Phase::Finalized;
        }
    }

    /// Forget the local state of the context.
    /// This does not notify the token.
    pub fn reset(&mut self) {
        self.mechanism = None;
        self.key = None;
        self.phase = Phase::Uninitialized;
    }

    fn ensure_active(&self) -> HResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(HError::OperationNotActive(self.kind))
        }
    }

    fn settle<T>(&mut self, outcome: Result<T, CK_RV>, last: bool) -> HResult<T> {
        match outcome {
            Ok(value) => {
                if last {
                    debug!("{} final", self.kind);
                    self.phase = Phase::Finalized;
                }
                Ok(value)
            }
            Err(CKR_BUFFER_TOO_SMALL) => {
                trace!("{}: output buffer too small, operation kept", self.kind);
                Err(HError::DeviceStatus(CKR_BUFFER_TOO_SMALL))
            }
            Err(status) => {
                debug!(
                    "{} aborted by the token: {}",
                    self.kind,
                    crate::render_status(status)
                );
                self.phase = Phase::Finalized;
                Err(HError::DeviceStatus(status))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pkcs11_sys::{CKM_AES_CBC_PAD, CKM_AES_GCM, CKM_SHA256, CKR_DEVICE_ERROR};

    use super::*;
    use crate::{GcmParams, IvParams, ParameterBlock, ParameterFamily};

    fn cbc() -> Mechanism {
        Mechanism::with_parameters(
            CKM_AES_CBC_PAD,
            ParameterBlock::InitializationVector(IvParams::new(vec![0; 16])),
        )
    }

    fn initialized(kind: OperationKind) -> OperationContext {
        let mut context = OperationContext::new(kind);
        context
            .init(&mut cbc(), Some(1), &HostCapabilities::empty(), |_| Ok(()))
            .unwrap();
        context
    }

    #[test]
    fn update_requires_init() {
        let mut context = OperationContext::new(OperationKind::Encrypt);
        let mut called = false;
        let result: HResult<usize> = context.update(|| {
            called = true;
            Ok(0)
        });
        assert_eq!(
            result,
            Err(HError::OperationNotActive(OperationKind::Encrypt))
        );
        assert!(!called);
        assert_eq!(
            context.finish(|| Ok(0)),
            Err(HError::OperationNotActive(OperationKind::Encrypt))
        );
    }

    #[test]
    fn double_init_is_refused() {
        let mut context = initialized(OperationKind::Sign);
        assert_eq!(
            context.init(&mut cbc(), Some(1), &HostCapabilities::empty(), |_| Ok(())),
            Err(HError::OperationAlreadyActive(OperationKind::Sign))
        );
        assert!(context.is_active());
    }

    #[test]
    fn final_ends_and_init_restarts() {
        let mut context = initialized(OperationKind::Digest);
        assert_eq!(context.update(|| Ok(3)), Ok(3));
        assert_eq!(context.finish(|| Ok(0)), Ok(0));
        assert_eq!(context.phase(), Phase::Finalized);
        assert_eq!(
            context.update(|| Ok(0)),
            Err(HError::OperationNotActive(OperationKind::Digest))
        );
        let mut digest = Mechanism::new(CKM_SHA256);
        context
            .init(&mut digest, None, &HostCapabilities::empty(), |_| Ok(()))
            .unwrap();
        assert_eq!(context.mechanism(), Some(&digest));
        assert_eq!(context.key(), None);
    }

    #[test]
    fn device_errors_end_the_operation() {
        let mut context = initialized(OperationKind::Decrypt);
        assert_eq!(
            context.update::<usize, _>(|| Err(CKR_BUFFER_TOO_SMALL)),
            Err(HError::DeviceStatus(CKR_BUFFER_TOO_SMALL))
        );
        assert!(context.is_active());
        assert_eq!(
            context.update::<usize, _>(|| Err(CKR_DEVICE_ERROR)),
            Err(HError::DeviceStatus(CKR_DEVICE_ERROR))
        );
        assert_eq!(context.phase(), Phase::Finalized);
    }

    #[test]
    fn abandon_only_ends_running_operations() {
        let mut context = OperationContext::new(OperationKind::Encrypt);
        context.abandon();
        assert_eq!(context.phase(), Phase::Uninitialized);

        let mut context = initialized(OperationKind::Encrypt);
        context.abandon();
        assert_eq!(context.phase(), Phase::Finalized);
        assert_eq!(context.key(), Some(1));
        assert_eq!(
            context.update(|| Ok(0)),
            Err(HError::OperationNotActive(OperationKind::Encrypt))
        );
        context
            .init(&mut cbc(), Some(2), &HostCapabilities::empty(), |_| Ok(()))
            .unwrap();
        assert!(context.is_active());
    }

    #[test]
    fn marshalling_errors_precede_the_token() {
        let mut context = OperationContext::new(OperationKind::Encrypt);
        let mut calls = 0;
        let mut gcm = Mechanism::with_parameters(
            CKM_AES_GCM,
            ParameterBlock::Gcm(GcmParams::new(vec![0; 12], Vec::new(), 128).unwrap()),
        );
        assert_eq!(
            context.init(&mut gcm, Some(1), &HostCapabilities::empty(), |_| {
                calls += 1;
                Ok(())
            }),
            Err(HError::UnsupportedInHostRuntime(ParameterFamily::Gcm))
        );
        let mut mismatched = Mechanism::new(CKM_AES_CBC_PAD);
        assert!(matches!(
            context.init(&mut mismatched, Some(1), &HostCapabilities::empty(), |_| {
                calls += 1;
                Ok(())
            }),
            Err(HError::ParameterMismatch { .. })
        ));
        assert_eq!(calls, 0);
        assert_eq!(context.phase(), Phase::Uninitialized);
    }

    #[test]
    fn refused_init_leaves_context_idle() {
        let mut context = OperationContext::new(OperationKind::Verify);
        assert_eq!(
            context.init(&mut cbc(), Some(9), &HostCapabilities::empty(), |_| Err(
                CKR_DEVICE_ERROR
            )),
            Err(HError::DeviceStatus(CKR_DEVICE_ERROR))
        );
        assert_eq!(context.phase(), Phase::Uninitialized);
        context.reset();
        assert_eq!(context.mechanism(), None);
    }
}
