//! Session facade over a [`TokenBackend`]
//!
//! A [`Session`] binds a backend to one session handle and one slot, and
//! offers the typed object and operation API on top of it:
//!
//! - Object handling (creation, generation, derivation, destruction, reading)
//! - Streaming operations (encrypt, decrypt, sign, verify, digest) driven
//!   through one [`OperationContext`] per operation kind
//! - Whole-buffer helpers splitting the input into rounds
//! - Session, token, mechanism and module snapshots
//!
//! # Security Considerations
//!
//! - Plaintext scratch buffers are `Zeroizing` and scrubbed on every exit path
//! - Mechanisms are marshalled, and templates encoded, before any token call

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use cosmian_logger::{debug, trace};
use pkcs11_sys::{
    CK_MECHANISM_TYPE, CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE, CK_SLOT_ID,
    CKR_BUFFER_TOO_SMALL, CKR_SIGNATURE_INVALID, CKR_SIGNATURE_LEN_RANGE,
};
use zeroize::Zeroizing;

use crate::{
    HError, HResult, KeyPair, Object, ObjectVariant, render_status,
    backend::TokenBackend,
    hsm_capabilities::{HsmCapabilities, HsmProvider},
    info::{MechanismInfo, ModuleInfo, SessionInfo, TokenInfo},
    mechanism::{HostCapabilities, Mechanism},
    operation::{OperationContext, OperationKind, Phase},
};

/// How many times a whole-buffer helper doubles its scratch buffer when the
/// token answers `CKR_BUFFER_TOO_SMALL`
pub(crate) const MAX_SCRATCH_GROWTH: usize = 4;

fn device<T>(what: &str, outcome: Result<T, CK_RV>) -> HResult<T> {
    outcome.map_err(|rv| {
        debug!("{what} failed: {}", render_status(rv));
        HError::DeviceStatus(rv)
    })
}

/// The part of `output` starting at `offset`.
fn output_window(output: &mut [u8], offset: usize) -> HResult<&mut [u8]> {
    let capacity = output.len();
    output
        .get_mut(offset..)
        .ok_or(HError::InvalidParameterLength {
            field: "output offset",
            expected: capacity,
            actual: offset,
        })
}

fn check_written(written: usize, capacity: usize) -> HResult<usize> {
    if written > capacity {
        return Err(HError::Default(format!(
            "token reported {written} bytes written into a {capacity} bytes buffer"
        )));
    }
    Ok(written)
}

/// Abandons the operation of `kind` when dropped, unless it already ended.
struct AbandonOnDrop<'a> {
    session: &'a Session,
    kind: OperationKind,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if let Ok(mut context) = self.session.context(self.kind) {
            context.abandon();
        }
    }
}

/// A session with a PKCS#11 token.
///
/// # Structure Fields
/// * `backend` - the native call boundary
/// * `handle` - PKCS#11 session handle
/// * `slot_id` - slot the session was opened on
/// * `capabilities` - streaming limits used by the whole-buffer helpers
/// * `host` - native parameter layouts available in this process
/// * one `Mutex<OperationContext>` per operation kind
///
/// Operations of different kinds may run side by side; two callers driving
/// the same kind on the same session serialize on its lock, but still share
/// one init/update/final sequence and must coordinate between themselves.
pub struct Session {
    backend: Arc<dyn TokenBackend>,
    handle: CK_SESSION_HANDLE,
    slot_id: CK_SLOT_ID,
    capabilities: HsmCapabilities,
    host: HostCapabilities,
    encrypt: Mutex<OperationContext>,
    decrypt: Mutex<OperationContext>,
    sign: Mutex<OperationContext>,
    verify: Mutex<OperationContext>,
    digest: Mutex<OperationContext>,
}

impl Session {
    /// Bind `backend` to an already opened session.
    ///
    /// # Arguments
    /// * `backend` - the native call boundary
    /// * `handle` - session handle returned by `C_OpenSession`
    /// * `slot_id` - slot the session was opened on
    /// * `capabilities` - streaming limits of the token
    pub fn new(
        backend: Arc<dyn TokenBackend>,
        handle: CK_SESSION_HANDLE,
        slot_id: CK_SLOT_ID,
        capabilities: HsmCapabilities,
    ) -> Self {
        debug!("binding session {handle} on slot {slot_id}: {capabilities:?}");
        Self {
            backend,
            handle,
            slot_id,
            capabilities,
            host: HostCapabilities::process().clone(),
            encrypt: Mutex::new(OperationContext::new(OperationKind::Encrypt)),
            decrypt: Mutex::new(OperationContext::new(OperationKind::Decrypt)),
            sign: Mutex::new(OperationContext::new(OperationKind::Sign)),
            verify: Mutex::new(OperationContext::new(OperationKind::Verify)),
            digest: Mutex::new(OperationContext::new(OperationKind::Digest)),
        }
    }

    /// Bind a session with the capabilities of the provider `P`.
    pub fn for_provider<P: HsmProvider>(
        backend: Arc<dyn TokenBackend>,
        handle: CK_SESSION_HANDLE,
        slot_id: CK_SLOT_ID,
    ) -> Self {
        Self::new(backend, handle, slot_id, P::capabilities())
    }

    /// Replace the process-wide parameter layouts for this session.
    #[must_use]
    pub fn with_host_capabilities(mut self, host: HostCapabilities) -> Self {
        self.host = host;
        self
    }

    #[must_use]
    pub const fn handle(&self) -> CK_SESSION_HANDLE {
        self.handle
    }

    #[must_use]
    pub const fn slot_id(&self) -> CK_SLOT_ID {
        self.slot_id
    }

    #[must_use]
    pub const fn capabilities(&self) -> &HsmCapabilities {
        &self.capabilities
    }

    fn context(&self, kind: OperationKind) -> HResult<MutexGuard<'_, OperationContext>> {
        let slot = match kind {
            OperationKind::Encrypt => &self.encrypt,
            OperationKind::Decrypt => &self.decrypt,
            OperationKind::Sign => &self.sign,
            OperationKind::Verify => &self.verify,
            OperationKind::Digest => &self.digest,
        };
        slot.lock()
            .map_err(|e| HError::Default(format!("{kind} context lock poisoned: {e}")))
    }

    /// The phase of the operation context of `kind`.
    pub fn operation_phase(&self, kind: OperationKind) -> HResult<Phase> {
        Ok(self.context(kind)?.phase())
    }

    /// Drop the operation of `kind`, running or not, so that a new `init`
    /// is accepted.
    ///
    /// Only the local context is cleared. A token keeping its own state
    /// replaces it on the next `init`, or refuses that `init`; the refusal
    /// is returned to the caller.
    pub fn reset_operation(&self, kind: OperationKind) -> HResult<()> {
        let mut context = self.context(kind)?;
        if context.is_active() {
            debug!("{kind} reset on session {}", self.handle);
        }
        context.reset();
        Ok(())
    }

    /// Check a count reported by the token. An impossible count ends the
    /// operation of `kind`.
    fn checked_written(&self, kind: OperationKind, written: usize, capacity: usize) -> HResult<usize> {
        check_written(written, capacity).inspect_err(|_| {
            if let Ok(mut context) = self.context(kind) {
                context.abandon();
            }
        })
    }

    /// Bind `variant` to `handle` and read its attributes.
    fn bind(&self, variant: ObjectVariant, handle: CK_OBJECT_HANDLE) -> HResult<Object> {
        let mut object = Object::bound(variant, handle)?;
        object.read_all(&*self.backend, self.handle)?;
        Ok(object)
    }

    //
    // Objects
    //

    /// Create an object from a template.
    ///
    /// # Returns
    /// * `HResult<Object>` - the bound object, with its attributes as read back
    ///   from the token
    ///
    /// # Errors
    /// * attribute encoding errors, before the token is called
    /// * `DeviceStatus` if the token refuses the creation or the read
    pub fn create_object(&self, template: &Object) -> HResult<Object> {
        let wire = template.to_wire_template()?;
        debug!("creating {} with {} attributes", template.variant(), wire.len());
        let handle = device(
            "object creation",
            self.backend.create_object(self.handle, &wire),
        )?;
        self.bind(template.variant(), handle)
    }

    /// Generate a secret key.
    ///
    /// # Arguments
    /// * `mechanism` - the key generation mechanism; output parameters, if
    ///   any, are reflected back into it
    /// * `template` - the requested key attributes
    pub fn generate_key(&self, mechanism: &mut Mechanism, template: &Object) -> HResult<Object> {
        let wire = template.to_wire_template()?;
        let mut native = mechanism.to_native_with(&self.host)?;
        let handle = device(
            "key generation",
            self.backend.generate_key(self.handle, &mut native, &wire),
        )?;
        native.complete();
        self.bind(template.variant(), handle)
    }

    /// Generate a key pair from a public and a private template.
    pub fn generate_key_pair(
        &self,
        mechanism: &mut Mechanism,
        public_template: &Object,
        private_template: &Object,
    ) -> HResult<KeyPair> {
        let public_wire = public_template.to_wire_template()?;
        let private_wire = private_template.to_wire_template()?;
        let mut native = mechanism.to_native_with(&self.host)?;
        let (public_handle, private_handle) = device(
            "key pair generation",
            self.backend.generate_key_pair(
                self.handle,
                &mut native,
                &public_wire,
                &private_wire,
            ),
        )?;
        native.complete();
        Ok(KeyPair {
            public_key: self.bind(public_template.variant(), public_handle)?,
            private_key: self.bind(private_template.variant(), private_handle)?,
        })
    }

    /// Derive a key from `base_key`.
    ///
    /// # Returns
    /// * `Ok(Some(object))` - the derived key
    /// * `Ok(None)` - the mechanism returned its keys through its parameters
    ///   (e.g. the TLS key-and-MAC derivations); read them from the
    ///   [`crate::KeyMaterialOut`] of `mechanism`
    ///
    /// # Errors
    /// * `StaleObject` if `base_key` was destroyed
    pub fn derive_key(
        &self,
        mechanism: &mut Mechanism,
        base_key: &Object,
        template: &Object,
    ) -> HResult<Option<Object>> {
        let base = base_key.live_handle()?;
        let wire = template.to_wire_template()?;
        let mut native = mechanism.to_native_with(&self.host)?;
        let derived = device(
            "key derivation",
            self.backend
                .derive_key(self.handle, &mut native, base, &wire),
        )?;
        native.complete();
        derived
            .map(|handle| self.bind(template.variant(), handle))
            .transpose()
    }

    /// Destroy the token object. The in-memory object is kept as a stale
    /// snapshot and refused by later operations.
    pub fn destroy_object(&self, object: &mut Object) -> HResult<()> {
        let handle = object.live_handle()?;
        device(
            "object destruction",
            self.backend.destroy_object(self.handle, handle),
        )?;
        object.mark_destroyed()?;
        debug!("destroyed {} (handle {handle})", object.variant());
        Ok(())
    }

    /// Identify and read the object behind `handle`.
    pub fn read_object(&self, handle: CK_OBJECT_HANDLE) -> HResult<Object> {
        Object::read_from(&*self.backend, self.handle, handle)
    }

    /// Take a fresh snapshot of the attributes of a bound object.
    pub fn refresh_object(&self, object: &mut Object) -> HResult<()> {
        object.read_all(&*self.backend, self.handle)
    }

    //
    // Encryption and decryption
    //

    /// Start an encryption with `key`.
    ///
    /// # Errors
    /// * `OperationAlreadyActive` if an encryption is running on this session
    /// * `StaleObject` if `key` was destroyed
    /// * `ParameterMismatch` or `UnsupportedInHostRuntime`, before the token is called
    pub fn encrypt_init(&self, mechanism: &mut Mechanism, key: &Object) -> HResult<()> {
        let key = key.live_handle()?;
        self.context(OperationKind::Encrypt)?
            .init(mechanism, Some(key), &self.host, |native| {
                self.backend.encrypt_init(self.handle, native, key)
            })
    }

    /// Encrypt one chunk.
    ///
    /// # Arguments
    /// * `input` - the next chunk of plaintext
    /// * `output` - destination buffer
    /// * `offset` - where to start writing in `output`
    ///
    /// # Returns
    /// * `HResult<usize>` - the number of bytes written at `offset`
    ///
    /// # Errors
    /// * `OperationNotActive` if no encryption is running
    /// * `InvalidParameterLength` if `offset` is past the end of `output`
    pub fn encrypt_update(&self, input: &[u8], output: &mut [u8], offset: usize) -> HResult<usize> {
        let window = output_window(output, offset)?;
        let capacity = window.len();
        let written = self.context(OperationKind::Encrypt)?.update(|| {
            self.backend.encrypt_update(self.handle, input, window)
        })?;
        self.checked_written(OperationKind::Encrypt, written, capacity)
    }

    /// Write the last part of the ciphertext and end the encryption.
    pub fn encrypt_final(&self, output: &mut [u8], offset: usize) -> HResult<usize> {
        let window = output_window(output, offset)?;
        let capacity = window.len();
        let written = self
            .context(OperationKind::Encrypt)?
            .finish(|| self.backend.encrypt_final(self.handle, window))?;
        self.checked_written(OperationKind::Encrypt, written, capacity)
    }

    pub fn decrypt_init(&self, mechanism: &mut Mechanism, key: &Object) -> HResult<()> {
        let key = key.live_handle()?;
        self.context(OperationKind::Decrypt)?
            .init(mechanism, Some(key), &self.host, |native| {
                self.backend.decrypt_init(self.handle, native, key)
            })
    }

    /// Decrypt one chunk. See [`Session::encrypt_update`].
    pub fn decrypt_update(&self, input: &[u8], output: &mut [u8], offset: usize) -> HResult<usize> {
        let window = output_window(output, offset)?;
        let capacity = window.len();
        let written = self.context(OperationKind::Decrypt)?.update(|| {
            self.backend.decrypt_update(self.handle, input, window)
        })?;
        self.checked_written(OperationKind::Decrypt, written, capacity)
    }

    pub fn decrypt_final(&self, output: &mut [u8], offset: usize) -> HResult<usize> {
        let window = output_window(output, offset)?;
        let capacity = window.len();
        let written = self
            .context(OperationKind::Decrypt)?
            .finish(|| self.backend.decrypt_final(self.handle, window))?;
        self.checked_written(OperationKind::Decrypt, written, capacity)
    }

    /// Run one streaming call into `scratch`, growing it while the token
    /// asks for more room. The replaced buffers are scrubbed when dropped.
    fn into_scratch<F>(&self, scratch: &mut Zeroizing<Vec<u8>>, mut call: F) -> HResult<usize>
    where
        F: FnMut(&Self, &mut [u8]) -> HResult<usize>,
    {
        for _ in 0..MAX_SCRATCH_GROWTH {
            match call(self, scratch.as_mut_slice()) {
                Err(HError::DeviceStatus(CKR_BUFFER_TOO_SMALL)) => {
                    let grown = scratch.len().saturating_mul(2).max(16);
                    trace!("growing scratch buffer to {grown} bytes");
                    *scratch = Zeroizing::new(vec![0_u8; grown]);
                }
                outcome => return outcome,
            }
        }
        call(self, scratch.as_mut_slice())
    }

    /// Stream `data` through an initialized encryption or decryption,
    /// `max_stream_chunk` bytes per round.
    ///
    /// On any error the operation is abandoned and both buffers are scrubbed.
    fn stream_all(&self, kind: OperationKind, data: &[u8]) -> HResult<Zeroizing<Vec<u8>>> {
        let _abandon = AbandonOnDrop {
            session: self,
            kind,
        };
        let round_capacity = self.capabilities.max_stream_chunk.max(1);
        let slack = self.capabilities.output_slack;
        let mut output = Zeroizing::new(Vec::with_capacity(data.len() + slack));
        let mut scratch = Zeroizing::new(vec![0_u8; round_capacity + slack]);
        let total_length = data.len();
        let mut processed_length = 0;
        for round in data.chunks(round_capacity) {
            trace!(
                "Doing round with {} bytes. {processed_length} of {total_length} done",
                round.len()
            );
            let written = self.into_scratch(&mut scratch, |session, buffer| match kind {
                OperationKind::Encrypt => session.encrypt_update(round, buffer, 0),
                _ => session.decrypt_update(round, buffer, 0),
            })?;
            output.extend_from_slice(
                scratch
                    .get(..written)
                    .ok_or_else(|| HError::Default("Failed to collect round output".to_owned()))?,
            );
            processed_length += round.len();
        }
        let written = self.into_scratch(&mut scratch, |session, buffer| match kind {
            OperationKind::Encrypt => session.encrypt_final(buffer, 0),
            _ => session.decrypt_final(buffer, 0),
        })?;
        output.extend_from_slice(
            scratch
                .get(..written)
                .ok_or_else(|| HError::Default("Failed to collect final output".to_owned()))?,
        );
        Ok(output)
    }

    /// Encrypt a whole buffer through the streaming interface.
    ///
    /// The input is split in rounds of at most `max_stream_chunk` bytes; the
    /// ciphertext is the concatenation of every update output followed by the
    /// final output.
    ///
    /// # Arguments
    /// * `mechanism` - the encryption mechanism
    /// * `key` - the encryption key
    /// * `data` - the plaintext
    ///
    /// # Errors
    /// * every error of [`Session::encrypt_init`], [`Session::encrypt_update`]
    ///   and [`Session::encrypt_final`]
    pub fn encrypt_all(&self, mechanism: &mut Mechanism, key: &Object, data: &[u8]) -> HResult<Vec<u8>> {
        self.encrypt_init(mechanism, key)?;
        let ciphertext = self.stream_all(OperationKind::Encrypt, data)?;
        Ok(ciphertext.to_vec())
    }

    /// Decrypt a whole buffer through the streaming interface.
    ///
    /// # Returns
    /// * `HResult<Zeroizing<Vec<u8>>>` - the plaintext
    pub fn decrypt_all(
        &self,
        mechanism: &mut Mechanism,
        key: &Object,
        data: &[u8],
    ) -> HResult<Zeroizing<Vec<u8>>> {
        self.decrypt_init(mechanism, key)?;
        self.stream_all(OperationKind::Decrypt, data)
    }

    //
    // Signature, verification and digest
    //

    pub fn sign_init(&self, mechanism: &mut Mechanism, key: &Object) -> HResult<()> {
        let key = key.live_handle()?;
        self.context(OperationKind::Sign)?
            .init(mechanism, Some(key), &self.host, |native| {
                self.backend.sign_init(self.handle, native, key)
            })
    }

    pub fn sign_update(&self, data: &[u8]) -> HResult<()> {
        self.context(OperationKind::Sign)?
            .update(|| self.backend.sign_update(self.handle, data))
    }

    pub fn sign_final(&self) -> HResult<Vec<u8>> {
        self.context(OperationKind::Sign)?
            .finish(|| self.backend.sign_final(self.handle))
    }

    /// Sign `data` in one init/update/final sequence.
    pub fn sign(&self, mechanism: &mut Mechanism, key: &Object, data: &[u8]) -> HResult<Vec<u8>> {
        self.sign_init(mechanism, key)?;
        self.sign_update(data)?;
        self.sign_final()
    }

    pub fn verify_init(&self, mechanism: &mut Mechanism, key: &Object) -> HResult<()> {
        let key = key.live_handle()?;
        self.context(OperationKind::Verify)?
            .init(mechanism, Some(key), &self.host, |native| {
                self.backend.verify_init(self.handle, native, key)
            })
    }

    pub fn verify_update(&self, data: &[u8]) -> HResult<()> {
        self.context(OperationKind::Verify)?
            .update(|| self.backend.verify_update(self.handle, data))
    }

    /// End the verification.
    ///
    /// # Returns
    /// * `Ok(true)` - the signature is valid
    /// * `Ok(false)` - the token rejected the signature or its length
    pub fn verify_final(&self, signature: &[u8]) -> HResult<bool> {
        self.context(OperationKind::Verify)?.finish(|| {
            match self.backend.verify_final(self.handle, signature) {
                Ok(()) => Ok(true),
                Err(CKR_SIGNATURE_INVALID | CKR_SIGNATURE_LEN_RANGE) => Ok(false),
                Err(rv) => Err(rv),
            }
        })
    }

    /// Verify `signature` over `data` in one init/update/final sequence.
    pub fn verify(
        &self,
        mechanism: &mut Mechanism,
        key: &Object,
        data: &[u8],
        signature: &[u8],
    ) -> HResult<bool> {
        self.verify_init(mechanism, key)?;
        self.verify_update(data)?;
        self.verify_final(signature)
    }

    pub fn digest_init(&self, mechanism: &mut Mechanism) -> HResult<()> {
        self.context(OperationKind::Digest)?
            .init(mechanism, None, &self.host, |native| {
                self.backend.digest_init(self.handle, native)
            })
    }

    pub fn digest_update(&self, data: &[u8]) -> HResult<()> {
        self.context(OperationKind::Digest)?
            .update(|| self.backend.digest_update(self.handle, data))
    }

    pub fn digest_final(&self) -> HResult<Vec<u8>> {
        self.context(OperationKind::Digest)?
            .finish(|| self.backend.digest_final(self.handle))
    }

    pub fn digest(&self, mechanism: &mut Mechanism, data: &[u8]) -> HResult<Vec<u8>> {
        self.digest_init(mechanism)?;
        self.digest_update(data)?;
        self.digest_final()
    }

    //
    // Snapshots
    //

    pub fn get_session_info(&self) -> HResult<SessionInfo> {
        device(
            "session info",
            self.backend.get_session_info(self.handle),
        )
        .map(SessionInfo::from)
    }

    pub fn get_token_info(&self) -> HResult<TokenInfo> {
        device("token info", self.backend.get_token_info(self.slot_id)).map(TokenInfo::from)
    }

    pub fn get_mechanism_info(&self, mechanism: CK_MECHANISM_TYPE) -> HResult<MechanismInfo> {
        device(
            "mechanism info",
            self.backend.get_mechanism_info(self.slot_id, mechanism),
        )
        .map(MechanismInfo::from)
    }

    pub fn get_module_info(&self) -> HResult<ModuleInfo> {
        device("module info", self.backend.get_info()).map(ModuleInfo::from)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("slot_id", &self.slot_id)
            .field("capabilities", &self.capabilities)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}
