use std::thread;

use cosmian_logger::info;
use pkcs11_sys::{CKM_AES_MAC, CKR_BUFFER_TOO_SMALL, CKR_DEVICE_ERROR};

use super::{
    SESSION_HANDLE, aes_key, cbc, random_bytes, session_with,
    soft_token::{AES_BLOCK_SIZE, StreamFault, XOR_DIGEST, cbc_pad_reference},
};
use crate::{
    HError, HResult, HsmCapabilities, Mechanism, OperationKind, Phase, Session, TokenBackend,
    session::MAX_SCRATCH_GROWTH,
};

#[test]
fn chunked_encryption_matches_reference() -> HResult<()> {
    let (_token, session) = session_with(HsmCapabilities::default());
    let key_bytes = random_bytes::<16>()?;
    let iv = random_bytes::<16>()?;
    let key = aes_key(&session, &key_bytes)?;
    let data = random_bytes::<1024>()?;

    session.encrypt_init(&mut cbc(iv), &key)?;
    let mut ciphertext = vec![0_u8; data.len() + AES_BLOCK_SIZE];
    let mut written = 0;
    for chunk in data.chunks(64) {
        written += session.encrypt_update(chunk, &mut ciphertext, written)?;
    }
    written += session.encrypt_final(&mut ciphertext, written)?;
    ciphertext.truncate(written);
    assert_eq!(
        session.operation_phase(OperationKind::Encrypt)?,
        Phase::Finalized
    );

    let reference = cbc_pad_reference(&key_bytes, &iv, &data);
    assert_eq!(ciphertext, reference);
    assert_eq!(session.encrypt_all(&mut cbc(iv), &key, &data)?, reference);
    Ok(())
}

#[test]
fn whole_buffer_round_trip() -> HResult<()> {
    let (_token, session) = session_with(HsmCapabilities::default());
    let key = aes_key(&session, &random_bytes::<16>()?)?;
    let iv = random_bytes::<16>()?;
    // not a multiple of the block size nor of the round size
    let data = random_bytes::<9_999>()?;

    let ciphertext = session.encrypt_all(&mut cbc(iv), &key, &data)?;
    assert_eq!(ciphertext.len(), 10_000);
    let plaintext = session.decrypt_all(&mut cbc(iv), &key, &ciphertext)?;
    assert_eq!(plaintext.as_slice(), data.as_slice());
    Ok(())
}

#[test]
fn whole_buffer_helpers_grow_their_scratch() -> HResult<()> {
    let (_token, session) = session_with(HsmCapabilities {
        max_stream_chunk: 40,
        output_slack: 0,
    });
    let key_bytes = random_bytes::<16>()?;
    let iv = random_bytes::<16>()?;
    let key = aes_key(&session, &key_bytes)?;
    let data = random_bytes::<333>()?;

    let ciphertext = session.encrypt_all(&mut cbc(iv), &key, &data)?;
    assert_eq!(ciphertext, cbc_pad_reference(&key_bytes, &iv, &data));
    let plaintext = session.decrypt_all(&mut cbc(iv), &key, &ciphertext)?;
    assert_eq!(plaintext.as_slice(), data.as_slice());
    Ok(())
}

#[test]
fn update_without_init_never_reaches_the_token() -> HResult<()> {
    let (token, session) = session_with(HsmCapabilities::default());
    token.reset_calls();
    let mut output = [0_u8; 32];
    assert_eq!(
        session.encrypt_update(b"data", &mut output, 0),
        Err(HError::OperationNotActive(OperationKind::Encrypt))
    );
    assert_eq!(
        session.decrypt_final(&mut output, 0),
        Err(HError::OperationNotActive(OperationKind::Decrypt))
    );
    assert_eq!(
        session.sign_update(b"data"),
        Err(HError::OperationNotActive(OperationKind::Sign))
    );
    assert_eq!(
        session.digest_final(),
        Err(HError::OperationNotActive(OperationKind::Digest))
    );
    assert_eq!(token.calls(), 0);
    Ok(())
}

#[test]
fn second_init_is_refused() -> HResult<()> {
    let (_token, session) = session_with(HsmCapabilities::default());
    let key = aes_key(&session, &random_bytes::<16>()?)?;
    session.encrypt_init(&mut cbc([0; 16]), &key)?;
    assert_eq!(
        session.encrypt_init(&mut cbc([1; 16]), &key),
        Err(HError::OperationAlreadyActive(OperationKind::Encrypt))
    );
    assert_eq!(
        session.operation_phase(OperationKind::Encrypt)?,
        Phase::Initialized
    );
    Ok(())
}

#[test]
fn offset_past_the_output_is_refused_locally() -> HResult<()> {
    let (token, session) = session_with(HsmCapabilities::default());
    let key = aes_key(&session, &random_bytes::<16>()?)?;
    session.encrypt_init(&mut cbc([0; 16]), &key)?;
    token.reset_calls();

    let mut output = [0_u8; 16];
    assert_eq!(
        session.encrypt_update(&[0; 16], &mut output, 17),
        Err(HError::InvalidParameterLength {
            field: "output offset",
            expected: 16,
            actual: 17,
        })
    );
    assert_eq!(token.calls(), 0);
    // an offset at the very end leaves an empty window, which is the token's call
    assert_eq!(
        session.encrypt_update(&[0; 16], &mut output, 16),
        Err(HError::DeviceStatus(CKR_BUFFER_TOO_SMALL))
    );
    assert_eq!(token.calls(), 1);
    Ok(())
}

#[test]
fn short_output_keeps_the_operation() -> HResult<()> {
    let (_token, session) = session_with(HsmCapabilities::default());
    let key_bytes = random_bytes::<16>()?;
    let key = aes_key(&session, &key_bytes)?;
    let data = random_bytes::<48>()?;

    session.encrypt_init(&mut cbc([7; 16]), &key)?;
    let mut small = [0_u8; 16];
    assert_eq!(
        session.encrypt_update(&data, &mut small, 0),
        Err(HError::DeviceStatus(CKR_BUFFER_TOO_SMALL))
    );
    assert_eq!(
        session.operation_phase(OperationKind::Encrypt)?,
        Phase::Initialized
    );

    let mut output = [0_u8; 64];
    let mut written = session.encrypt_update(&data, &mut output, 0)?;
    written += session.encrypt_final(&mut output, written)?;
    assert_eq!(
        output[..written],
        cbc_pad_reference(&key_bytes, &[7; 16], &data)[..]
    );
    Ok(())
}

#[test]
fn unretried_short_output_can_be_reset() -> HResult<()> {
    let (_token, session) = session_with(HsmCapabilities::default());
    let key_bytes = random_bytes::<16>()?;
    let key = aes_key(&session, &key_bytes)?;
    let data = random_bytes::<48>()?;

    session.encrypt_init(&mut cbc([5; 16]), &key)?;
    assert_eq!(
        session.encrypt_update(&[1; 32], &mut [], 0),
        Err(HError::DeviceStatus(CKR_BUFFER_TOO_SMALL))
    );
    assert_eq!(
        session.encrypt_all(&mut cbc([5; 16]), &key, &data),
        Err(HError::OperationAlreadyActive(OperationKind::Encrypt))
    );

    session.reset_operation(OperationKind::Encrypt)?;
    assert_eq!(
        session.operation_phase(OperationKind::Encrypt)?,
        Phase::Uninitialized
    );
    assert_eq!(
        session.encrypt_all(&mut cbc([5; 16]), &key, &data)?,
        cbc_pad_reference(&key_bytes, &[5; 16], &data)
    );
    // resetting an idle context is harmless
    session.reset_operation(OperationKind::Digest)?;
    Ok(())
}

#[test]
fn exhausted_scratch_growth_abandons_the_operation() -> HResult<()> {
    let (token, session) = session_with(HsmCapabilities {
        max_stream_chunk: 64,
        output_slack: 16,
    });
    let key_bytes = random_bytes::<16>()?;
    let key = aes_key(&session, &key_bytes)?;
    let data = random_bytes::<200>()?;

    token.set_stream_fault(Some(StreamFault::NoRoom));
    token.reset_calls();
    assert_eq!(
        session.encrypt_all(&mut cbc([0; 16]), &key, &data),
        Err(HError::DeviceStatus(CKR_BUFFER_TOO_SMALL))
    );
    // one init, then every allowed growth plus the last attempt
    assert_eq!(token.calls(), MAX_SCRATCH_GROWTH + 2);
    assert_eq!(
        session.operation_phase(OperationKind::Encrypt)?,
        Phase::Finalized
    );
    assert_eq!(
        session.decrypt_all(&mut cbc([0; 16]), &key, &[0; 64]),
        Err(HError::DeviceStatus(CKR_BUFFER_TOO_SMALL))
    );
    assert_eq!(
        session.operation_phase(OperationKind::Decrypt)?,
        Phase::Finalized
    );

    token.set_stream_fault(None);
    assert_eq!(
        session.encrypt_all(&mut cbc([0; 16]), &key, &data)?,
        cbc_pad_reference(&key_bytes, &[0; 16], &data)
    );
    Ok(())
}

#[test]
fn over_reported_output_abandons_the_operation() -> HResult<()> {
    let (token, session) = session_with(HsmCapabilities::default());
    let key_bytes = random_bytes::<16>()?;
    let key = aes_key(&session, &key_bytes)?;
    token.set_stream_fault(Some(StreamFault::OverReport(1 << 20)));

    session.encrypt_init(&mut cbc([0; 16]), &key)?;
    let mut output = [0_u8; 48];
    assert!(matches!(
        session.encrypt_update(&[1; 32], &mut output, 0),
        Err(HError::Default(_))
    ));
    assert_eq!(
        session.operation_phase(OperationKind::Encrypt)?,
        Phase::Finalized
    );

    assert!(matches!(
        session.decrypt_all(&mut cbc([0; 16]), &key, &[0; 64]),
        Err(HError::Default(_))
    ));
    assert_eq!(
        session.operation_phase(OperationKind::Decrypt)?,
        Phase::Finalized
    );

    token.set_stream_fault(None);
    let data = random_bytes::<40>()?;
    assert_eq!(
        session.encrypt_all(&mut cbc([0; 16]), &key, &data)?,
        cbc_pad_reference(&key_bytes, &[0; 16], &data)
    );
    Ok(())
}

#[test]
fn device_failure_aborts_and_init_restarts() -> HResult<()> {
    let (token, session) = session_with(HsmCapabilities::default());
    let key = aes_key(&session, &random_bytes::<16>()?)?;
    let mut output = [0_u8; 64];

    session.encrypt_init(&mut cbc([0; 16]), &key)?;
    token.fail_next(CKR_DEVICE_ERROR);
    let error = session
        .encrypt_update(&[1; 32], &mut output, 0)
        .unwrap_err();
    assert_eq!(error.device_status(), Some(CKR_DEVICE_ERROR));
    assert!(error.to_string().contains("CKR_DEVICE_ERROR"));
    assert_eq!(
        session.operation_phase(OperationKind::Encrypt)?,
        Phase::Finalized
    );
    assert_eq!(
        session.encrypt_update(&[1; 32], &mut output, 0),
        Err(HError::OperationNotActive(OperationKind::Encrypt))
    );

    session.encrypt_init(&mut cbc([0; 16]), &key)?;
    assert_eq!(session.encrypt_update(&[1; 32], &mut output, 0)?, 32);
    Ok(())
}

#[test]
fn mac_sign_and_verify() -> HResult<()> {
    let (_token, session) = session_with(HsmCapabilities::default());
    let key = aes_key(&session, &random_bytes::<16>()?)?;
    let data = random_bytes::<100>()?;

    let signature = session.sign(&mut Mechanism::new(CKM_AES_MAC), &key, &data)?;
    assert_eq!(signature.len(), AES_BLOCK_SIZE / 2);

    session.sign_init(&mut Mechanism::new(CKM_AES_MAC), &key)?;
    for chunk in data.chunks(7) {
        session.sign_update(chunk)?;
    }
    assert_eq!(session.sign_final()?, signature);

    assert!(session.verify(&mut Mechanism::new(CKM_AES_MAC), &key, &data, &signature)?);
    let mut tampered = signature.clone();
    tampered[0] ^= 0x01;
    assert!(!session.verify(&mut Mechanism::new(CKM_AES_MAC), &key, &data, &tampered)?);
    assert!(!session.verify(
        &mut Mechanism::new(CKM_AES_MAC),
        &key,
        &data,
        &signature[..4]
    )?);
    assert_eq!(
        session.operation_phase(OperationKind::Verify)?,
        Phase::Finalized
    );
    Ok(())
}

#[test]
fn digest_does_not_depend_on_chunking() -> HResult<()> {
    let (_token, session) = session_with(HsmCapabilities::default());
    let data = random_bytes::<500>()?;
    let one_shot = session.digest(&mut Mechanism::new(XOR_DIGEST), &data)?;

    session.digest_init(&mut Mechanism::new(XOR_DIGEST))?;
    for chunk in data.chunks(33) {
        session.digest_update(chunk)?;
    }
    assert_eq!(session.digest_final()?, one_shot);
    Ok(())
}

#[test]
fn different_kinds_run_side_by_side() -> HResult<()> {
    let (_token, session) = session_with(HsmCapabilities::default());
    let key_bytes = random_bytes::<16>()?;
    let key = aes_key(&session, &key_bytes)?;
    let data = random_bytes::<64>()?;

    session.encrypt_init(&mut cbc([3; 16]), &key)?;
    session.sign_init(&mut Mechanism::new(CKM_AES_MAC), &key)?;
    session.digest_init(&mut Mechanism::new(XOR_DIGEST))?;

    let mut output = [0_u8; 96];
    let mut written = 0;
    for chunk in data.chunks(16) {
        written += session.encrypt_update(chunk, &mut output, written)?;
        session.sign_update(chunk)?;
        session.digest_update(chunk)?;
    }
    written += session.encrypt_final(&mut output, written)?;
    let signature = session.sign_final()?;
    session.digest_final()?;

    assert_eq!(
        output[..written],
        cbc_pad_reference(&key_bytes, &[3; 16], &data)[..]
    );
    assert!(session.verify(&mut Mechanism::new(CKM_AES_MAC), &key, &data, &signature)?);
    Ok(())
}

#[test]
fn sessions_stream_concurrently() -> HResult<()> {
    let (token, first) = session_with(HsmCapabilities::default());
    let backend: std::sync::Arc<dyn TokenBackend> = token;
    let sessions: Vec<Session> = (1..=4)
        .map(|offset| {
            Session::new(
                backend.clone(),
                SESSION_HANDLE + offset,
                0,
                HsmCapabilities {
                    max_stream_chunk: 100,
                    output_slack: 16,
                },
            )
        })
        .chain(std::iter::once(first))
        .collect();
    let key_bytes = random_bytes::<16>()?;
    let key = aes_key(&sessions[0], &key_bytes)?;
    let data = random_bytes::<4096>()?;
    let expected = cbc_pad_reference(&key_bytes, &[9; 16], &data);

    let results: Vec<HResult<Vec<u8>>> = thread::scope(|scope| {
        let handles: Vec<_> = sessions
            .iter()
            .map(|session| scope.spawn(|| session.encrypt_all(&mut cbc([9; 16]), &key, &data)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect()
    });
    for result in results {
        assert_eq!(result?, expected);
    }
    info!("{} sessions produced identical ciphertexts", sessions.len());
    Ok(())
}
