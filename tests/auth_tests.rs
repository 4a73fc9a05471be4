//! Tests for the flash-backed authorization store.

mod common;

use access_terminal::{AuthorizationStore, StorageError};
use common::{test_layout, MemFlash};

fn open(flash: MemFlash) -> AuthorizationStore<MemFlash> {
    AuthorizationStore::open(flash, test_layout().auth).unwrap()
}

// ============================================================================
// Tests for get / set
// ============================================================================

#[test]
fn test_unknown_identifier_is_none() {
    let mut auth = open(MemFlash::for_tests());
    assert_eq!(auth.get(b"ABCD"), Ok(None));
}

#[test]
fn test_set_then_get() {
    let mut auth = open(MemFlash::for_tests());
    auth.set(b"ABCD", 1).unwrap();
    assert_eq!(auth.get(b"ABCD"), Ok(Some(1)));
    assert_eq!(auth.get(b"ABC"), Ok(None));
    assert_eq!(auth.get(b"ABCDE"), Ok(None));
}

#[test]
fn test_zero_permission_is_stored() {
    let mut auth = open(MemFlash::for_tests());
    auth.set(&[0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66], 0).unwrap();
    assert_eq!(auth.get(&[0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]), Ok(Some(0)));
}

#[test]
fn test_overwrite_keeps_latest() {
    let mut auth = open(MemFlash::for_tests());
    auth.set(b"ABCD", 1).unwrap();
    auth.set(b"ABCD", 0).unwrap();
    auth.set(b"ABCD", 7).unwrap();
    assert_eq!(auth.get(b"ABCD"), Ok(Some(7)));
}

#[test]
fn test_many_identifiers() {
    let mut auth = open(MemFlash::for_tests());
    for i in 0..50u8 {
        auth.set(&[b'K', i], i.wrapping_add(1)).unwrap();
    }
    for i in 0..50u8 {
        assert_eq!(auth.get(&[b'K', i]), Ok(Some(i.wrapping_add(1))));
    }
}

#[test]
fn test_oversized_identifier() {
    let mut auth = open(MemFlash::for_tests());
    let long = [0x41u8; 200];
    assert_eq!(auth.get(&long), Ok(None));
    assert_eq!(auth.set(&long, 1), Err(StorageError::Serialization));
}

#[test]
fn test_probe_key_is_hidden() {
    let mut auth = open(MemFlash::for_tests());
    assert_eq!(auth.get(b"\0probe"), Ok(None));
    assert_eq!(auth.set(b"\0probe", 1), Err(StorageError::Serialization));
}

// ============================================================================
// Tests for durability
// ============================================================================

#[test]
fn test_records_survive_reopen() {
    let mut auth = open(MemFlash::for_tests());
    auth.set(b"ABCD", 3).unwrap();
    let flash = auth.close();

    let mut auth = open(flash);
    assert_eq!(auth.get(b"ABCD"), Ok(Some(3)));
}

#[test]
fn test_reopen_does_not_rewrite_probe() {
    let auth = open(MemFlash::for_tests());
    let flash = auth.close();
    let writes = flash.writes;

    let auth = open(flash);
    assert_eq!(auth.close().writes, writes);
}

#[test]
fn test_corrupted_store_erased_and_reinitialised() {
    let mut auth = open(MemFlash::for_tests());
    auth.set(b"ABCD", 1).unwrap();
    let mut flash = auth.close();
    flash.zero(test_layout().auth);

    let mut auth = open(flash);
    assert_eq!(auth.get(b"ABCD"), Ok(None));
    auth.set(b"WXYZ", 2).unwrap();

    let mut auth = open(auth.close());
    assert_eq!(auth.get(b"WXYZ"), Ok(Some(2)));
    assert_eq!(auth.get(b"ABCD"), Ok(None));
}

#[test]
fn test_store_stays_in_its_region() {
    let mut auth = open(MemFlash::for_tests());
    auth.set(b"ABCD", 1).unwrap();
    let flash = auth.close();
    let end = test_layout().auth.end as usize;
    assert!(flash.data[end..].iter().all(|&b| b == 0xFF));
}
