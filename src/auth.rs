//! Authorization store: credential identifier → permission byte.
//!
//! Records live in a `sequential-storage` map on their own flash region.
//! Permission 0 means "known but denied"; an identifier without a record is
//! reported as `None`, never as a default byte.

use core::ops::Range;

use embedded_storage_async::nor_flash::NorFlash;

use crate::storage::{self, IdentifierKey, StorageError};

// Probe record written on open so a freshly erased region is validated
// end-to-end (write, then read back) before the first lookup.
const PROBE_KEY: &[u8] = b"\0probe";
const PROBE_VALUE: u8 = 123;

/// Durable credential → permission map.
pub struct AuthorizationStore<S: NorFlash> {
    flash: S,
    range: Range<u32>,
}

impl<S: NorFlash> AuthorizationStore<S> {
    /// Open the store on `range`, erasing it if the map is corrupted.
    pub fn open(mut flash: S, range: Range<u32>) -> Result<Self, StorageError> {
        let probe = probe_key();
        match storage::fetch_value::<_, u8, _>(&mut flash, range.clone(), &probe) {
            Ok(Some(_)) => {}
            Ok(None) => {
                storage::store_value(&mut flash, range.clone(), &probe, &PROBE_VALUE)?;
            }
            Err(StorageError::Corrupted) => {
                log::error!(
                    "auth: store corrupted, erasing 0x{:X}..0x{:X} (all records lost)",
                    range.start,
                    range.end
                );
                storage::erase_range(&mut flash, range.clone())?;
                storage::store_value(&mut flash, range.clone(), &probe, &PROBE_VALUE)?;
            }
            Err(e) => return Err(e),
        }
        log::info!("auth: store open at 0x{:X}", range.start);
        Ok(Self { flash, range })
    }

    /// Look up the permission byte for `identifier`.
    pub fn get(&mut self, identifier: &[u8]) -> Result<Option<u8>, StorageError> {
        let Some(key) = IdentifierKey::from_slice(identifier) else {
            // Longer than any storable key, so it cannot be on record.
            return Ok(None);
        };
        if key.0.as_slice() == PROBE_KEY {
            return Ok(None);
        }
        storage::fetch_value(&mut self.flash, self.range.clone(), &key)
    }

    /// Store `permission` for `identifier`. Durable once this returns `Ok`.
    pub fn set(&mut self, identifier: &[u8], permission: u8) -> Result<(), StorageError> {
        let key = IdentifierKey::from_slice(identifier).ok_or(StorageError::Serialization)?;
        if key.0.as_slice() == PROBE_KEY {
            return Err(StorageError::Serialization);
        }
        storage::store_value(&mut self.flash, self.range.clone(), &key, &permission)?;
        log::debug!("auth: stored permission {} for {} byte id", permission, identifier.len());
        Ok(())
    }

    /// Close the store and hand the flash back.
    pub fn close(self) -> S {
        self.flash
    }
}

fn probe_key() -> IdentifierKey {
    // PROBE_KEY is far below the identifier capacity.
    IdentifierKey(crate::Identifier::from_slice(PROBE_KEY).unwrap_or_default())
}
