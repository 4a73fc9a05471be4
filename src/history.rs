//! Append-only scan history on a raw flash region.
//!
//! Data layout: fixed blocks of `uid_size + 4` bytes from the start of the
//! region, no header and no checksum:
//!   [uid_size bytes: identifier, zero padded or truncated]
//!   [4 bytes: Unix timestamp, little endian]
//!
//! The write cursor, block size and sync cursor live in a separate
//! `sequential-storage` map (the control store). An append programs the block
//! first and commits the advanced cursor second. If power is lost between the
//! two, the block at the persisted cursor is no longer blank; `open` adopts it
//! because erased NOR flash cannot be programmed over a second time. Blank
//! blocks below the persisted cursor are dropped, and stale data past it is
//! erased, so an interrupted clear never leaves phantom entries behind.
//!
//! History sync uses peek/commit: `peek_unsynced` returns entries the radio
//! has not acknowledged yet and `commit_synced` advances the persisted sync
//! cursor only after the uplink was confirmed.

use core::ops::Range;

use embedded_storage_async::nor_flash::NorFlash;
use heapless::Vec;

use crate::storage::{self, ControlKey, StorageError};

/// Largest identifier width a history block can carry.
pub const MAX_UID_SIZE: usize = 32;
/// Timestamp width in a history block.
pub const TIMESTAMP_LEN: usize = 4;

/// Reaction to a stored block size that disagrees with the requested one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UidSizePolicy {
    /// Log a warning and keep using the stored block size.
    AdoptStored,
    /// Fail the open.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("uid size {0} is outside 1..={MAX_UID_SIZE}")]
    InvalidUidSize(usize),
    #[error("stored uid size {stored} does not match requested {requested}")]
    UidSizeMismatch { stored: usize, requested: usize },
    #[error("history region is full")]
    Full,
    #[error("entry {index} out of range ({count} entries)")]
    OutOfRange { index: u32, count: u32 },
    #[error("cursor {0} is not a multiple of the block size")]
    MisalignedCursor(u32),
}

/// One decoded history block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HistoryEntry {
    pub identifier: Vec<u8, MAX_UID_SIZE>,
    pub timestamp: u32,
}

/// Flash-backed scan history.
pub struct HistoryLog<S: NorFlash> {
    flash: S,
    control: Range<u32>,
    data: Range<u32>,
    block_size: u32,
    cursor: u32,
    sync_cursor: u32,
}

impl<S: NorFlash> HistoryLog<S> {
    /// Open the log, initialising the control store on first use.
    pub fn open(
        mut flash: S,
        control: Range<u32>,
        data: Range<u32>,
        uid_size: usize,
        policy: UidSizePolicy,
    ) -> Result<Self, HistoryError> {
        if uid_size == 0 || uid_size > MAX_UID_SIZE {
            return Err(HistoryError::InvalidUidSize(uid_size));
        }
        let requested = (uid_size + TIMESTAMP_LEN) as u32;

        let stored = match storage::fetch_value::<_, u32, _>(&mut flash, control.clone(), &ControlKey::BlockSize) {
            Err(StorageError::Corrupted) => {
                log::error!("history: control store corrupted, erasing log");
                storage::erase_range(&mut flash, control.clone())?;
                storage::erase_range(&mut flash, data.clone())?;
                None
            }
            other => other?,
        };

        let mut log = Self {
            flash,
            control,
            data,
            block_size: requested,
            cursor: 0,
            sync_cursor: 0,
        };

        match stored {
            None => {
                log::info!("history: initialising log, block size {}", requested);
                log.scrub_from(0)?;
                log.write_control(ControlKey::BlockSize, requested)?;
                log.write_control(ControlKey::Cursor, 0)?;
                log.write_control(ControlKey::SyncCursor, 0)?;
            }
            Some(stored_size) => {
                let stored_uid = (stored_size as usize).saturating_sub(TIMESTAMP_LEN);
                if stored_size != requested {
                    match policy {
                        UidSizePolicy::Reject => {
                            return Err(HistoryError::UidSizeMismatch {
                                stored: stored_uid,
                                requested: uid_size,
                            })
                        }
                        UidSizePolicy::AdoptStored => log::warn!(
                            "history: stored uid size {} differs from requested {}, using stored",
                            stored_uid,
                            uid_size
                        ),
                    }
                }
                if stored_uid == 0 || stored_uid > MAX_UID_SIZE {
                    return Err(HistoryError::InvalidUidSize(stored_uid));
                }
                log.block_size = stored_size;
                log.cursor = log.read_control(ControlKey::Cursor)?.unwrap_or(0);
                log.sync_cursor = log.read_control(ControlKey::SyncCursor)?.unwrap_or(0);
                log.recover()?;
                log.scrub_from(log.cursor)?;
            }
        }

        log::info!(
            "history: {} entries ({} unsynced), block size {}",
            log.get_nb_entries(),
            log.pending_sync(),
            log.block_size
        );
        Ok(log)
    }

    /// Repair cursors after an interrupted append or clear.
    ///
    /// A block that reads back as all `0xFF` counts as unwritten. Only an
    /// identifier of `0xFF` bytes stamped `u32::MAX` collides with that.
    fn recover(&mut self) -> Result<(), HistoryError> {
        let stored = self.cursor;
        let limit = self.capacity_bytes();
        if self.cursor > limit || self.cursor % self.block_size != 0 {
            let capped = self.cursor.min(limit);
            let repaired = capped - capped % self.block_size;
            log::error!("history: cursor {} invalid, truncating to {}", self.cursor, repaired);
            self.cursor = repaired;
        }

        // Blank blocks below the cursor were erased after their cursor commit.
        let mut dropped = 0;
        while self.cursor >= self.block_size
            && storage::is_blank(
                &mut self.flash,
                self.data.start + self.cursor - self.block_size,
                self.block_size as usize,
            )?
        {
            self.cursor -= self.block_size;
            dropped += 1;
        }
        if dropped > 0 {
            log::error!("history: dropped {} erased block(s) below the cursor", dropped);
        }

        // A programmed block past the cursor means the cursor commit was lost.
        let mut adopted = 0;
        while self.cursor + self.block_size <= self.capacity_bytes()
            && !storage::is_blank(
                &mut self.flash,
                self.data.start + self.cursor,
                self.block_size as usize,
            )?
        {
            self.cursor += self.block_size;
            adopted += 1;
        }
        if adopted > 0 {
            log::warn!("history: adopted {} block(s) written before power loss", adopted);
        }
        if self.cursor != stored {
            self.write_control(ControlKey::Cursor, self.cursor)?;
        }

        if self.sync_cursor > self.cursor || self.sync_cursor % self.block_size != 0 {
            log::warn!("history: sync cursor {} invalid, resetting", self.sync_cursor);
            self.sync_cursor = 0;
            self.write_control(ControlKey::SyncCursor, 0)?;
        }
        Ok(())
    }

    /// Erase stale data past `cursor`, left by an interrupted clear or by a
    /// region that was never erased. Blocks before `cursor` are kept.
    fn scrub_from(&mut self, cursor: u32) -> Result<(), HistoryError> {
        let page = S::ERASE_SIZE as u32;
        let start = self.data.start + cursor;
        if storage::is_blank_range(&mut self.flash, start..self.data.end)? {
            return Ok(());
        }
        let erase_from = start.next_multiple_of(page);
        let erase_to = self.data.end - self.data.end % page;
        if erase_from != start
            && !storage::is_blank_range(&mut self.flash, start..erase_from.min(self.data.end))?
        {
            log::error!("history: stale bytes after cursor {} share its page, left in place", cursor);
        }
        if erase_from < erase_to {
            log::warn!("history: erasing stale data from offset {}", erase_from - self.data.start);
            storage::erase_range(&mut self.flash, erase_from..erase_to)?;
        }
        Ok(())
    }

    fn read_control(&mut self, key: ControlKey) -> Result<Option<u32>, HistoryError> {
        Ok(storage::fetch_value(&mut self.flash, self.control.clone(), &key)?)
    }

    fn write_control(&mut self, key: ControlKey, value: u32) -> Result<(), HistoryError> {
        storage::store_value(&mut self.flash, self.control.clone(), &key, &value)?;
        Ok(())
    }

    fn capacity_bytes(&self) -> u32 {
        let len = self.data.end - self.data.start;
        len - len % self.block_size
    }

    pub fn get_block_size(&self) -> u32 {
        self.block_size
    }

    pub fn get_uid_size(&self) -> usize {
        self.block_size as usize - TIMESTAMP_LEN
    }

    pub fn get_cursor(&self) -> u32 {
        self.cursor
    }

    pub fn get_nb_entries(&self) -> u32 {
        self.cursor / self.block_size
    }

    /// Number of blocks the region can hold.
    pub fn capacity(&self) -> u32 {
        self.capacity_bytes() / self.block_size
    }

    /// Move the write cursor and commit it. A sync cursor past the new write
    /// cursor is pulled back with it.
    pub fn update_cursor(&mut self, cursor: u32) -> Result<(), HistoryError> {
        if cursor % self.block_size != 0 {
            return Err(HistoryError::MisalignedCursor(cursor));
        }
        if cursor > self.capacity_bytes() {
            return Err(HistoryError::Full);
        }
        if self.sync_cursor > cursor {
            self.write_control(ControlKey::SyncCursor, cursor)?;
            self.sync_cursor = cursor;
        }
        self.write_control(ControlKey::Cursor, cursor)?;
        self.cursor = cursor;
        Ok(())
    }

    /// Append one entry and commit the advanced cursor.
    pub fn add_history(&mut self, identifier: &[u8], timestamp: u32) -> Result<(), HistoryError> {
        if self.cursor + self.block_size > self.capacity_bytes() {
            log::error!("history: region full ({} entries)", self.get_nb_entries());
            return Err(HistoryError::Full);
        }

        let uid_size = self.get_uid_size();
        let mut block = [0u8; MAX_UID_SIZE + TIMESTAMP_LEN];
        let copied = identifier.len().min(uid_size);
        block[..copied].copy_from_slice(&identifier[..copied]);
        block[uid_size..uid_size + TIMESTAMP_LEN].copy_from_slice(&timestamp.to_le_bytes());

        storage::program_raw(
            &mut self.flash,
            self.data.start + self.cursor,
            &block[..self.block_size as usize],
        )?;
        self.update_cursor(self.cursor + self.block_size)?;
        log::debug!("history: entry {} at t={}", self.get_nb_entries() - 1, timestamp);
        Ok(())
    }

    /// Read the entry at `index`.
    pub fn get_history(&mut self, index: u32) -> Result<HistoryEntry, HistoryError> {
        let count = self.get_nb_entries();
        if index >= count {
            return Err(HistoryError::OutOfRange { index, count });
        }
        let uid_size = self.get_uid_size();
        let mut block = [0u8; MAX_UID_SIZE + TIMESTAMP_LEN];
        storage::read_raw(
            &mut self.flash,
            self.data.start + index * self.block_size,
            &mut block[..self.block_size as usize],
        )?;

        let id_len = block[..uid_size].iter().position(|&b| b == 0).unwrap_or(uid_size);
        let mut identifier = Vec::new();
        // id_len <= uid_size <= MAX_UID_SIZE
        let _ = identifier.extend_from_slice(&block[..id_len]);
        let mut ts = [0u8; TIMESTAMP_LEN];
        ts.copy_from_slice(&block[uid_size..uid_size + TIMESTAMP_LEN]);
        Ok(HistoryEntry {
            identifier,
            timestamp: u32::from_le_bytes(ts),
        })
    }

    /// Erase all entries and control metadata, then start over at offset 0.
    ///
    /// The zeroed cursors are committed before any data is erased. If power is
    /// lost part way, `open` either adopts the untouched blocks again or scrubs
    /// the partly erased region, and never reports erased blocks as entries.
    pub fn clear_history(&mut self) -> Result<(), HistoryError> {
        self.write_control(ControlKey::SyncCursor, 0)?;
        self.sync_cursor = 0;
        self.write_control(ControlKey::Cursor, 0)?;
        self.cursor = 0;
        storage::erase_range(&mut self.flash, self.data.clone())?;
        storage::erase_range(&mut self.flash, self.control.clone())?;
        self.write_control(ControlKey::BlockSize, self.block_size)?;
        self.write_control(ControlKey::Cursor, 0)?;
        self.write_control(ControlKey::SyncCursor, 0)?;
        log::warn!("history: cleared");
        Ok(())
    }

    /// Entries not yet acknowledged by the uplink.
    pub fn pending_sync(&self) -> u32 {
        self.cursor.saturating_sub(self.sync_cursor) / self.block_size
    }

    /// Index of the oldest unsynced entry.
    pub fn sync_index(&self) -> u32 {
        self.sync_cursor / self.block_size
    }

    /// Copy up to `out.len()` unsynced entries into `out` without consuming them.
    /// Returns how many were copied.
    pub fn peek_unsynced(&mut self, out: &mut [HistoryEntry]) -> Result<usize, HistoryError> {
        let first = self.sync_index();
        let count = (self.pending_sync() as usize).min(out.len());
        for (i, slot) in out.iter_mut().take(count).enumerate() {
            *slot = self.get_history(first + i as u32)?;
        }
        Ok(count)
    }

    /// Mark `count` entries starting at the sync cursor as delivered.
    pub fn commit_synced(&mut self, count: u32) -> Result<(), HistoryError> {
        let count = count.min(self.pending_sync());
        let new_sync = self.sync_cursor + count * self.block_size;
        self.write_control(ControlKey::SyncCursor, new_sync)?;
        self.sync_cursor = new_sync;
        log::debug!("history: committed {} synced entries", count);
        Ok(())
    }

    /// Close the log and hand the flash back.
    pub fn close(self) -> S {
        self.flash
    }
}

