//! Flash persistence plumbing shared by the authorization store and the
//! history log.
//!
//! Both stores sit on NOR flash exposed through the async
//! `embedded-storage-async` traits. Key/value data (authorization records,
//! history control metadata) goes through `sequential-storage` maps, which
//! append new versions of an item and only consider an item stored once its
//! write completed, so a power loss mid-write leaves the previous value
//! readable. Raw history blocks are programmed directly.
//!
//! Callers in this crate are synchronous; futures are driven to completion
//! with `embassy_futures::block_on`. On the device the flash driver is
//! blocking underneath (`BlockingAsync`), so every future resolves on its
//! first poll.
//!
//! Storage layout (4 MB flash, end of the data partition):
//!   0x3C_0000..0x3C_4000  authorization map (4 pages)
//!   0x3C_4000..0x3C_8000  history control map (4 pages)
//!   0x3C_8000..0x40_0000  history blocks (raw)

use core::ops::Range;

use embassy_futures::block_on;
use embedded_storage_async::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};
use sequential_storage::cache::NoCache;
use sequential_storage::map::{self, Key, SerializationError, Value};

use crate::Identifier;

const AUTH_START: u32 = 0x3C_0000;
const HISTORY_CONTROL_START: u32 = 0x3C_4000;
const HISTORY_DATA_START: u32 = 0x3C_8000;
const HISTORY_DATA_END: u32 = 0x40_0000;

// Scratch for one serialized map item (identifier key + value + item header).
const MAP_BUFFER_LEN: usize = 256;
// Largest aligned span touched by one raw read or program.
const RAW_SPAN_LEN: usize = 64;

/// Flash regions used by the terminal stores.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlashLayout {
    pub auth: Range<u32>,
    pub history_control: Range<u32>,
    pub history_data: Range<u32>,
}

impl FlashLayout {
    pub const fn device() -> Self {
        Self {
            auth: AUTH_START..HISTORY_CONTROL_START,
            history_control: HISTORY_CONTROL_START..HISTORY_DATA_START,
            history_data: HISTORY_DATA_START..HISTORY_DATA_END,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("flash operation failed: {0:?}")]
    Flash(NorFlashErrorKind),
    #[error("stored data is corrupted")]
    Corrupted,
    #[error("storage region is full")]
    Full,
    #[error("item could not be (de)serialized")]
    Serialization,
    #[error("flash span of {0} bytes exceeds the transfer buffer")]
    SpanTooLarge(usize),
    #[error("storage operation failed")]
    Other,
}

impl<E: NorFlashError> From<sequential_storage::Error<E>> for StorageError {
    fn from(err: sequential_storage::Error<E>) -> Self {
        match err {
            sequential_storage::Error::Storage { value, .. } => StorageError::Flash(value.kind()),
            sequential_storage::Error::FullStorage => StorageError::Full,
            sequential_storage::Error::Corrupted { .. } => StorageError::Corrupted,
            sequential_storage::Error::SerializationError(_) => StorageError::Serialization,
            _ => StorageError::Other,
        }
    }
}

fn flash_error<E: NorFlashError>(err: E) -> StorageError {
    StorageError::Flash(err.kind())
}

// ============================================================================
// Map keys
// ============================================================================

/// Authorization map key: the raw credential identifier.
///
/// Serialized as `[len: u8][identifier bytes]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentifierKey(pub Identifier);

impl IdentifierKey {
    pub fn from_slice(identifier: &[u8]) -> Option<Self> {
        Identifier::from_slice(identifier).ok().map(Self)
    }
}

impl Key for IdentifierKey {
    fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, SerializationError> {
        let needed = 1 + self.0.len();
        if buffer.len() < needed {
            return Err(SerializationError::BufferTooSmall);
        }
        buffer[0] = self.0.len() as u8;
        buffer[1..needed].copy_from_slice(&self.0);
        Ok(needed)
    }

    fn deserialize_from(buffer: &[u8]) -> Result<(Self, usize), SerializationError> {
        let len = *buffer.first().ok_or(SerializationError::BufferTooSmall)? as usize;
        let bytes = buffer
            .get(1..1 + len)
            .ok_or(SerializationError::BufferTooSmall)?;
        let identifier =
            Identifier::from_slice(bytes).map_err(|_| SerializationError::InvalidFormat)?;
        Ok((Self(identifier), 1 + len))
    }
}

/// History control map keys.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ControlKey {
    BlockSize = 0,
    Cursor = 1,
    SyncCursor = 2,
}

impl Key for ControlKey {
    fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, SerializationError> {
        *buffer
            .first_mut()
            .ok_or(SerializationError::BufferTooSmall)? = *self as u8;
        Ok(1)
    }

    fn deserialize_from(buffer: &[u8]) -> Result<(Self, usize), SerializationError> {
        match buffer.first() {
            Some(0) => Ok((Self::BlockSize, 1)),
            Some(1) => Ok((Self::Cursor, 1)),
            Some(2) => Ok((Self::SyncCursor, 1)),
            Some(_) => Err(SerializationError::InvalidFormat),
            None => Err(SerializationError::BufferTooSmall),
        }
    }
}

// ============================================================================
// Map access
// ============================================================================

/// Fetch the latest value stored under `key`.
pub(crate) fn fetch_value<K, V, S>(
    flash: &mut S,
    range: Range<u32>,
    key: &K,
) -> Result<Option<V>, StorageError>
where
    K: Key,
    V: for<'d> Value<'d>,
    S: NorFlash,
{
    let mut buffer = [0u8; MAP_BUFFER_LEN];
    let mut cache = NoCache::new();
    let value = block_on(map::fetch_item(flash, range, &mut cache, &mut buffer, key))?;
    Ok(value)
}

/// Store `value` under `key`. The item is durable once this returns `Ok`.
pub(crate) fn store_value<K, V, S>(
    flash: &mut S,
    range: Range<u32>,
    key: &K,
    value: &V,
) -> Result<(), StorageError>
where
    K: Key,
    V: for<'d> Value<'d>,
    S: NorFlash,
{
    let mut buffer = [0u8; MAP_BUFFER_LEN];
    let mut cache = NoCache::new();
    block_on(map::store_item(flash, range, &mut cache, &mut buffer, key, value))?;
    Ok(())
}

/// Erase every page of `range`.
pub(crate) fn erase_range<S: NorFlash>(flash: &mut S, range: Range<u32>) -> Result<(), StorageError> {
    block_on(flash.erase(range.start, range.end)).map_err(flash_error)
}

// ============================================================================
// Raw access
// ============================================================================

fn aligned_span(offset: u32, len: usize, align: usize) -> (u32, usize) {
    let align = align.max(1) as u32;
    let start = offset - offset % align;
    let end = offset + len as u32;
    let end = end.div_ceil(align) * align;
    (start, (end - start) as usize)
}

/// Read `out.len()` bytes at `offset`, honouring the flash read alignment.
pub(crate) fn read_raw<S: NorFlash>(
    flash: &mut S,
    offset: u32,
    out: &mut [u8],
) -> Result<(), StorageError> {
    let (start, span) = aligned_span(offset, out.len(), S::READ_SIZE);
    if span > RAW_SPAN_LEN {
        return Err(StorageError::SpanTooLarge(span));
    }
    let mut buf = [0u8; RAW_SPAN_LEN];
    block_on(flash.read(start, &mut buf[..span])).map_err(flash_error)?;
    let skip = (offset - start) as usize;
    out.copy_from_slice(&buf[skip..skip + out.len()]);
    Ok(())
}

/// Program `data` at `offset` into erased flash.
///
/// Writes are widened to the flash write granularity. Bytes outside `data`
/// are rewritten with their current contents, which NOR flash tolerates
/// because programming only clears bits.
pub(crate) fn program_raw<S: NorFlash>(
    flash: &mut S,
    offset: u32,
    data: &[u8],
) -> Result<(), StorageError> {
    let align = S::WRITE_SIZE.max(S::READ_SIZE);
    let (start, span) = aligned_span(offset, data.len(), align);
    if span > RAW_SPAN_LEN {
        return Err(StorageError::SpanTooLarge(span));
    }
    let mut buf = [0u8; RAW_SPAN_LEN];
    block_on(flash.read(start, &mut buf[..span])).map_err(flash_error)?;
    let skip = (offset - start) as usize;
    buf[skip..skip + data.len()].copy_from_slice(data);
    block_on(flash.write(start, &buf[..span])).map_err(flash_error)
}

/// True when `len` bytes at `offset` are still in the erased state.
pub(crate) fn is_blank<S: NorFlash>(
    flash: &mut S,
    offset: u32,
    len: usize,
) -> Result<bool, StorageError> {
    let mut buf = [0u8; RAW_SPAN_LEN];
    let len = len.min(RAW_SPAN_LEN);
    read_raw(flash, offset, &mut buf[..len])?;
    Ok(buf[..len].iter().all(|&b| b == 0xFF))
}

/// True when every byte of `range` is still in the erased state.
pub(crate) fn is_blank_range<S: NorFlash>(
    flash: &mut S,
    range: Range<u32>,
) -> Result<bool, StorageError> {
    // Half the span buffer, leaving room for read alignment on both ends.
    const CHUNK: u32 = (RAW_SPAN_LEN / 2) as u32;
    let mut offset = range.start;
    while offset < range.end {
        let len = CHUNK.min(range.end - offset);
        if !is_blank(flash, offset, len as usize)? {
            return Ok(false);
        }
        offset += len;
    }
    Ok(true)
}
