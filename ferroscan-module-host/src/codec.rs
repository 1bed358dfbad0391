//! JSON transfer of structured values across the guest boundary.
//!
//! Values are serialized to JSON, copied into a guest allocation, and handed
//! over as a `(pointer, size)` pair; guest return values come back as packed
//! pointers and are parsed out of guest memory. Strings follow the same
//! protocol minus the JSON layer. JSON keeps the two sides loosely coupled:
//! neither needs the other's field layouts.

use crate::abi::{self, AbiError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use wasmtime::{Memory, Store, TypedFunc};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unable to encode value: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("unable to decode guest payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("guest returned an empty payload")]
    Empty,

    #[error("payload of {0} bytes exceeds the 32-bit ABI limit")]
    TooLarge(usize),

    #[error(transparent)]
    Abi(#[from] AbiError),
}

/// Serialize `value` as JSON into guest memory. Returns the written region;
/// the caller owns the allocation and must release it on every exit path.
pub fn marshal<S, T: Serialize>(
    store: &mut Store<S>,
    memory: &Memory,
    malloc: &TypedFunc<i64, i64>,
    free: &TypedFunc<i64, ()>,
    value: &T,
) -> Result<(u32, u32), CodecError> {
    let bytes = serde_json::to_vec(value).map_err(CodecError::Encode)?;
    write_bytes(store, memory, malloc, free, &bytes)
}

/// Copy raw bytes into a fresh guest allocation. String transfer uses this
/// directly, skipping the JSON layer. If the write fails the allocation is
/// released before the error surfaces.
pub fn write_bytes<S>(
    store: &mut Store<S>,
    memory: &Memory,
    malloc: &TypedFunc<i64, i64>,
    free: &TypedFunc<i64, ()>,
    bytes: &[u8],
) -> Result<(u32, u32), CodecError> {
    let size = u32::try_from(bytes.len()).map_err(|_| CodecError::TooLarge(bytes.len()))?;
    let offset = abi::malloc(&mut *store, malloc, size)?;
    if let Err(error) = abi::write_memory(&mut *store, memory, offset, bytes) {
        abi::free(&mut *store, free, offset);
        return Err(error.into());
    }
    Ok((offset, size))
}

/// Parse the JSON region described by a guest-returned packed pointer.
/// Empty regions are an error: a guest with nothing to say returns an empty
/// JSON object or array, not a zero-length payload.
pub fn unmarshal<S, T: DeserializeOwned>(
    store: &mut Store<S>,
    memory: &Memory,
    packed: u64,
) -> Result<T, CodecError> {
    let (offset, size) = abi::unpack(packed);
    if size == 0 {
        return Err(CodecError::Empty);
    }
    let bytes = abi::read_memory(&mut *store, memory, offset, size)?;
    serde_json::from_slice(&bytes).map_err(CodecError::Decode)
}

/// Read the string described by a guest-returned packed pointer. Bytes are
/// interpreted as UTF-8, lossily, so a malformed guest never crashes the
/// host.
pub fn read_string<S>(
    store: &mut Store<S>,
    memory: &Memory,
    packed: u64,
) -> Result<String, CodecError> {
    let (offset, size) = abi::unpack(packed);
    if size == 0 {
        return Ok(String::new());
    }
    let bytes = abi::read_memory(&mut *store, memory, offset, size)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
