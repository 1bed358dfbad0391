//! Low-level ABI shared with guest modules.
//!
//! Guest calls transfer nothing but 32/64-bit integers. A region of guest
//! linear memory is described by a single 64-bit word packing the offset
//! into the high 32 bits and the byte length into the low 32 bits. All
//! structured payloads are materialized through the guest's own exported
//! allocator, because only the guest understands its heap layout.

use thiserror::Error;
use wasmtime::{AsContext, AsContextMut, Memory, TypedFunc};

#[derive(Debug, Error)]
pub enum AbiError {
    #[error("unable to read memory: {size} bytes at offset {offset} (memory is {memory_size} bytes)")]
    ReadOutOfRange {
        offset: u32,
        size: u32,
        memory_size: usize,
    },

    #[error("unable to write memory: {size} bytes at offset {offset} (memory is {memory_size} bytes)")]
    WriteOutOfRange {
        offset: u32,
        size: u32,
        memory_size: usize,
    },

    #[error("guest allocation of {size} bytes failed: {source}")]
    Alloc {
        size: u32,
        #[source]
        source: anyhow::Error,
    },
}

/// Pack a guest memory region into its single-word wire representation.
/// A zero size is legal and denotes an empty payload.
pub fn pack(offset: u32, size: u32) -> u64 {
    (u64::from(offset) << 32) | u64::from(size)
}

/// Split a packed pointer into offset and length.
pub fn unpack(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, packed as u32)
}

/// Read exactly `size` bytes at `offset` from guest memory. Partial reads
/// are not permitted; a region past the end of memory fails as a whole.
pub fn read_memory(
    store: impl AsContext,
    memory: &Memory,
    offset: u32,
    size: u32,
) -> Result<Vec<u8>, AbiError> {
    let data = memory.data(store.as_context());
    let start = offset as usize;
    let end = match start.checked_add(size as usize) {
        Some(end) if end <= data.len() => end,
        _ => {
            tracing::error!(offset, size, memory_size = data.len(), "guest memory read out of range");
            return Err(AbiError::ReadOutOfRange {
                offset,
                size,
                memory_size: data.len(),
            });
        }
    };
    Ok(data[start..end].to_vec())
}

/// Write `bytes` at `offset` in guest memory.
pub fn write_memory(
    mut store: impl AsContextMut,
    memory: &Memory,
    offset: u32,
    bytes: &[u8],
) -> Result<(), AbiError> {
    if memory.write(&mut store, offset as usize, bytes).is_err() {
        let memory_size = memory.data_size(store.as_context());
        tracing::error!(offset, size = bytes.len(), memory_size, "guest memory write out of range");
        return Err(AbiError::WriteOutOfRange {
            offset,
            size: bytes.len() as u32,
            memory_size,
        });
    }
    Ok(())
}

/// Allocate `size` bytes inside the guest via its exported allocator. The
/// allocator contract requires a later [`free`]; zero-size allocations are
/// undefined and must not be requested.
pub fn malloc(
    mut store: impl AsContextMut,
    malloc_fn: &TypedFunc<i64, i64>,
    size: u32,
) -> Result<u32, AbiError> {
    debug_assert!(size > 0, "zero-size guest allocation");
    let ptr = malloc_fn
        .call(&mut store, i64::from(size))
        .map_err(|source| AbiError::Alloc { size, source })?;
    Ok(ptr as u32)
}

/// Release a guest allocation. Best-effort: release happens on exit paths,
/// so failures are logged and swallowed.
pub fn free(mut store: impl AsContextMut, free_fn: &TypedFunc<i64, ()>, offset: u32) {
    if let Err(error) = free_fn.call(&mut store, i64::from(offset)) {
        tracing::warn!(offset, %error, "failed to release guest allocation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Engine, MemoryType, Store};

    fn memory_fixture() -> (Store<()>, Memory) {
        let engine = Engine::default();
        let mut store = Store::new(&engine, ());
        let memory = Memory::new(&mut store, MemoryType::new(1, Some(1))).unwrap();
        (store, memory)
    }

    #[test]
    fn pack_unpack_round_trips() {
        for (offset, size) in [(0, 0), (1, 2), (0xDEAD_BEEF, 0xFFFF_FFFF), (u32::MAX, 0)] {
            assert_eq!(unpack(pack(offset, size)), (offset, size));
        }
    }

    #[test]
    fn read_write_round_trips() {
        let (mut store, memory) = memory_fixture();
        write_memory(&mut store, &memory, 128, b"payload").unwrap();
        assert_eq!(read_memory(&store, &memory, 128, 7).unwrap(), b"payload");
    }

    #[test]
    fn zero_length_read_is_empty() {
        let (store, memory) = memory_fixture();
        assert!(read_memory(&store, &memory, 64, 0).unwrap().is_empty());
    }

    #[test]
    fn out_of_range_read_fails_whole() {
        let (store, memory) = memory_fixture();
        let err = read_memory(&store, &memory, 65_535, 2).unwrap_err();
        assert!(err.to_string().contains("unable to read memory"));
    }

    #[test]
    fn out_of_range_write_fails() {
        let (mut store, memory) = memory_fixture();
        let err = write_memory(&mut store, &memory, 65_530, b"too much data").unwrap_err();
        assert!(err.to_string().contains("unable to write memory"));
    }

    #[test]
    fn read_near_u32_boundary_does_not_wrap() {
        let (store, memory) = memory_fixture();
        assert!(read_memory(&store, &memory, u32::MAX, u32::MAX).is_err());
    }
}
