//! Minimal WASI snapshot-preview1 shim.
//!
//! Guests built against WASI expect `wasi_snapshot_preview1` imports for
//! file access, clocks, randomness, and stdio. The host wires the subset
//! analyzer modules exercise, resolving every file operation against the
//! per-call virtual filesystem; neither the real filesystem nor the process
//! environment is ever visible to a guest. Guest stdout and stderr pass
//! through to the host's. Imports outside this subset are stubbed as traps
//! at instantiation.
//!
//! While a virtual filesystem is attached the guest sees exactly one
//! preopened directory, fd 3, named `/`. With no filesystem attached, file
//! operations fail with ordinary WASI errno values.

use crate::abi;
use crate::engine::StoreData;
use crate::vfs::{normalize_path, MemFs, Metadata, VfsError};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use wasmtime::{Caller, Extern, Linker, Memory};

pub(crate) const WASI_MODULE: &str = "wasi_snapshot_preview1";

const ERRNO_SUCCESS: i32 = 0;
const ERRNO_BADF: i32 = 8;
const ERRNO_FAULT: i32 = 21;
const ERRNO_INVAL: i32 = 28;
const ERRNO_IO: i32 = 29;
const ERRNO_ISDIR: i32 = 31;
const ERRNO_NOENT: i32 = 44;
const ERRNO_NOTDIR: i32 = 54;

const FILETYPE_CHARACTER_DEVICE: u8 = 2;
const FILETYPE_DIRECTORY: u8 = 3;
const FILETYPE_REGULAR_FILE: u8 = 4;

/// The single preopen handed to guests while a filesystem is attached.
const PREOPEN_FD: u32 = 3;
const PREOPEN_NAME: &str = "/";
const FIRST_FILE_FD: u32 = 4;

const MAX_IOV_COUNT: u32 = 1024;

/// Per-call filesystem state: the tree plus the guest's open descriptors.
/// Dropped wholesale when the filesystem is detached.
pub(crate) struct VfsContext {
    fs: MemFs,
    fds: HashMap<u32, FdEntry>,
    next_fd: u32,
}

enum FdEntry {
    Dir { path: String },
    File { content: Arc<[u8]>, offset: u64 },
}

impl VfsContext {
    pub(crate) fn new(fs: MemFs) -> Self {
        Self {
            fs,
            fds: HashMap::new(),
            next_fd: FIRST_FILE_FD,
        }
    }
}

pub(crate) fn add_to_linker(linker: &mut Linker<StoreData>) -> anyhow::Result<()> {
    linker.func_wrap(
        WASI_MODULE,
        "args_sizes_get",
        |mut caller: Caller<'_, StoreData>, count_ptr: i32, buf_size_ptr: i32| -> i32 {
            errno((|| {
                let memory = guest_memory(&mut caller)?;
                write_u32(&mut caller, &memory, count_ptr as u32, 0)?;
                write_u32(&mut caller, &memory, buf_size_ptr as u32, 0)
            })())
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "args_get",
        |_caller: Caller<'_, StoreData>, _argv: i32, _argv_buf: i32| -> i32 { ERRNO_SUCCESS },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "environ_sizes_get",
        |mut caller: Caller<'_, StoreData>, count_ptr: i32, buf_size_ptr: i32| -> i32 {
            errno((|| {
                let memory = guest_memory(&mut caller)?;
                write_u32(&mut caller, &memory, count_ptr as u32, 0)?;
                write_u32(&mut caller, &memory, buf_size_ptr as u32, 0)
            })())
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "environ_get",
        |_caller: Caller<'_, StoreData>, _environ: i32, _environ_buf: i32| -> i32 {
            ERRNO_SUCCESS
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "clock_time_get",
        |mut caller: Caller<'_, StoreData>, _id: i32, _precision: i64, time_ptr: i32| -> i32 {
            errno((|| {
                let memory = guest_memory(&mut caller)?;
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_err(|_| ERRNO_IO)?;
                write_u64(&mut caller, &memory, time_ptr as u32, now.as_nanos() as u64)
            })())
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "random_get",
        |mut caller: Caller<'_, StoreData>, buf_ptr: i32, buf_len: i32| -> i32 {
            errno((|| {
                let memory = guest_memory(&mut caller)?;
                let len = buf_len as u32 as usize;
                if len > memory.data_size(&caller) {
                    return Err(ERRNO_FAULT);
                }
                let mut bytes = vec![0u8; len];
                getrandom::getrandom(&mut bytes).map_err(|_| ERRNO_IO)?;
                write_guest(&mut caller, &memory, buf_ptr as u32, &bytes)
            })())
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "sched_yield",
        |_caller: Caller<'_, StoreData>| -> i32 { ERRNO_SUCCESS },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "proc_exit",
        |_caller: Caller<'_, StoreData>, code: i32| -> anyhow::Result<()> {
            Err(anyhow::anyhow!("guest exited with status {code}"))
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_write",
        |mut caller: Caller<'_, StoreData>,
         fd: i32,
         iovs_ptr: i32,
         iovs_len: i32,
         nwritten_ptr: i32|
         -> i32 {
            errno((|| {
                let memory = guest_memory(&mut caller)?;
                let iovs = read_iov_list(&mut caller, &memory, iovs_ptr as u32, iovs_len as u32)?;
                let mut data = Vec::new();
                for (ptr, len) in iovs {
                    data.extend_from_slice(&read_guest(&mut caller, &memory, ptr, len)?);
                }
                match fd {
                    1 => std::io::stdout().write_all(&data).map_err(|_| ERRNO_IO)?,
                    2 => std::io::stderr().write_all(&data).map_err(|_| ERRNO_IO)?,
                    _ => return Err(ERRNO_BADF),
                }
                write_u32(&mut caller, &memory, nwritten_ptr as u32, data.len() as u32)
            })())
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_read",
        |mut caller: Caller<'_, StoreData>,
         fd: i32,
         iovs_ptr: i32,
         iovs_len: i32,
         nread_ptr: i32|
         -> i32 {
            errno((|| {
                let memory = guest_memory(&mut caller)?;
                let iovs = read_iov_list(&mut caller, &memory, iovs_ptr as u32, iovs_len as u32)?;

                let (content, start) = {
                    let ctx = vfs_mut(&mut caller)?;
                    match ctx.fds.get(&(fd as u32)) {
                        Some(FdEntry::File { content, offset }) => {
                            (Arc::clone(content), *offset)
                        }
                        Some(FdEntry::Dir { .. }) => return Err(ERRNO_ISDIR),
                        None => return Err(ERRNO_BADF),
                    }
                };

                let mut position = usize::try_from(start).unwrap_or(usize::MAX).min(content.len());
                let mut total: u32 = 0;
                for (ptr, len) in iovs {
                    if position == content.len() {
                        break;
                    }
                    if len == 0 {
                        continue;
                    }
                    let chunk = (content.len() - position).min(len as usize);
                    write_guest(&mut caller, &memory, ptr, &content[position..position + chunk])?;
                    position += chunk;
                    total += chunk as u32;
                }

                let ctx = vfs_mut(&mut caller)?;
                if let Some(FdEntry::File { offset, .. }) = ctx.fds.get_mut(&(fd as u32)) {
                    *offset = position as u64;
                }
                write_u32(&mut caller, &memory, nread_ptr as u32, total)
            })())
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_close",
        |mut caller: Caller<'_, StoreData>, fd: i32| -> i32 {
            errno((|| {
                let fd = fd as u32;
                if fd == PREOPEN_FD {
                    return Ok(());
                }
                let ctx = vfs_mut(&mut caller)?;
                ctx.fds.remove(&fd).map(|_| ()).ok_or(ERRNO_BADF)
            })())
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_seek",
        |mut caller: Caller<'_, StoreData>,
         fd: i32,
         delta: i64,
         whence: i32,
         newoffset_ptr: i32|
         -> i32 {
            errno((|| {
                let memory = guest_memory(&mut caller)?;
                let new_offset = {
                    let ctx = vfs_mut(&mut caller)?;
                    let Some(FdEntry::File { content, offset }) = ctx.fds.get_mut(&(fd as u32))
                    else {
                        return Err(ERRNO_BADF);
                    };
                    let base = match whence {
                        0 => 0,
                        1 => *offset as i64,
                        2 => content.len() as i64,
                        _ => return Err(ERRNO_INVAL),
                    };
                    let target = base.checked_add(delta).filter(|t| *t >= 0).ok_or(ERRNO_INVAL)?;
                    *offset = target as u64;
                    target as u64
                };
                write_u64(&mut caller, &memory, newoffset_ptr as u32, new_offset)
            })())
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_fdstat_get",
        |mut caller: Caller<'_, StoreData>, fd: i32, stat_ptr: i32| -> i32 {
            errno((|| {
                let memory = guest_memory(&mut caller)?;
                let filetype = descriptor_type(&mut caller, fd as u32)?;
                // fdstat: filetype, flags, rights_base, rights_inheriting.
                let mut stat = [0u8; 24];
                stat[0] = filetype;
                stat[8..16].copy_from_slice(&u64::MAX.to_le_bytes());
                stat[16..24].copy_from_slice(&u64::MAX.to_le_bytes());
                write_guest(&mut caller, &memory, stat_ptr as u32, &stat)
            })())
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_filestat_get",
        |mut caller: Caller<'_, StoreData>, fd: i32, stat_ptr: i32| -> i32 {
            errno((|| {
                let memory = guest_memory(&mut caller)?;
                let fd = fd as u32;
                let (filetype, size) = if fd <= 2 {
                    (FILETYPE_CHARACTER_DEVICE, 0)
                } else if fd == PREOPEN_FD {
                    vfs_mut(&mut caller)?;
                    (FILETYPE_DIRECTORY, 0)
                } else {
                    let ctx = vfs_mut(&mut caller)?;
                    match ctx.fds.get(&fd) {
                        Some(FdEntry::Dir { .. }) => (FILETYPE_DIRECTORY, 0),
                        Some(FdEntry::File { content, .. }) => {
                            (FILETYPE_REGULAR_FILE, content.len() as u64)
                        }
                        None => return Err(ERRNO_BADF),
                    }
                };
                let stat = filestat(filetype, size);
                write_guest(&mut caller, &memory, stat_ptr as u32, &stat)
            })())
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_prestat_get",
        |mut caller: Caller<'_, StoreData>, fd: i32, prestat_ptr: i32| -> i32 {
            errno((|| {
                if fd as u32 != PREOPEN_FD {
                    return Err(ERRNO_BADF);
                }
                vfs_mut(&mut caller)?;
                let memory = guest_memory(&mut caller)?;
                // prestat: tag 0 (directory) + name length.
                let mut prestat = [0u8; 8];
                prestat[4..8].copy_from_slice(&(PREOPEN_NAME.len() as u32).to_le_bytes());
                write_guest(&mut caller, &memory, prestat_ptr as u32, &prestat)
            })())
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_prestat_dir_name",
        |mut caller: Caller<'_, StoreData>, fd: i32, path_ptr: i32, path_len: i32| -> i32 {
            errno((|| {
                if fd as u32 != PREOPEN_FD {
                    return Err(ERRNO_BADF);
                }
                vfs_mut(&mut caller)?;
                if (path_len as u32 as usize) < PREOPEN_NAME.len() {
                    return Err(ERRNO_INVAL);
                }
                let memory = guest_memory(&mut caller)?;
                write_guest(&mut caller, &memory, path_ptr as u32, PREOPEN_NAME.as_bytes())
            })())
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "path_open",
        |mut caller: Caller<'_, StoreData>,
         dirfd: i32,
         _dirflags: i32,
         path_ptr: i32,
         path_len: i32,
         _oflags: i32,
         _rights_base: i64,
         _rights_inheriting: i64,
         _fdflags: i32,
         opened_fd_ptr: i32|
         -> i32 {
            errno((|| {
                let memory = guest_memory(&mut caller)?;
                let raw = read_guest(&mut caller, &memory, path_ptr as u32, path_len as u32)?;
                let relative = String::from_utf8_lossy(&raw).into_owned();

                let fd = {
                    let ctx = vfs_mut(&mut caller)?;
                    let base = resolve_base(ctx, dirfd as u32)?;
                    let full = normalize_path(&format!("{base}/{relative}"));
                    let entry = match ctx.fs.metadata(&full) {
                        Ok(Metadata::Dir) => FdEntry::Dir { path: full },
                        Ok(Metadata::File { .. }) => {
                            let content = ctx.fs.open(&full).map_err(|_| ERRNO_IO)?;
                            FdEntry::File { content, offset: 0 }
                        }
                        Err(error) => return Err(errno_for_vfs(&error)),
                    };
                    let fd = ctx.next_fd;
                    ctx.next_fd += 1;
                    ctx.fds.insert(fd, entry);
                    fd
                };
                write_u32(&mut caller, &memory, opened_fd_ptr as u32, fd)
            })())
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "path_filestat_get",
        |mut caller: Caller<'_, StoreData>,
         dirfd: i32,
         _flags: i32,
         path_ptr: i32,
         path_len: i32,
         stat_ptr: i32|
         -> i32 {
            errno((|| {
                let memory = guest_memory(&mut caller)?;
                let raw = read_guest(&mut caller, &memory, path_ptr as u32, path_len as u32)?;
                let relative = String::from_utf8_lossy(&raw).into_owned();

                let stat = {
                    let ctx = vfs_mut(&mut caller)?;
                    let base = resolve_base(ctx, dirfd as u32)?;
                    let full = normalize_path(&format!("{base}/{relative}"));
                    match ctx.fs.metadata(&full) {
                        Ok(Metadata::Dir) => filestat(FILETYPE_DIRECTORY, 0),
                        Ok(Metadata::File { size }) => filestat(FILETYPE_REGULAR_FILE, size),
                        Err(error) => return Err(errno_for_vfs(&error)),
                    }
                };
                write_guest(&mut caller, &memory, stat_ptr as u32, &stat)
            })())
        },
    )?;

    Ok(())
}

fn errno(result: Result<(), i32>) -> i32 {
    match result {
        Ok(()) => ERRNO_SUCCESS,
        Err(code) => code,
    }
}

fn errno_for_vfs(error: &VfsError) -> i32 {
    match error {
        VfsError::NotFound(_) => ERRNO_NOENT,
        VfsError::NotADirectory(_) => ERRNO_NOTDIR,
        VfsError::IsADirectory(_) => ERRNO_ISDIR,
        VfsError::Content { .. } => ERRNO_IO,
    }
}

fn guest_memory(caller: &mut Caller<'_, StoreData>) -> Result<Memory, i32> {
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => Ok(memory),
        _ => Err(ERRNO_INVAL),
    }
}

fn vfs_mut<'a>(caller: &'a mut Caller<'_, StoreData>) -> Result<&'a mut VfsContext, i32> {
    caller.data_mut().vfs.as_mut().ok_or(ERRNO_BADF)
}

fn resolve_base(ctx: &VfsContext, dirfd: u32) -> Result<String, i32> {
    if dirfd == PREOPEN_FD {
        return Ok(PREOPEN_NAME.to_string());
    }
    match ctx.fds.get(&dirfd) {
        Some(FdEntry::Dir { path }) => Ok(path.clone()),
        Some(FdEntry::File { .. }) => Err(ERRNO_NOTDIR),
        None => Err(ERRNO_BADF),
    }
}

fn filestat(filetype: u8, size: u64) -> [u8; 64] {
    let mut stat = [0u8; 64];
    stat[16] = filetype;
    stat[24..32].copy_from_slice(&1u64.to_le_bytes());
    stat[32..40].copy_from_slice(&size.to_le_bytes());
    stat
}

fn descriptor_type(caller: &mut Caller<'_, StoreData>, fd: u32) -> Result<u8, i32> {
    if fd <= 2 {
        return Ok(FILETYPE_CHARACTER_DEVICE);
    }
    if fd == PREOPEN_FD {
        vfs_mut(caller)?;
        return Ok(FILETYPE_DIRECTORY);
    }
    let ctx = vfs_mut(caller)?;
    match ctx.fds.get(&fd) {
        Some(FdEntry::Dir { .. }) => Ok(FILETYPE_DIRECTORY),
        Some(FdEntry::File { .. }) => Ok(FILETYPE_REGULAR_FILE),
        None => Err(ERRNO_BADF),
    }
}

fn read_guest(
    caller: &mut Caller<'_, StoreData>,
    memory: &Memory,
    ptr: u32,
    len: u32,
) -> Result<Vec<u8>, i32> {
    abi::read_memory(&*caller, memory, ptr, len).map_err(|_| ERRNO_FAULT)
}

fn write_guest(
    caller: &mut Caller<'_, StoreData>,
    memory: &Memory,
    ptr: u32,
    bytes: &[u8],
) -> Result<(), i32> {
    abi::write_memory(&mut *caller, memory, ptr, bytes).map_err(|_| ERRNO_FAULT)
}

fn write_u32(
    caller: &mut Caller<'_, StoreData>,
    memory: &Memory,
    ptr: u32,
    value: u32,
) -> Result<(), i32> {
    write_guest(caller, memory, ptr, &value.to_le_bytes())
}

fn write_u64(
    caller: &mut Caller<'_, StoreData>,
    memory: &Memory,
    ptr: u32,
    value: u64,
) -> Result<(), i32> {
    write_guest(caller, memory, ptr, &value.to_le_bytes())
}

fn read_iov_list(
    caller: &mut Caller<'_, StoreData>,
    memory: &Memory,
    base: u32,
    count: u32,
) -> Result<Vec<(u32, u32)>, i32> {
    if count > MAX_IOV_COUNT {
        return Err(ERRNO_INVAL);
    }
    let mut iovs = Vec::with_capacity(count as usize);
    for index in 0..count {
        let entry_ptr = base
            .checked_add(index.checked_mul(8).ok_or(ERRNO_INVAL)?)
            .ok_or(ERRNO_INVAL)?;
        let raw = read_guest(caller, memory, entry_ptr, 8)?;
        let ptr = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let len = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        iovs.push((ptr, len));
    }
    Ok(iovs)
}
