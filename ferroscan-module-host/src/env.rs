//! Host functions exported to every guest under the `env` module.
//!
//! Four log sinks, one per severity, each taking an `(offset, size)` pair
//! into the calling module's memory. A guest log call can never fail from
//! the guest's point of view: read errors are recorded host-side and the
//! call returns normally.

use crate::engine::StoreData;
use crate::logging::LogLevel;
use wasmtime::{Caller, Extern, Linker};

/// Name of the host module visible to guests.
pub(crate) const HOST_MODULE: &str = "env";

/// Name of the one-page linear memory exported alongside the log sinks, for
/// guests that import their memory instead of defining it.
pub(crate) const HOST_MEMORY: &str = "mem";

pub(crate) fn add_to_linker(linker: &mut Linker<StoreData>) -> anyhow::Result<()> {
    for (name, level) in [
        ("debug", LogLevel::Debug),
        ("info", LogLevel::Info),
        ("warn", LogLevel::Warn),
        ("error", LogLevel::Error),
    ] {
        linker.func_wrap(
            HOST_MODULE,
            name,
            move |mut caller: Caller<'_, StoreData>, offset: i32, size: i32| {
                forward_log(&mut caller, level, offset as u32, size as u32);
            },
        )?;
    }
    Ok(())
}

/// Read the message out of the calling module's memory (not the host's
/// `env` memory) and hand it to the sink.
fn forward_log(caller: &mut Caller<'_, StoreData>, level: LogLevel, offset: u32, size: u32) {
    let Some(Extern::Memory(memory)) = caller.get_export("memory") else {
        let data = caller.data();
        data.logger.log(
            LogLevel::Error,
            &data.module_name,
            "log call from a guest without an exported memory",
        );
        return;
    };

    match crate::abi::read_memory(&mut *caller, &memory, offset, size) {
        Ok(bytes) => {
            // Malformed UTF-8 must not crash the host; invalid sequences are
            // replaced rather than rejected.
            let message = String::from_utf8_lossy(&bytes);
            let data = caller.data();
            data.logger.log(level, &data.module_name, &message);
        }
        Err(error) => {
            let data = caller.data();
            data.logger.log(
                LogLevel::Error,
                &data.module_name,
                &format!("unable to read log message: {error}"),
            );
        }
    }
}
