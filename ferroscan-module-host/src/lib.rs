//! ferroscan-module-host: Wasm analyzer module runtime for ferroscan
//!
//! This crate loads analyzer modules compiled to WebAssembly, runs each one
//! inside an isolated wasmtime sandbox, and drives the guest entry points on
//! behalf of the scanner: `analyze` inspects a single file presented through
//! a virtual filesystem, `post_scan` post-processes the final scan report.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Scanner application                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Manager                                                    │
//! │  ├─ scans ~/.ferroscan/modules for *.wasm                   │
//! │  ├─ register(analyzers) into the injected registry          │
//! │  ├─ post_scan(report) across modules in load order          │
//! │  └─ close() with error accumulation                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Plugin (one per module file)                               │
//! │  ├─ metadata: name, version, required-file patterns         │
//! │  ├─ analyze(file) through a per-call virtual filesystem     │
//! │  └─ post_scan(report projection)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ABI + Codec                                                │
//! │  ├─ (ptr, size) packed into one 64-bit word                 │
//! │  ├─ guest malloc/free for every marshaled input             │
//! │  └─ JSON payloads, UTF-8 string transfer                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  wasmtime (sandboxed execution)                             │
//! │  ├─ env: debug/info/warn/error log sinks + 1-page memory    │
//! │  ├─ wasi_snapshot_preview1 shim over the in-memory VFS      │
//! │  └─ isolated linear memory per instance                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guest ABI
//!
//! Every module must export its linear memory as `memory` plus:
//!
//! | Export | Signature | Meaning |
//! |-------------|--------------------|------------------------------------------|
//! | `malloc`    | `(i64) -> i64`     | Allocate, return pointer |
//! | `free`      | `(i64) -> ()`      | Release an allocation |
//! | `name`      | `() -> i64`        | Packed pointer to the UTF-8 module name |
//! | `version`   | `() -> i64`        | Integer version |
//! | `required`  | `() -> i64`        | Packed pointer to a JSON array of regexes |
//! | `analyze`   | `(i64, i64) -> i64`| File path in, packed JSON result out |
//! | `post_scan` | `(i64, i64) -> i64`| Report results in, replacement out |
//!
//! A packed pointer encodes a guest memory region in one 64-bit word: the
//! offset in the high 32 bits, the byte length in the low 32 bits.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use ferroscan_module_host::{CancellationToken, Manager, ManagerConfig};
//!
//! let mut manager = Manager::new(ManagerConfig::default())?;
//! manager.register(&mut registry);
//!
//! // ... scan ...
//!
//! let token = CancellationToken::new();
//! manager.post_scan(&token, &mut report)?;
//! manager.close()?;
//! ```

pub mod abi;
pub mod analyzer;
pub mod cancel;
pub mod codec;
pub mod engine;
mod env;
pub mod logging;
pub mod manager;
pub mod plugin;
pub mod vfs;
mod wasi;

pub use analyzer::{AnalysisInput, Analyzer, AnalyzerRegistry};
pub use cancel::CancellationToken;
pub use engine::{Engine, EngineError, StoreData};
pub use logging::{LogLevel, LogSink, TracingSink};
pub use manager::{
    default_module_dir, CloseError, Manager, ManagerConfig, ManagerError, DEFAULT_EXTENSION,
};
pub use plugin::{ModuleError, Plugin};
pub use vfs::{ContentProducer, MemFs, VfsError};

pub use ferroscan_module_api::{AnalysisResult, Finding, ScanReport, ScanResult, Severity};
