//! Guest modules authored in WAT, shared across the integration suites.
//!
//! Every fixture implements the full module ABI (bump allocator, metadata
//! exports, `analyze`, `post_scan`); variants swap in different bodies to
//! provoke specific host behavior.

#![allow(dead_code)]

use ferroscan_module_host::{Engine, LogLevel, LogSink, Plugin, TracingSink};
use std::sync::{Arc, Mutex};

pub const EMPTY_RESULT_JSON: &str = r#"{"os":null,"packages":[]}"#;
pub const TXT_ONLY_REQUIRED: &str = r#"["\\.txt$"]"#;
pub const MATCH_ALL_REQUIRED: &str = r#"[".*"]"#;

// Fixed data layout inside every fixture: scratch below 1024, then the
// static payloads, a read buffer at 4096, and the bump heap in page two.
const NAME_OFFSET: usize = 1024;
const REQUIRED_OFFSET: usize = 1280;
const RESULT_OFFSET: usize = 1536;
const EXTRA_DATA_OFFSET: usize = 2048;
pub const READ_BUF_OFFSET: usize = 4096;

const DEFAULT_ANALYZE: &str = r#"  (func (export "analyze") (param $ptr i64) (param $size i64) (result i64)
    (call $pack (i32.const 1536) (i32.const RESULT_LEN)))"#;

const DEFAULT_POST_SCAN: &str = r#"  (func (export "post_scan") (param $ptr i64) (param $size i64) (result i64)
    (i64.or (i64.shl (local.get $ptr) (i64.const 32)) (local.get $size)))"#;

pub struct ModuleSpec {
    pub name: &'static str,
    pub version: i64,
    pub required_json: &'static str,
    pub result_json: &'static str,
    pub imports: &'static str,
    pub extra_data: &'static str,
    pub analyze_func: Option<&'static str>,
    pub post_scan_func: Option<&'static str>,
    pub omit_post_scan: bool,
}

impl Default for ModuleSpec {
    fn default() -> Self {
        Self {
            name: "echo",
            version: 1,
            required_json: TXT_ONLY_REQUIRED,
            result_json: EMPTY_RESULT_JSON,
            imports: "",
            extra_data: "",
            analyze_func: None,
            post_scan_func: None,
            omit_post_scan: false,
        }
    }
}

pub fn build_module(spec: &ModuleSpec) -> Vec<u8> {
    let analyze = spec
        .analyze_func
        .unwrap_or(DEFAULT_ANALYZE)
        .replace("RESULT_LEN", &spec.result_json.len().to_string());
    let post_scan = if spec.omit_post_scan {
        String::new()
    } else {
        spec.post_scan_func
            .unwrap_or(DEFAULT_POST_SCAN)
            .replace("RESULT_LEN", &spec.result_json.len().to_string())
    };

    let wat = format!(
        r#"(module
{imports}
  (memory (export "memory") 2)
  (global $heap (mut i32) (i32.const 65536))
  (data (i32.const {name_offset}) "{name}")
  (data (i32.const {required_offset}) "{required}")
  (data (i32.const {result_offset}) "{result}")
{extra_data}
  (func $pack (param $ptr i32) (param $len i32) (result i64)
    (i64.or
      (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
      (i64.extend_i32_u (local.get $len))))
  (func (export "malloc") (param $size i64) (result i64)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (i32.wrap_i64 (local.get $size))))
    (i64.extend_i32_u (local.get $ptr)))
  (func (export "free") (param i64))
  (func (export "name") (result i64)
    (call $pack (i32.const {name_offset}) (i32.const {name_len})))
  (func (export "version") (result i64) (i64.const {version}))
  (func (export "required") (result i64)
    (call $pack (i32.const {required_offset}) (i32.const {required_len})))
{analyze}
{post_scan}
)"#,
        imports = spec.imports,
        name_offset = NAME_OFFSET,
        required_offset = REQUIRED_OFFSET,
        result_offset = RESULT_OFFSET,
        name = wat_escape(spec.name),
        name_len = spec.name.len(),
        required = wat_escape(spec.required_json),
        required_len = spec.required_json.len(),
        result = wat_escape(spec.result_json),
        version = spec.version,
        extra_data = spec.extra_data,
        analyze = analyze,
        post_scan = post_scan,
    );

    wat::parse_str(&wat).expect("fixture WAT must assemble")
}

fn wat_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// The well-behaved baseline: empty analysis result, identity post-scan.
pub fn echo_module() -> Vec<u8> {
    build_module(&ModuleSpec::default())
}

pub fn echo_module_with_version(version: i64) -> Vec<u8> {
    build_module(&ModuleSpec {
        name: "seven",
        version,
        ..Default::default()
    })
}

/// Calls `env.info` with "hello" before returning an empty JSON object.
pub fn log_module() -> Vec<u8> {
    build_module(&ModuleSpec {
        name: "logger",
        result_json: "{}",
        imports: r#"  (import "env" "info" (func $log_info (param i32 i32)))"#,
        extra_data: r#"  (data (i32.const 2048) "hello")"#,
        analyze_func: Some(
            r#"  (func (export "analyze") (param i64 i64) (result i64)
    (call $log_info (i32.const 2048) (i32.const 5))
    (call $pack (i32.const 1536) (i32.const RESULT_LEN)))"#,
        ),
        ..Default::default()
    })
}

/// Opens the path it was handed through WASI and returns the file content
/// verbatim; falls back to the static empty result for a zero-length file.
pub fn cat_module() -> Vec<u8> {
    build_module(&ModuleSpec {
        name: "cat",
        required_json: MATCH_ALL_REQUIRED,
        imports: r#"  (import "wasi_snapshot_preview1" "path_open"
    (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_read"
    (func $fd_read (param i32 i32 i32 i32) (result i32)))"#,
        analyze_func: Some(
            r#"  (func (export "analyze") (param $path i64) (param $size i64) (result i64)
    (local $fd i32)
    (local $nread i32)
    (if (i32.ne (call $path_open
          (i32.const 3) (i32.const 0)
          (i32.wrap_i64 (local.get $path)) (i32.wrap_i64 (local.get $size))
          (i32.const 0) (i64.const -1) (i64.const -1) (i32.const 0)
          (i32.const 0))
        (i32.const 0))
      (then (unreachable)))
    (local.set $fd (i32.load (i32.const 0)))
    (i32.store (i32.const 8) (i32.const 4096))
    (i32.store (i32.const 12) (i32.const 16384))
    (if (i32.ne (call $fd_read (local.get $fd) (i32.const 8) (i32.const 1) (i32.const 16))
        (i32.const 0))
      (then (unreachable)))
    (local.set $nread (i32.load (i32.const 16)))
    (if (result i64) (i32.eqz (local.get $nread))
      (then (call $pack (i32.const 1536) (i32.const RESULT_LEN)))
      (else (call $pack (i32.const 4096) (local.get $nread)))))"#,
        ),
        ..Default::default()
    })
}

/// Traps on paths longer than ten bytes, succeeds otherwise. Lets tests
/// prove a trap does not poison the instance.
pub fn picky_module() -> Vec<u8> {
    build_module(&ModuleSpec {
        name: "picky",
        required_json: MATCH_ALL_REQUIRED,
        analyze_func: Some(
            r#"  (func (export "analyze") (param $ptr i64) (param $size i64) (result i64)
    (if (i64.gt_u (local.get $size) (i64.const 10)) (then (unreachable)))
    (call $pack (i32.const 1536) (i32.const RESULT_LEN)))"#,
        ),
        ..Default::default()
    })
}

/// Returns a packed pointer far past the end of its own memory.
pub fn out_of_range_module() -> Vec<u8> {
    build_module(&ModuleSpec {
        name: "wild",
        required_json: MATCH_ALL_REQUIRED,
        analyze_func: Some(
            r#"  (func (export "analyze") (param i64 i64) (result i64)
    (call $pack (i32.const 2146435072) (i32.const 64)))"#,
        ),
        ..Default::default()
    })
}

/// Declares `analyze` with two results; must be rejected at load.
pub fn bad_arity_module() -> Vec<u8> {
    build_module(&ModuleSpec {
        name: "twofer",
        analyze_func: Some(
            r#"  (func (export "analyze") (param i64 i64) (result i64 i64)
    (i64.const 0) (i64.const 0))"#,
        ),
        ..Default::default()
    })
}

pub fn missing_post_scan_module() -> Vec<u8> {
    build_module(&ModuleSpec {
        name: "halfway",
        omit_post_scan: true,
        ..Default::default()
    })
}

pub fn invalid_regex_module() -> Vec<u8> {
    build_module(&ModuleSpec {
        name: "lopsided",
        required_json: r#"["("]"#,
        ..Default::default()
    })
}

/// `post_scan` discards every result.
pub fn dropper_module() -> Vec<u8> {
    build_module(&ModuleSpec {
        name: "dropper",
        result_json: "[]",
        post_scan_func: Some(
            r#"  (func (export "post_scan") (param i64 i64) (result i64)
    (call $pack (i32.const 1536) (i32.const RESULT_LEN)))"#,
        ),
        ..Default::default()
    })
}

/// `post_scan` traps unconditionally.
pub fn trapping_post_scan_module() -> Vec<u8> {
    build_module(&ModuleSpec {
        name: "grumpy",
        post_scan_func: Some(
            r#"  (func (export "post_scan") (param i64 i64) (result i64)
    (unreachable))"#,
        ),
        ..Default::default()
    })
}

pub fn ready_engine() -> Engine {
    let mut engine = Engine::new().expect("engine creation");
    engine.register_host_module().expect("host module");
    engine.install_wasi().expect("wasi shim");
    engine
}

pub fn load(engine: &mut Engine, code: &[u8]) -> Plugin {
    Plugin::load(engine, code, Arc::new(TracingSink)).expect("fixture must load")
}

/// Sink capturing forwarded guest log lines for assertions.
#[derive(Default)]
pub struct CapturingSink {
    entries: Mutex<Vec<(LogLevel, String, String)>>,
}

impl CapturingSink {
    pub fn entries(&self) -> Vec<(LogLevel, String, String)> {
        self.entries.lock().unwrap().clone()
    }
}

impl LogSink for CapturingSink {
    fn log(&self, level: LogLevel, module: &str, message: &str) {
        self.entries
            .lock()
            .unwrap()
            .push((level, module.to_string(), message.to_string()));
    }
}
