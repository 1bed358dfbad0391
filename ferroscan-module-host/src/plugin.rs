//! A single loaded analyzer module.
//!
//! Loading compiles and instantiates the guest, resolves its mandatory
//! exports, and reads its static metadata. After that the host drives two
//! entry points, `analyze` and `post_scan`, both following the same shape:
//! marshal the input into guest memory, call, decode the returned packed
//! pointer, release the input allocation on every exit path.
//!
//! A guest instance holds mutable linear memory, so every call takes the
//! instance-local lock for its duration. A failed call (including a guest
//! trap) surfaces to the caller and leaves the instance available for
//! subsequent calls.

use crate::abi;
use crate::analyzer::{AnalysisInput, Analyzer};
use crate::cancel::CancellationToken;
use crate::codec::{self, CodecError};
use crate::engine::{Engine, EngineError, StoreData};
use crate::logging::LogSink;
use crate::vfs::{self, MemFs, VfsError};
use ferroscan_module_api::{AnalysisResult, ScanReport, ScanResult};
use regex::Regex;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use wasmtime::{Instance, Memory, Store, TypedFunc, WasmParams, WasmResults};

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("missing required export {0:?}")]
    MissingExport(&'static str),

    #[error("export {name:?} has an incompatible signature: {source}")]
    Signature {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("call to {export:?} failed: {source}")]
    Call {
        export: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Vfs(#[from] VfsError),

    #[error("invalid required-file pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("module {module:?}: analysis failed: {source}")]
    Analysis {
        module: String,
        #[source]
        source: Box<ModuleError>,
    },

    #[error("module {module:?}: post-scan failed: {source}")]
    PostScan {
        module: String,
        #[source]
        source: Box<ModuleError>,
    },

    #[error("operation canceled")]
    Canceled,

    #[error("module {0:?} is closed")]
    Closed(String),
}

struct InstanceState {
    store: Store<StoreData>,
    memory: Memory,
    analyze: TypedFunc<(i64, i64), i64>,
    post_scan: TypedFunc<(i64, i64), i64>,
    malloc: TypedFunc<i64, i64>,
    free: TypedFunc<i64, ()>,
}

/// A loaded module: immutable metadata plus the guarded guest instance.
pub struct Plugin {
    name: String,
    version: i64,
    required: Vec<Regex>,
    state: Mutex<Option<InstanceState>>,
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

impl Plugin {
    /// Compile, instantiate, and interrogate one guest. The start function
    /// runs during instantiation; any failure is fatal for this module only.
    pub fn load(
        engine: &mut Engine,
        code: &[u8],
        logger: Arc<dyn LogSink>,
    ) -> Result<Self, ModuleError> {
        let module = engine.compile(code)?;
        let mut store = engine.new_store(logger)?;
        let instance = engine.instantiate(&mut store, &module)?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or(ModuleError::MissingExport("memory"))?;

        let fn_name = resolve::<(), i64>(&instance, &mut store, "name")?;
        let fn_version = resolve::<(), i64>(&instance, &mut store, "version")?;
        let fn_required = resolve::<(), i64>(&instance, &mut store, "required")?;
        let analyze = resolve::<(i64, i64), i64>(&instance, &mut store, "analyze")?;
        let post_scan = resolve::<(i64, i64), i64>(&instance, &mut store, "post_scan")?;
        let malloc = resolve::<i64, i64>(&instance, &mut store, "malloc")?;
        let free = resolve::<i64, ()>(&instance, &mut store, "free")?;

        let packed = fn_name
            .call(&mut store, ())
            .map_err(|source| ModuleError::Call {
                export: "name",
                source,
            })?;
        let name = codec::read_string(&mut store, &memory, packed as u64)?;
        store.data_mut().module_name = name.clone();

        let version = fn_version
            .call(&mut store, ())
            .map_err(|source| ModuleError::Call {
                export: "version",
                source,
            })?;

        let packed = fn_required
            .call(&mut store, ())
            .map_err(|source| ModuleError::Call {
                export: "required",
                source,
            })?;
        let patterns: Vec<String> = codec::unmarshal(&mut store, &memory, packed as u64)?;
        let required = patterns
            .into_iter()
            .map(|pattern| {
                Regex::new(&pattern).map_err(|source| ModuleError::Pattern { pattern, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name,
            version,
            required,
            state: Mutex::new(Some(InstanceState {
                store,
                memory,
                analyze,
                post_scan,
                malloc,
                free,
            })),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// True iff any of the module's declared patterns matches `file_path`.
    pub fn required(&self, file_path: &str) -> bool {
        self.required.iter().any(|re| re.is_match(file_path))
    }

    /// Present `input` to the guest through a fresh virtual filesystem and
    /// decode its analysis result.
    pub fn analyze(
        &self,
        token: &CancellationToken,
        input: AnalysisInput,
    ) -> Result<AnalysisResult, ModuleError> {
        let mut guard = self.lock();
        let state = guard
            .as_mut()
            .ok_or_else(|| ModuleError::Closed(self.name.clone()))?;
        Self::analyze_locked(state, token, input).map_err(|source| ModuleError::Analysis {
            module: self.name.clone(),
            source: Box::new(source),
        })
    }

    fn analyze_locked(
        state: &mut InstanceState,
        token: &CancellationToken,
        input: AnalysisInput,
    ) -> Result<AnalysisResult, ModuleError> {
        let guest_path = vfs::normalize_path(&input.path);

        let mut fs = MemFs::new();
        if let Some(dir) = vfs::parent(&guest_path) {
            fs.mkdir_all(dir)?;
        }
        fs.add_lazy_file(&guest_path, input.content)?;

        state.store.data_mut().attach_vfs(fs);
        let result = Self::call_analyze(state, token, &guest_path);
        state.store.data_mut().detach_vfs();
        result
    }

    fn call_analyze(
        state: &mut InstanceState,
        token: &CancellationToken,
        guest_path: &str,
    ) -> Result<AnalysisResult, ModuleError> {
        ensure_live(token)?;
        let (offset, size) = codec::write_bytes(
            &mut state.store,
            &state.memory,
            &state.malloc,
            &state.free,
            guest_path.as_bytes(),
        )?;

        let outcome = (|| {
            ensure_live(token)?;
            let packed = state
                .analyze
                .call(&mut state.store, (i64::from(offset), i64::from(size)))
                .map_err(|source| ModuleError::Call {
                    export: "analyze",
                    source,
                })?;
            ensure_live(token)?;
            codec::unmarshal(&mut state.store, &state.memory, packed as u64)
                .map_err(ModuleError::from)
        })();

        abi::free(&mut state.store, &state.free, offset);
        outcome
    }

    /// Hand the report's results to the guest and replace them wholesale
    /// with whatever it returns.
    pub fn post_scan(
        &self,
        token: &CancellationToken,
        report: &mut ScanReport,
    ) -> Result<(), ModuleError> {
        let mut guard = self.lock();
        let state = guard
            .as_mut()
            .ok_or_else(|| ModuleError::Closed(self.name.clone()))?;
        Self::post_scan_locked(state, token, report).map_err(|source| ModuleError::PostScan {
            module: self.name.clone(),
            source: Box::new(source),
        })
    }

    fn post_scan_locked(
        state: &mut InstanceState,
        token: &CancellationToken,
        report: &mut ScanReport,
    ) -> Result<(), ModuleError> {
        ensure_live(token)?;
        let (offset, size) = codec::marshal(
            &mut state.store,
            &state.memory,
            &state.malloc,
            &state.free,
            &report.results,
        )?;

        let outcome: Result<Vec<ScanResult>, ModuleError> = (|| {
            ensure_live(token)?;
            let packed = state
                .post_scan
                .call(&mut state.store, (i64::from(offset), i64::from(size)))
                .map_err(|source| ModuleError::Call {
                    export: "post_scan",
                    source,
                })?;
            ensure_live(token)?;
            codec::unmarshal(&mut state.store, &state.memory, packed as u64)
                .map_err(ModuleError::from)
        })();

        abi::free(&mut state.store, &state.free, offset);
        report.results = outcome?;
        Ok(())
    }

    /// Drop the guest instance. Later calls fail as closed; closing an
    /// already-closed module is a no-op.
    pub fn close(&self) -> Result<(), ModuleError> {
        let mut guard = self.lock();
        guard.take();
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Option<InstanceState>> {
        // A panic mid-call must not brick the module for later callers.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Analyzer for Plugin {
    fn analyzer_type(&self) -> String {
        self.name.clone()
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn required(&self, file_path: &str) -> bool {
        Plugin::required(self, file_path)
    }

    fn analyze(
        &self,
        token: &CancellationToken,
        input: AnalysisInput,
    ) -> Result<AnalysisResult, ModuleError> {
        Plugin::analyze(self, token, input)
    }
}

fn resolve<Params: WasmParams, Results: WasmResults>(
    instance: &Instance,
    store: &mut Store<StoreData>,
    name: &'static str,
) -> Result<TypedFunc<Params, Results>, ModuleError> {
    let func = instance
        .get_func(&mut *store, name)
        .ok_or(ModuleError::MissingExport(name))?;
    func.typed(&*store)
        .map_err(|source| ModuleError::Signature { name, source })
}

fn ensure_live(token: &CancellationToken) -> Result<(), ModuleError> {
    if token.is_cancelled() {
        Err(ModuleError::Canceled)
    } else {
        Ok(())
    }
}
