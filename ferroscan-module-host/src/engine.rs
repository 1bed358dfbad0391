//! Engine lifecycle and store plumbing.
//!
//! One [`Engine`] backs every module a [`Manager`](crate::manager::Manager)
//! owns. It holds the wasmtime engine, the shared linker carrying the `env`
//! host module and the WASI shim, and a compiled-module cache keyed by
//! content hash. Bring-up is staged: the host module and the WASI shim are
//! wired exactly once, in order, before any guest is compiled.

use crate::env;
use crate::logging::LogSink;
use crate::vfs::MemFs;
use crate::wasi::{self, VfsContext};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use wasmtime::{Config, Instance, Linker, Memory, MemoryType, Module, Store};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine creation failed: {0}")]
    Create(#[source] anyhow::Error),

    #[error("host module setup failed: {0}")]
    HostModule(#[source] anyhow::Error),

    #[error("WASI setup failed: {0}")]
    Wasi(#[source] anyhow::Error),

    #[error("module compilation failed: {0}")]
    Compile(#[source] anyhow::Error),

    #[error("instantiation failed: {0}")]
    Instantiate(#[source] anyhow::Error),

    #[error("engine is {actual}, expected {expected}")]
    State {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Host-side state attached to every guest store.
pub struct StoreData {
    pub(crate) module_name: String,
    pub(crate) logger: Arc<dyn LogSink>,
    pub(crate) vfs: Option<VfsContext>,
}

impl StoreData {
    fn new(logger: Arc<dyn LogSink>) -> Self {
        Self {
            module_name: String::new(),
            logger,
            vfs: None,
        }
    }

    pub(crate) fn attach_vfs(&mut self, fs: MemFs) {
        self.vfs = Some(VfsContext::new(fs));
    }

    pub(crate) fn detach_vfs(&mut self) {
        self.vfs = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    EnvReady,
    Ready,
    Closed,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Fresh => "fresh",
            State::EnvReady => "env-ready",
            State::Ready => "ready",
            State::Closed => "closed",
        }
    }
}

pub struct Engine {
    inner: wasmtime::Engine,
    linker: Linker<StoreData>,
    modules: HashMap<[u8; 32], Module>,
    state: State,
}

impl Engine {
    /// Create a fresh engine with no host modules registered yet.
    pub fn new() -> Result<Self, EngineError> {
        let mut config = Config::new();
        config.wasm_memory64(false);
        let inner = wasmtime::Engine::new(&config).map_err(EngineError::Create)?;
        let linker = Linker::new(&inner);
        Ok(Self {
            inner,
            linker,
            modules: HashMap::new(),
            state: State::Fresh,
        })
    }

    /// Register the `env` host module. Valid exactly once, from the fresh
    /// state.
    pub fn register_host_module(&mut self) -> Result<(), EngineError> {
        self.expect(State::Fresh)?;
        env::add_to_linker(&mut self.linker).map_err(EngineError::HostModule)?;
        self.state = State::EnvReady;
        Ok(())
    }

    /// Wire the WASI snapshot-preview1 shim. Valid exactly once, after the
    /// host module.
    pub fn install_wasi(&mut self) -> Result<(), EngineError> {
        self.expect(State::EnvReady)?;
        wasi::add_to_linker(&mut self.linker).map_err(EngineError::Wasi)?;
        self.state = State::Ready;
        Ok(())
    }

    /// Compile a guest module, or fetch it from the content-hash cache.
    pub fn compile(&mut self, code: &[u8]) -> Result<Module, EngineError> {
        self.expect(State::Ready)?;
        let digest = *blake3::hash(code).as_bytes();
        if let Some(module) = self.modules.get(&digest) {
            return Ok(module.clone());
        }
        let module = Module::new(&self.inner, code).map_err(EngineError::Compile)?;
        self.modules.insert(digest, module.clone());
        Ok(module)
    }

    /// Create the store backing one guest instance.
    pub fn new_store(&self, logger: Arc<dyn LogSink>) -> Result<Store<StoreData>, EngineError> {
        self.expect(State::Ready)?;
        Ok(Store::new(&self.inner, StoreData::new(logger)))
    }

    /// Instantiate `module` in `store`, running its start function. Imports
    /// the shim does not cover are stubbed as traps, so instantiation never
    /// fails on an exotic import; the guest only traps if it calls one.
    pub fn instantiate(
        &self,
        store: &mut Store<StoreData>,
        module: &Module,
    ) -> Result<Instance, EngineError> {
        self.expect(State::Ready)?;

        // The env.mem export is store-bound, so it lives on a clone of the
        // shared linker rather than the linker itself.
        let mut linker = self.linker.clone();
        let memory = Memory::new(&mut *store, MemoryType::new(1, Some(1)))
            .map_err(EngineError::HostModule)?;
        linker
            .define(&*store, env::HOST_MODULE, env::HOST_MEMORY, memory)
            .map_err(EngineError::HostModule)?;
        linker
            .define_unknown_imports_as_traps(module)
            .map_err(EngineError::Instantiate)?;
        linker
            .instantiate(&mut *store, module)
            .map_err(EngineError::Instantiate)
    }

    /// Tear down. Drops the compiled-module cache; instances are closed by
    /// their owners. Valid from any state.
    pub fn close(&mut self) -> Result<(), EngineError> {
        self.modules.clear();
        self.state = State::Closed;
        Ok(())
    }

    fn expect(&self, expected: State) -> Result<(), EngineError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(EngineError::State {
                expected: expected.name(),
                actual: self.state.name(),
            })
        }
    }
}
