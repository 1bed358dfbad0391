//! Discovery and lifecycle of analyzer modules.
//!
//! The manager owns the engine and every loaded module. Construction brings
//! the engine up, ensures the module directory exists, and loads every
//! `.wasm` file at its top level; a single load failure aborts construction.
//! After that the manager fans out: `register` into the scanner's registry,
//! `post_scan` across modules in load order, `close` across everything with
//! error accumulation.

use crate::analyzer::{Analyzer, AnalyzerRegistry};
use crate::cancel::CancellationToken;
use crate::engine::Engine;
use crate::logging::{LogSink, TracingSink};
use crate::plugin::{ModuleError, Plugin};
use ferroscan_module_api::ScanReport;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Extension a module file must carry, without the dot.
pub const DEFAULT_EXTENSION: &str = "wasm";

/// `${HOME}/.ferroscan/modules`, falling back to a relative path when the
/// home directory cannot be determined.
pub fn default_module_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ferroscan")
        .join("modules")
}

pub struct ManagerConfig {
    /// Directory scanned, one level deep, for module files.
    pub dir: PathBuf,
    /// Extension filter; non-matching entries are skipped silently.
    pub extension: String,
    /// Sink receiving guest log lines.
    pub logger: Arc<dyn LogSink>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            dir: default_module_dir(),
            extension: DEFAULT_EXTENSION.to_string(),
            logger: Arc::new(TracingSink),
        }
    }
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("unable to create module directory {dir:?}: {source}")]
    CreateDir {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to read module directory {dir:?}: {source}")]
    ReadDir {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to read module file {path:?}: {source}")]
    ReadModule {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to load module {path:?}: {source}")]
    LoadModule {
        path: PathBuf,
        #[source]
        source: ModuleError,
    },

    #[error(transparent)]
    Module(#[from] ModuleError),
}

/// Aggregate of every failure encountered while closing. Closing continues
/// past individual failures; nothing is skipped.
#[derive(Debug)]
pub struct CloseError {
    failures: Vec<(String, ModuleError)>,
}

impl CloseError {
    /// The individual failures, attributed to engine or module name.
    pub fn failures(&self) -> &[(String, ModuleError)] {
        &self.failures
    }
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to close {} component(s):", self.failures.len())?;
        for (component, error) in &self.failures {
            write!(f, " {component}: {error};")?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseError {}

pub struct Manager {
    engine: Engine,
    plugins: Vec<Arc<Plugin>>,
    dir: PathBuf,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("plugins", &self.plugins)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Bring up the engine, ensure the module directory exists, and load
    /// every matching file in it. A per-module failure aborts construction.
    pub fn new(config: ManagerConfig) -> Result<Self, ManagerError> {
        let mut engine = Engine::new().map_err(ModuleError::from)?;
        engine.register_host_module().map_err(ModuleError::from)?;
        engine.install_wasi().map_err(ModuleError::from)?;

        ensure_dir(&config.dir)?;

        let mut plugins = Vec::new();
        for path in module_files(&config.dir, &config.extension)? {
            let code = fs::read(&path).map_err(|source| ManagerError::ReadModule {
                path: path.clone(),
                source,
            })?;
            let plugin = Plugin::load(&mut engine, &code, Arc::clone(&config.logger)).map_err(
                |source| ManagerError::LoadModule {
                    path: path.clone(),
                    source,
                },
            )?;
            tracing::info!(
                module = plugin.name(),
                version = plugin.version(),
                path = %path.display(),
                "module loaded"
            );
            plugins.push(Arc::new(plugin));
        }

        Ok(Self {
            engine,
            plugins,
            dir: config.dir,
        })
    }

    /// Register every loaded module with the scanner's registry.
    pub fn register(&self, registry: &mut dyn AnalyzerRegistry) {
        for plugin in &self.plugins {
            registry.register(Arc::clone(plugin) as Arc<dyn Analyzer>);
        }
    }

    /// Run `post_scan` across modules in load order. The first failure
    /// aborts and propagates, attributed to the offending module.
    pub fn post_scan(
        &self,
        token: &CancellationToken,
        report: &mut ScanReport,
    ) -> Result<(), ManagerError> {
        for plugin in &self.plugins {
            plugin.post_scan(token, report)?;
        }
        Ok(())
    }

    /// Close the engine, then every module. All failures are accumulated
    /// and returned jointly.
    pub fn close(&mut self) -> Result<(), CloseError> {
        let mut failures = Vec::new();
        if let Err(error) = self.engine.close() {
            failures.push(("engine".to_string(), ModuleError::Engine(error)));
        }
        for plugin in &self.plugins {
            if let Err(error) = plugin.close() {
                failures.push((plugin.name().to_string(), error));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CloseError { failures })
        }
    }

    pub fn modules(&self) -> &[Arc<Plugin>] {
        &self.plugins
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn ensure_dir(dir: &Path) -> Result<(), ManagerError> {
    if dir.is_dir() {
        return Ok(());
    }
    create_module_dir(dir).map_err(|source| ManagerError::CreateDir {
        dir: dir.to_path_buf(),
        source,
    })
}

#[cfg(unix)]
fn create_module_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
    fs::DirBuilder::new().recursive(true).mode(0o755).create(dir)?;
    // The builder mode is filtered through the umask; owner-writable,
    // world-readable is part of the directory's contract.
    fs::set_permissions(dir, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn create_module_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

/// Regular files one level deep whose extension matches, sorted by file
/// name so enumeration order is stable for a given directory state.
fn module_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, ManagerError> {
    let entries = fs::read_dir(dir).map_err(|source| ManagerError::ReadDir {
        dir: dir.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ManagerError::ReadDir {
            dir: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if is_file && path.extension() == Some(OsStr::new(extension)) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
