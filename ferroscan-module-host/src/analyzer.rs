//! The analyzer seam between the module system and the scanner.
//!
//! Anything implementing [`Analyzer`] can take part in a scan, whether
//! native or Wasm-backed; loaded modules satisfy it through
//! [`Plugin`](crate::plugin::Plugin). The registry the scanner feeds files
//! through is injected, never a hidden singleton, so disjoint managers can
//! coexist in one process.

use crate::cancel::CancellationToken;
use crate::plugin::ModuleError;
use crate::vfs::ContentProducer;
use ferroscan_module_api::AnalysisResult;
use std::fmt;
use std::sync::Arc;

/// A single file handed to [`Analyzer::analyze`]. Consumed by the call.
pub struct AnalysisInput {
    /// Path of the file as seen by the caller; normalized before the guest
    /// sees it.
    pub path: String,
    /// Lazy content, produced only if the guest opens the file.
    pub content: ContentProducer,
}

impl AnalysisInput {
    pub fn new(path: impl Into<String>, content: ContentProducer) -> Self {
        Self {
            path: path.into(),
            content,
        }
    }

    /// Convenience for callers that already hold the bytes.
    pub fn from_bytes(path: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self::new(path, Box::new(move || Ok(bytes)))
    }
}

impl fmt::Debug for AnalysisInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisInput")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// The capability set by which any object may act as an analyzer.
pub trait Analyzer: Send + Sync {
    /// Identifier grouping this analyzer's results.
    fn analyzer_type(&self) -> String;

    /// Version reported by the implementation.
    fn version(&self) -> i64;

    /// Whether `file_path` should be fed to [`Analyzer::analyze`].
    fn required(&self, file_path: &str) -> bool;

    /// Inspect one input file.
    fn analyze(
        &self,
        token: &CancellationToken,
        input: AnalysisInput,
    ) -> Result<AnalysisResult, ModuleError>;
}

/// Sink into which loaded modules are registered.
pub trait AnalyzerRegistry {
    fn register(&mut self, analyzer: Arc<dyn Analyzer>);

    fn list(&self) -> Vec<Arc<dyn Analyzer>>;
}
