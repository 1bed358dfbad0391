//! In-memory virtual filesystem presented to a guest during analysis.
//!
//! Each `analyze` call builds a fresh tree holding exactly one file. File
//! content is produced by a callback on first read, so the host never
//! buffers a body the guest does not open. Nothing persists across calls.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Produces the content of a lazy file. Runs at most once.
pub type ContentProducer = Box<dyn FnOnce() -> io::Result<Vec<u8>> + Send>;

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("unable to produce content for {path}: {message}")]
    Content { path: String, message: String },
}

enum Node {
    Dir(BTreeMap<String, Node>),
    File(FileState),
}

enum FileState {
    Lazy(ContentProducer),
    Loaded(Arc<[u8]>),
    /// The producer failed; subsequent reads keep failing with its message.
    Poisoned(String),
}

/// Metadata for a tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metadata {
    Dir,
    File { size: u64 },
}

/// The in-memory tree. Paths are absolute, `/`-separated.
#[derive(Default)]
pub struct MemFs {
    root: BTreeMap<String, Node>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `path` and every missing ancestor as directories.
    pub fn mkdir_all(&mut self, path: &str) -> Result<(), VfsError> {
        let mut current = &mut self.root;
        for segment in segments(path) {
            let node = current
                .entry(segment.to_string())
                .or_insert_with(|| Node::Dir(BTreeMap::new()));
            current = match node {
                Node::Dir(children) => children,
                Node::File(_) => return Err(VfsError::NotADirectory(path.to_string())),
            };
        }
        Ok(())
    }

    /// Register a lazy file at `path`. The parent directory must exist.
    pub fn add_lazy_file(&mut self, path: &str, producer: ContentProducer) -> Result<(), VfsError> {
        let mut parts: Vec<&str> = segments(path).collect();
        let name = parts.pop().ok_or_else(|| VfsError::IsADirectory(path.to_string()))?;

        let mut current = &mut self.root;
        for segment in parts {
            current = match current.get_mut(segment) {
                Some(Node::Dir(children)) => children,
                Some(Node::File(_)) => return Err(VfsError::NotADirectory(path.to_string())),
                None => return Err(VfsError::NotFound(path.to_string())),
            };
        }
        current.insert(name.to_string(), Node::File(FileState::Lazy(producer)));
        Ok(())
    }

    /// Read the file at `path`, running its producer on first access.
    pub fn open(&mut self, path: &str) -> Result<Arc<[u8]>, VfsError> {
        match self.lookup_mut(path)? {
            Node::Dir(_) => Err(VfsError::IsADirectory(path.to_string())),
            Node::File(state) => load(state, path),
        }
    }

    /// Entry metadata. Sizing a lazy file forces its producer.
    pub fn metadata(&mut self, path: &str) -> Result<Metadata, VfsError> {
        if segments(path).next().is_none() {
            return Ok(Metadata::Dir);
        }
        match self.lookup_mut(path)? {
            Node::Dir(_) => Ok(Metadata::Dir),
            Node::File(state) => {
                let content = load(state, path)?;
                Ok(Metadata::File {
                    size: content.len() as u64,
                })
            }
        }
    }

    fn lookup_mut(&mut self, path: &str) -> Result<&mut Node, VfsError> {
        let mut parts = segments(path).peekable();
        let mut current = &mut self.root;
        loop {
            let Some(segment) = parts.next() else {
                return Err(VfsError::NotFound(path.to_string()));
            };
            let node = current
                .get_mut(segment)
                .ok_or_else(|| VfsError::NotFound(path.to_string()))?;
            if parts.peek().is_none() {
                return Ok(node);
            }
            current = match node {
                Node::Dir(children) => children,
                Node::File(_) => return Err(VfsError::NotADirectory(path.to_string())),
            };
        }
    }
}

fn load(state: &mut FileState, path: &str) -> Result<Arc<[u8]>, VfsError> {
    match state {
        FileState::Loaded(content) => Ok(Arc::clone(content)),
        FileState::Poisoned(message) => Err(VfsError::Content {
            path: path.to_string(),
            message: message.clone(),
        }),
        FileState::Lazy(_) => {
            let FileState::Lazy(producer) =
                std::mem::replace(state, FileState::Poisoned("producer panicked".to_string()))
            else {
                unreachable!("state checked above");
            };
            match producer() {
                Ok(bytes) => {
                    let content: Arc<[u8]> = bytes.into();
                    *state = FileState::Loaded(Arc::clone(&content));
                    Ok(content)
                }
                Err(error) => {
                    let message = error.to_string();
                    *state = FileState::Poisoned(message.clone());
                    Err(VfsError::Content {
                        path: path.to_string(),
                        message,
                    })
                }
            }
        }
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".")
}

/// Normalize a caller path for presentation inside the guest: backslashes
/// become forward slashes, dot segments are resolved, and the result is
/// rooted at `/`.
pub fn normalize_path(path: &str) -> String {
    let slashed = path.replace('\\', "/");
    let mut resolved: Vec<&str> = Vec::new();
    for segment in slashed.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                resolved.pop();
            }
            other => resolved.push(other),
        }
    }
    format!("/{}", resolved.join("/"))
}

/// Parent directory of a normalized path, if it has one below the root.
pub(crate) fn parent(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    if idx == 0 {
        None
    } else {
        Some(&path[..idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    fn bytes(content: &str) -> ContentProducer {
        let owned = content.as_bytes().to_vec();
        Box::new(move || Ok(owned))
    }

    #[test]
    fn mkdir_all_then_open_file() {
        let mut fs = MemFs::new();
        fs.mkdir_all("/etc/app").unwrap();
        fs.add_lazy_file("/etc/app/conf", bytes("hello")).unwrap();

        assert_eq!(&*fs.open("/etc/app/conf").unwrap(), b"hello");
        assert_eq!(fs.metadata("/etc/app").unwrap(), Metadata::Dir);
        assert_eq!(
            fs.metadata("/etc/app/conf").unwrap(),
            Metadata::File { size: 5 }
        );
    }

    #[test]
    fn producer_runs_once() {
        let calls = StdArc::new(AtomicUsize::new(0));
        let counter = StdArc::clone(&calls);
        let mut fs = MemFs::new();
        fs.add_lazy_file(
            "/a",
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(b"x".to_vec())
            }),
        )
        .unwrap();

        fs.open("/a").unwrap();
        fs.open("/a").unwrap();
        fs.metadata("/a").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_producer_poisons_the_entry() {
        let mut fs = MemFs::new();
        fs.add_lazy_file(
            "/a",
            Box::new(|| Err(io::Error::new(io::ErrorKind::Other, "disk gone"))),
        )
        .unwrap();

        assert!(matches!(fs.open("/a"), Err(VfsError::Content { .. })));
        assert!(matches!(fs.open("/a"), Err(VfsError::Content { .. })));
    }

    #[test]
    fn missing_paths_and_kind_mismatches() {
        let mut fs = MemFs::new();
        fs.add_lazy_file("/file", bytes("x")).unwrap();

        assert!(matches!(fs.open("/nope"), Err(VfsError::NotFound(_))));
        assert!(matches!(fs.open("/file/sub"), Err(VfsError::NotADirectory(_))));
        assert!(matches!(fs.mkdir_all("/file/sub"), Err(VfsError::NotADirectory(_))));
        assert!(matches!(
            fs.add_lazy_file("/missing/dir/f", bytes("x")),
            Err(VfsError::NotFound(_))
        ));
    }

    #[test]
    fn root_is_a_directory() {
        let mut fs = MemFs::new();
        assert_eq!(fs.metadata("/").unwrap(), Metadata::Dir);
    }

    #[test]
    fn normalize_handles_backslashes_and_dots() {
        assert_eq!(normalize_path("a.txt"), "/a.txt");
        assert_eq!(normalize_path("/a.txt"), "/a.txt");
        assert_eq!(normalize_path("dir\\sub\\a.txt"), "/dir/sub/a.txt");
        assert_eq!(normalize_path("./dir/../a.txt"), "/a.txt");
        assert_eq!(normalize_path("C:\\work\\a.txt"), "/C:/work/a.txt");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn parent_of_normalized_paths() {
        assert_eq!(parent("/a/b/c.txt"), Some("/a/b"));
        assert_eq!(parent("/a.txt"), None);
    }
}
