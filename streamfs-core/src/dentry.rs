//! Filesystem tree nodes.
//!
//! A [`Dentry`] is one node of the exposed tree: a directory, a regular
//! file, a symlink, or a stream-like node backed by a spill file on
//! disk. Parent-to-child edges are the only strong edges; the parent
//! back-reference is a `Weak` used for path reconstruction and size
//! rollup, which keeps the ownership graph a strict tree.
//!
//! Content and size mutation on a node is guarded by that node's own
//! lock, so unrelated leaves update fully in parallel. Structural edits
//! to a parent's child list are serialized by the caller — every table
//! identity owns a disjoint subtree, so per-identity serialization is
//! all that is needed (see [`crate::cache`]).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;

/// Extended attribute carrying the presentation format of a leaf.
pub const XATTR_FORMAT: &str = "user.format";

/// Mode bits, kept in the Unix `S_IFMT | perm` layout the front end
/// expects to serve.
pub mod mode {
    /// Read-only directory.
    pub const DIRECTORY: u32 = 0o040000 | 0o555;
    /// Read-only regular file.
    pub const REGULAR: u32 = 0o100000 | 0o444;
    /// Symlink.
    pub const SYMLINK: u32 = 0o120000 | 0o777;
    /// Stream-like node.
    pub const STREAM: u32 = 0o010000 | 0o444;
}

/// Presentation hint stored in the `user.format` extended attribute of
/// every leaf this core creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatHint {
    /// Raw binary payload.
    Bin,
    /// Hex-formatted numeric value.
    Number,
    /// Human-readable text.
    String,
}

impl FormatHint {
    /// The attribute value written to the node.
    pub fn as_str(self) -> &'static str {
        match self {
            FormatHint::Bin => "bin",
            FormatHint::Number => "number",
            FormatHint::String => "string",
        }
    }
}

/// Node classification, derived from the body variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    RegularFile,
    Symlink,
    /// Stream-like node; excluded from directory size rollup.
    Stream,
}

/// Kind-specific node state. Disposal and serving logic match on this
/// exhaustively, so every kind accounts for its own storage.
#[derive(Debug)]
pub enum NodeBody {
    Directory,
    RegularFile {
        /// Owned byte contents. May lag behind `size` while a carousel
        /// write is in flight.
        contents: Bytes,
    },
    Symlink {
        /// Link target, relative to the symlink's parent.
        target: String,
    },
    Stream {
        /// Backing file the carousel reassembler writes into.
        spill: PathBuf,
    },
}

impl NodeBody {
    fn kind(&self) -> NodeKind {
        match self {
            NodeBody::Directory => NodeKind::Directory,
            NodeBody::RegularFile { .. } => NodeKind::RegularFile,
            NodeBody::Symlink { .. } => NodeKind::Symlink,
            NodeBody::Stream { .. } => NodeKind::Stream,
        }
    }
}

/// One node of the exposed filesystem tree.
#[derive(Debug)]
pub struct Dentry {
    /// Optional numeric identity tag used for stable re-matching across
    /// rebuilds. Zero means untagged.
    pub(crate) inode: u64,
    pub(crate) mode: u32,
    pub(crate) name: Mutex<String>,
    /// Authoritative byte size. For directories this is the rollup of
    /// non-stream children; for streams it tracks the spill file.
    pub(crate) size: AtomicU64,
    pub(crate) parent: Mutex<Weak<Dentry>>,
    /// Children in insertion order.
    pub(crate) children: Mutex<Vec<Arc<Dentry>>>,
    pub(crate) xattrs: Mutex<Vec<(String, String)>>,
    pub(crate) body: Mutex<NodeBody>,
}

impl Dentry {
    fn new(name: &str, mode: u32, inode: u64, size: u64, body: NodeBody) -> Arc<Self> {
        Arc::new(Dentry {
            inode,
            mode,
            name: Mutex::new(name.to_owned()),
            size: AtomicU64::new(size),
            parent: Mutex::new(Weak::new()),
            children: Mutex::new(Vec::new()),
            xattrs: Mutex::new(Vec::new()),
            body: Mutex::new(body),
        })
    }

    /// Allocate an unlinked directory node.
    pub fn directory(name: &str) -> Arc<Self> {
        Self::new(name, mode::DIRECTORY, 0, 0, NodeBody::Directory)
    }

    /// Allocate an unlinked directory node carrying an identity tag.
    pub fn directory_tagged(name: &str, inode: u64) -> Arc<Self> {
        Self::new(name, mode::DIRECTORY, inode, 0, NodeBody::Directory)
    }

    /// Allocate an unlinked regular file holding `contents`, tagged with
    /// its presentation format.
    pub fn file(name: &str, contents: Bytes, format: FormatHint) -> Arc<Self> {
        let size = contents.len() as u64;
        let dentry = Self::new(name, mode::REGULAR, 0, size, NodeBody::RegularFile { contents });
        dentry.set_xattr(XATTR_FORMAT, format.as_str(), false);
        dentry
    }

    /// Allocate an unlinked symlink pointing at `target`.
    pub fn symlink(name: &str, target: &str) -> Arc<Self> {
        Self::new(
            name,
            mode::SYMLINK,
            0,
            0,
            NodeBody::Symlink { target: target.to_owned() },
        )
    }

    /// Allocate an unlinked stream node backed by `spill`.
    pub fn stream(name: &str, spill: PathBuf) -> Arc<Self> {
        let dentry = Self::new(name, mode::STREAM, 0, 0, NodeBody::Stream { spill });
        dentry.set_xattr(XATTR_FORMAT, FormatHint::Bin.as_str(), false);
        dentry
    }

    /// Current node name.
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Rename the node in place.
    pub fn set_name(&self, name: &str) {
        *self.name.lock() = name.to_owned();
    }

    /// Node classification.
    pub fn kind(&self) -> NodeKind {
        self.body.lock().kind()
    }

    /// Whether this node is excluded from directory size rollup.
    pub fn is_stream(&self) -> bool {
        self.kind() == NodeKind::Stream
    }

    /// Authoritative byte size.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub(crate) fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release)
    }

    /// Mode bits (`S_IFMT | perm` layout).
    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Identity tag, zero when untagged.
    pub fn inode(&self) -> u64 {
        self.inode
    }

    /// Parent node, if linked.
    pub fn parent(&self) -> Option<Arc<Dentry>> {
        self.parent.lock().upgrade()
    }

    /// Snapshot of the children in insertion order.
    pub fn children(&self) -> Vec<Arc<Dentry>> {
        self.children.lock().clone()
    }

    /// Find a direct child by name.
    pub fn get_child(&self, name: &str) -> Option<Arc<Dentry>> {
        self.children
            .lock()
            .iter()
            .find(|child| *child.name.lock() == name)
            .cloned()
    }

    /// Snapshot of a regular file's contents. `None` for other kinds.
    pub fn contents(&self) -> Option<Bytes> {
        match &*self.body.lock() {
            NodeBody::RegularFile { contents } => Some(contents.clone()),
            _ => None,
        }
    }

    /// Byte-range read of a regular file, clamped to the buffer.
    pub fn read_range(&self, offset: u64, len: usize) -> Option<Bytes> {
        let contents = self.contents()?;
        let start = (offset as usize).min(contents.len());
        let end = start.saturating_add(len).min(contents.len());
        Some(contents.slice(start..end))
    }

    /// Symlink target. `None` for other kinds.
    pub fn symlink_target(&self) -> Option<String> {
        match &*self.body.lock() {
            NodeBody::Symlink { target } => Some(target.clone()),
            _ => None,
        }
    }

    /// Spill file backing a stream node. `None` for other kinds.
    pub fn spill_path(&self) -> Option<PathBuf> {
        match &*self.body.lock() {
            NodeBody::Stream { spill } => Some(spill.clone()),
            _ => None,
        }
    }

    /// Replace a regular file's contents under the node lock, returning
    /// the signed size delta for the parent rollup. No-op on other
    /// kinds.
    pub(crate) fn update_contents(&self, new: Bytes) -> i64 {
        let mut body = self.body.lock();
        match &mut *body {
            NodeBody::RegularFile { contents } => {
                let old = contents.len() as i64;
                let delta = new.len() as i64 - old;
                self.set_size(new.len() as u64);
                *contents = new;
                delta
            }
            _ => 0,
        }
    }

    /// Repoint a symlink under the node lock. No-op on other kinds.
    pub(crate) fn repoint(&self, target: &str) {
        if let NodeBody::Symlink { target: current } = &mut *self.body.lock() {
            *current = target.to_owned();
        }
    }

    /// Look up an extended attribute by name.
    pub fn xattr(&self, name: &str) -> Option<String> {
        self.xattrs
            .lock()
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    }

    /// Add an extended attribute. An existing attribute of the same name
    /// is replaced only when `overwrite` is set.
    pub fn set_xattr(&self, name: &str, value: &str, overwrite: bool) {
        let mut xattrs = self.xattrs.lock();
        if let Some(entry) = xattrs.iter_mut().find(|(key, _)| key == name) {
            if overwrite {
                entry.1 = value.to_owned();
            }
            return;
        }
        xattrs.push((name.to_owned(), value.to_owned()));
    }

    /// List extended attribute names.
    pub fn xattr_names(&self) -> Vec<String> {
        self.xattrs.lock().iter().map(|(key, _)| key.clone()).collect()
    }
}
