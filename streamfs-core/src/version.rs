//! Table version control.
//!
//! Every concrete table parser applies the same policy: parse the
//! common header, derive the table identity, and decide under the cache
//! lock whether the incoming section is brand new, a continuation of
//! the cached generation, or a version bump that replaces it. The two
//! replacement variants both exist in the wild — a table either wants
//! its old children carried over (cross-references by path stay valid)
//! or wants a clean slate — so the policy is chosen explicitly per
//! table type.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::CacheGuard;
use crate::dentry::Dentry;
use crate::error::DemuxError;
use crate::psi::PsiHeader;
use crate::tree;

/// 64-bit identity addressing one logical table stream regardless of
/// version: PID and table id, with an optional table-specific
/// disambiguator in the upper bits for tables that multiplex several
/// logical streams on one PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableIdentity(u64);

impl TableIdentity {
    /// Identity from the demultiplexer-assigned PID and the table id.
    pub fn new(pid: u16, table_id: u8) -> Self {
        TableIdentity(((pid as u64) << 16) | table_id as u64)
    }

    /// Identity with a table-specific disambiguator (e.g. a module id).
    pub fn with_extension(pid: u16, table_id: u8, extension: u16) -> Self {
        TableIdentity(((extension as u64) << 32) | ((pid as u64) << 16) | table_id as u64)
    }

    /// Raw cache key.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// How a version bump treats the previous generation's subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionPolicy {
    /// Move the old root's children onto the new root, then dispose the
    /// empty shell. Paths into the old generation stay resolvable.
    MigrateChildren,
    /// Dispose the old subtree outright and start empty.
    Discard,
}

/// Kind-specific table state.
#[derive(Debug)]
pub enum TableState {
    /// Nothing beyond the subtree itself.
    Plain,
    /// Carousel block tracking for DDB streams.
    Carousel(CarouselState),
}

/// Per-module block bookkeeping for one cached carousel table.
#[derive(Debug, Default)]
pub struct CarouselState {
    modules: HashMap<u16, ModuleBlockSet>,
}

impl CarouselState {
    /// Whether `(module_id, block_number)` has already been recorded for
    /// the module's current incarnation.
    pub fn is_duplicate(&self, module_id: u16, module_version: u8, block_number: u16) -> bool {
        self.modules
            .get(&module_id)
            .map(|set| set.version == module_version && set.blocks.contains(&block_number))
            .unwrap_or(false)
    }

    /// Record a written block. A module version change starts a fresh
    /// incarnation, clearing the previous block set.
    pub fn record(&mut self, module_id: u16, module_version: u8, block_number: u16) {
        let set = self
            .modules
            .entry(module_id)
            .or_insert_with(|| ModuleBlockSet::new(module_version));
        if set.version != module_version {
            *set = ModuleBlockSet::new(module_version);
        }
        set.blocks.insert(block_number);
    }

    /// Blocks recorded for a module's current incarnation.
    pub fn block_count(&self, module_id: u16) -> usize {
        self.modules.get(&module_id).map(|set| set.blocks.len()).unwrap_or(0)
    }
}

/// Block numbers seen for one incarnation of a carousel module.
#[derive(Debug)]
pub struct ModuleBlockSet {
    version: u8,
    blocks: HashSet<u16>,
}

impl ModuleBlockSet {
    fn new(version: u8) -> Self {
        ModuleBlockSet {
            version,
            blocks: HashSet::new(),
        }
    }
}

/// Reassembly progress of one carousel module. Completion is size-based
/// only: the spill file reaching the declared module size is the sole
/// signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModulePhase {
    Empty,
    Accumulating,
    Complete,
}

/// Classify a module from its spill length and declared total size.
pub fn module_phase(spill_len: u64, declared_size: Option<u64>) -> ModulePhase {
    if spill_len == 0 {
        ModulePhase::Empty
    } else if matches!(declared_size, Some(total) if spill_len >= total) {
        ModulePhase::Complete
    } else {
        ModulePhase::Accumulating
    }
}

/// One materialized table generation: the identity, the version it
/// carries, and the owned subtree root.
#[derive(Debug)]
pub struct CachedTable {
    identity: TableIdentity,
    version_number: u8,
    root: Arc<Dentry>,
    state: Mutex<TableState>,
}

impl CachedTable {
    /// Cache entry with no kind-specific state.
    pub fn new(identity: TableIdentity, version_number: u8, root: Arc<Dentry>) -> Arc<Self> {
        Arc::new(CachedTable {
            identity,
            version_number,
            root,
            state: Mutex::new(TableState::Plain),
        })
    }

    /// Cache entry carrying carousel block tracking.
    pub fn new_carousel(identity: TableIdentity, version_number: u8, root: Arc<Dentry>) -> Arc<Self> {
        Arc::new(CachedTable {
            identity,
            version_number,
            root,
            state: Mutex::new(TableState::Carousel(CarouselState::default())),
        })
    }

    pub fn identity(&self) -> TableIdentity {
        self.identity
    }

    pub fn version_number(&self) -> u8 {
        self.version_number
    }

    /// Root of the owned subtree.
    pub fn root(&self) -> &Arc<Dentry> {
        &self.root
    }

    /// Run `f` against the carousel state. `None` for plain tables.
    pub fn with_carousel<R>(&self, f: impl FnOnce(&mut CarouselState) -> R) -> Option<R> {
        match &mut *self.state.lock() {
            TableState::Carousel(state) => Some(f(state)),
            TableState::Plain => None,
        }
    }
}

/// Outcome of the cached-version comparison for an incoming section.
#[derive(Debug)]
pub enum VersionDecision {
    /// current_next_indicator is clear; the section must not mutate
    /// anything.
    Ignore,
    /// No cached table for this identity.
    New,
    /// Same generation as the cached table; accrete, do not create a
    /// new version directory.
    Continuation(Arc<CachedTable>),
    /// Version bump; the cached generation is replaced.
    Replace(Arc<CachedTable>),
}

/// Apply the decision table against the cache. Must be called with the
/// same guard that the subsequent mutation will use, so the
/// read-decide-write window is atomic per identity.
pub fn decide(
    guard: &CacheGuard<'_, CachedTable>,
    identity: TableIdentity,
    header: &PsiHeader,
) -> VersionDecision {
    if !header.current_next_indicator {
        return VersionDecision::Ignore;
    }
    match guard.get(identity.raw()) {
        None => VersionDecision::New,
        Some(current) if current.version_number == header.version_number => {
            VersionDecision::Continuation(current)
        }
        Some(current) => VersionDecision::Replace(current),
    }
}

/// Insert a freshly materialized table. Fails with
/// [`DemuxError::CacheFull`] when no slot is free.
pub fn install(
    guard: &mut CacheGuard<'_, CachedTable>,
    table: Arc<CachedTable>,
) -> Result<(), DemuxError> {
    let capacity = guard.capacity();
    if guard.add(table.identity.raw(), table) {
        Ok(())
    } else {
        Err(DemuxError::CacheFull(capacity))
    }
}

/// Replace `old` with `new` under the given migration policy. The old
/// identity is removed from the cache before its subtree is disposed so
/// a racing lookup can never observe a half-torn-down table.
pub fn replace(
    guard: &mut CacheGuard<'_, CachedTable>,
    old: &Arc<CachedTable>,
    new: Arc<CachedTable>,
    policy: VersionPolicy,
) -> Result<(), DemuxError> {
    guard.del(old.identity.raw());
    if policy == VersionPolicy::MigrateChildren {
        tree::migrate_children(&old.root, &new.root);
    }
    tree::dispose_subtree(&old.root);
    install(guard, new)
}
