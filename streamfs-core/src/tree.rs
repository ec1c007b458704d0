//! Tree primitives: idempotent constructors, version directories, child
//! migration, and subtree disposal.
//!
//! Constructors are create-or-update: calling them again for an existing
//! child refreshes that child in place instead of duplicating it.
//! Structural edits (attach, detach, migrate, dispose) assume the caller
//! serializes access to the affected identity's subtree; content updates
//! take the node's own lock via [`Dentry::update_contents`].

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use log::debug;

use crate::dentry::{Dentry, FormatHint};
use crate::names;

/// Link an unlinked node under `parent`, rolling its size into the
/// parent chain unless it is stream-like.
pub fn attach_child(parent: &Arc<Dentry>, child: &Arc<Dentry>) {
    if !child.is_stream() {
        propagate_size(parent, child.size() as i64);
    }
    *child.parent.lock() = Arc::downgrade(parent);
    parent.children.lock().push(child.clone());
}

/// Unlink `child` from `parent`, subtracting its size from the rollup.
/// Returns false if `child` is not a child of `parent`.
pub fn detach_child(parent: &Arc<Dentry>, child: &Arc<Dentry>) -> bool {
    let mut children = parent.children.lock();
    let index = match children.iter().position(|c| Arc::ptr_eq(c, child)) {
        Some(index) => index,
        None => return false,
    };
    children.remove(index);
    drop(children);

    if !child.is_stream() {
        propagate_size(parent, -(child.size() as i64));
    }
    *child.parent.lock() = std::sync::Weak::new();
    true
}

fn sub_size(node: &Dentry, amount: u64) {
    let _ = node
        .size
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
            Some(v.saturating_sub(amount))
        });
}

/// Apply a size delta to `start` and every ancestor, keeping the
/// directory-size invariant across the whole chain.
fn propagate_size(start: &Arc<Dentry>, delta: i64) {
    if delta == 0 {
        return;
    }
    let mut node = Some(start.clone());
    while let Some(current) = node {
        if delta > 0 {
            current.size.fetch_add(delta as u64, Ordering::AcqRel);
        } else {
            sub_size(&current, (-delta) as u64);
        }
        node = current.parent();
    }
}

/// Create a directory under `parent`, or return the existing one.
pub fn create_directory(parent: &Arc<Dentry>, name: &str) -> Arc<Dentry> {
    if let Some(existing) = parent.get_child(name) {
        return existing;
    }
    let dir = Dentry::directory(name);
    attach_child(parent, &dir);
    dir
}

/// Create a directory carrying an identity tag, re-matching an existing
/// node by inode anywhere in the tree and re-parenting it if a
/// duplicate-creation race left it under a different directory.
pub fn create_directory_tagged(parent: &Arc<Dentry>, name: &str, inode: u64) -> Arc<Dentry> {
    let found = find_by_inode(&tree_root(parent), inode).or_else(|| parent.get_child(name));
    match found {
        Some(existing) if existing.inode() == inode => {
            existing.set_name(name);
            reparent(parent, &existing);
            existing
        }
        _ => {
            let dir = Dentry::directory_tagged(name, inode);
            attach_child(parent, &dir);
            dir
        }
    }
}

fn tree_root(node: &Arc<Dentry>) -> Arc<Dentry> {
    let mut node = node.clone();
    while let Some(parent) = node.parent() {
        node = parent;
    }
    node
}

fn reparent(parent: &Arc<Dentry>, child: &Arc<Dentry>) {
    if let Some(old_parent) = child.parent() {
        if Arc::ptr_eq(&old_parent, parent) {
            return;
        }
        detach_child(&old_parent, child);
    }
    attach_child(parent, child);
}

/// Create a binary leaf under `parent`, or replace the contents of the
/// existing one under its lock.
pub fn create_file(parent: &Arc<Dentry>, name: &str, contents: Bytes) -> Arc<Dentry> {
    create_file_hinted(parent, name, contents, FormatHint::Bin)
}

/// Create a numeric leaf holding the hex rendering of `value`.
pub fn create_file_number(parent: &Arc<Dentry>, name: &str, value: u64) -> Arc<Dentry> {
    let rendered = format!("{:#04x}", value);
    create_file_hinted(parent, name, Bytes::from(rendered), FormatHint::Number)
}

/// Create a text leaf.
pub fn create_file_string(parent: &Arc<Dentry>, name: &str, value: &str) -> Arc<Dentry> {
    create_file_hinted(parent, name, Bytes::copy_from_slice(value.as_bytes()), FormatHint::String)
}

fn create_file_hinted(
    parent: &Arc<Dentry>,
    name: &str,
    contents: Bytes,
    format: FormatHint,
) -> Arc<Dentry> {
    if let Some(existing) = parent.get_child(name) {
        let delta = existing.update_contents(contents);
        propagate_size(parent, delta);
        return existing;
    }
    let file = Dentry::file(name, contents, format);
    attach_child(parent, &file);
    file
}

/// Create a symlink under `parent`. A no-op if a child of that name is
/// already present.
pub fn create_symlink(parent: &Arc<Dentry>, name: &str, target: &str) -> Arc<Dentry> {
    if let Some(existing) = parent.get_child(name) {
        return existing;
    }
    let link = Dentry::symlink(name, target);
    attach_child(parent, &link);
    link
}

/// Create a stream node backed by a spill file, or return the existing
/// one.
pub fn create_stream(parent: &Arc<Dentry>, name: &str, spill: std::path::PathBuf) -> Arc<Dentry> {
    if let Some(existing) = parent.get_child(name) {
        return existing;
    }
    let node = Dentry::stream(name, spill);
    attach_child(parent, &node);
    node
}

/// Materialize `version` as a numbered directory under `root` and point
/// the `Current` symlink at it, creating or repointing as needed.
pub fn create_version_dir(root: &Arc<Dentry>, version: u8) -> Arc<Dentry> {
    let name = version.to_string();
    let dir = create_directory(root, &name);
    match root.get_child(names::CURRENT) {
        Some(link) => link.repoint(&name),
        None => {
            create_symlink(root, names::CURRENT, &name);
        }
    }
    dir
}

/// Resolve the `Current` symlink under a table root.
pub fn current_version_dir(root: &Arc<Dentry>) -> Option<Arc<Dentry>> {
    let target = root.get_child(names::CURRENT)?.symlink_target()?;
    root.get_child(&target)
}

/// Walk a `/`-separated path of child names from `root`.
pub fn lookup_path(root: &Arc<Dentry>, path: &str) -> Option<Arc<Dentry>> {
    let mut node = root.clone();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        node = node.get_child(component)?;
    }
    Some(node)
}

/// Depth-first search for a tagged node in the subtree under `root`.
pub fn find_by_inode(root: &Arc<Dentry>, inode: u64) -> Option<Arc<Dentry>> {
    if inode == 0 {
        return None;
    }
    if root.inode() == inode {
        return Some(root.clone());
    }
    for child in root.children() {
        if let Some(found) = find_by_inode(&child, inode) {
            return Some(found);
        }
    }
    None
}

/// Reconstruct the absolute path of a node by walking parent links.
pub fn path_of(dentry: &Arc<Dentry>) -> String {
    let mut components = vec![dentry.name()];
    let mut node = dentry.clone();
    while let Some(parent) = node.parent() {
        components.push(parent.name());
        node = parent;
    }
    // The root's own name is the mountpoint, rendered as "/".
    components.pop();
    components.reverse();
    format!("/{}", components.join("/"))
}

/// Move every child of `source` onto `target`, fixing parent links and
/// size rollups and clearing `source`'s child list. A child whose name
/// collides with an existing child of `target` is dropped in favor of
/// the target's (the fresh generation owns those entries).
pub fn migrate_children(source: &Arc<Dentry>, target: &Arc<Dentry>) {
    let drained: Vec<Arc<Dentry>> = source.children.lock().drain(..).collect();
    for child in drained {
        let name = child.name();
        if !child.is_stream() {
            propagate_size(source, -(child.size() as i64));
        }
        if target.get_child(&name).is_some() {
            debug!("dropping migrated child {:?}: name taken on target", name);
            scrub(&child);
            continue;
        }
        if !child.is_stream() {
            propagate_size(target, child.size() as i64);
        }
        *child.parent.lock() = Arc::downgrade(target);
        target.children.lock().push(child);
    }
}

/// Recursively tear down the subtree rooted at `root`, unlinking it
/// from its parent first. The owning identity must already have been
/// removed from the table cache (remove-then-dispose).
pub fn dispose_subtree(root: &Arc<Dentry>) {
    if let Some(parent) = root.parent() {
        detach_child(&parent, root);
    }
    scrub(root);
}

fn scrub(node: &Arc<Dentry>) {
    let drained: Vec<Arc<Dentry>> = node.children.lock().drain(..).collect();
    for child in drained {
        *child.parent.lock() = std::sync::Weak::new();
        scrub(&child);
    }
    let _ = node.update_contents(Bytes::new());
    node.set_size(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dentry::NodeKind;

    #[test]
    fn test_create_directory_idempotent() {
        let root = Dentry::directory("/");
        let a = create_directory(&root, "DDB");
        let b = create_directory(&root, "DDB");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(root.children().len(), 1);
    }

    #[test]
    fn test_size_rollup_excludes_streams() {
        let root = Dentry::directory("/");
        let dir = create_directory(&root, "d");
        create_file(&dir, "a", Bytes::from_static(b"1234"));
        create_file(&dir, "b", Bytes::from_static(b"56"));
        create_stream(&dir, "es", "/tmp/es".into());
        assert_eq!(dir.size(), 6);
        assert_eq!(root.size(), 6);

        // Updating a leaf adjusts the rollup by the delta.
        create_file(&dir, "a", Bytes::from_static(b"123456789"));
        assert_eq!(dir.size(), 11);
    }

    #[test]
    fn test_create_file_updates_in_place() {
        let root = Dentry::directory("/");
        let first = create_file(&root, "f", Bytes::from_static(b"old"));
        let second = create_file(&root, "f", Bytes::from_static(b"newer"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.contents().unwrap().as_ref(), b"newer");
        assert_eq!(root.children().len(), 1);
    }

    #[test]
    fn test_version_dir_repoints_current() {
        let root = Dentry::directory("PAT");
        let v1 = create_version_dir(&root, 1);
        assert_eq!(current_version_dir(&root).map(|d| d.name()), Some("1".into()));
        let v2 = create_version_dir(&root, 2);
        assert!(!Arc::ptr_eq(&v1, &v2));
        assert_eq!(current_version_dir(&root).map(|d| d.name()), Some("2".into()));
        // Old version directory persists until disposed.
        assert!(root.get_child("1").is_some());
        // Only one Current symlink exists.
        let currents = root
            .children()
            .iter()
            .filter(|c| c.kind() == NodeKind::Symlink)
            .count();
        assert_eq!(currents, 1);
    }

    #[test]
    fn test_lookup_path_and_path_of() {
        let root = Dentry::directory("/");
        let a = create_directory(&root, "DII");
        let b = create_directory(&a, "0x30");
        let f = create_file_number(&b, "block_size", 4096);
        let found = lookup_path(&root, "/DII/0x30/block_size").unwrap();
        assert!(Arc::ptr_eq(&found, &f));
        assert_eq!(path_of(&f), "/DII/0x30/block_size");
    }

    #[test]
    fn test_migrate_children_keeps_target_on_collision() {
        let old_root = Dentry::directory("old");
        create_directory(&old_root, "1");
        create_symlink(&old_root, "Current", "1");

        let new_root = Dentry::directory("new");
        create_directory(&new_root, "2");
        create_symlink(&new_root, "Current", "2");

        migrate_children(&old_root, &new_root);
        assert!(old_root.children().is_empty());
        assert!(new_root.get_child("1").is_some());
        assert!(new_root.get_child("2").is_some());
        assert_eq!(
            new_root.get_child("Current").unwrap().symlink_target().as_deref(),
            Some("2")
        );
    }

    #[test]
    fn test_dispose_unlinks_and_scrubs() {
        let root = Dentry::directory("/");
        let table = create_directory(&root, "DDB");
        let version = create_version_dir(&table, 1);
        create_file(&version, "block_00.bin", Bytes::from_static(b"data"));
        assert_eq!(root.size(), 4);

        dispose_subtree(&table);
        assert!(root.get_child("DDB").is_none());
        assert_eq!(root.size(), 0);
        assert!(table.children().is_empty());
    }

    #[test]
    fn test_tagged_directory_rematch_and_reparent() {
        let root = Dentry::directory("/");
        let lhs = create_directory(&root, "lhs");
        let rhs = create_directory(&root, "rhs");
        let tagged = create_directory_tagged(&lhs, "prog", 42);
        // Same tag re-matches and re-parents under the new directory.
        let again = create_directory_tagged(&rhs, "prog-renamed", 42);
        assert!(Arc::ptr_eq(&tagged, &again));
        assert_eq!(tagged.name(), "prog-renamed");
        assert!(lhs.get_child("prog").is_none());
        assert!(rhs.get_child("prog-renamed").is_some());
    }

    #[test]
    fn test_number_file_rendering() {
        let root = Dentry::directory("/");
        let f = create_file_number(&root, "table_id", 0x3b);
        assert_eq!(f.contents().unwrap().as_ref(), b"0x3b");
        assert_eq!(f.xattr(crate::dentry::XATTR_FORMAT).as_deref(), Some("number"));
    }
}
