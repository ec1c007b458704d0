//! Plain-text rendering of the demux tree.

use std::sync::Arc;

use streamfs_core::dentry::{Dentry, NodeKind, XATTR_FORMAT};

/// Render the tree under `root` into a string, children in insertion
/// order.
pub fn render_tree(root: &Arc<Dentry>) -> String {
    let mut out = String::new();
    for child in root.children() {
        render_node(&child, 0, &mut out);
    }
    out
}

/// Print the tree under `root` to stdout.
pub fn dump_tree(root: &Arc<Dentry>) {
    print!("{}", render_tree(root));
}

fn render_node(node: &Arc<Dentry>, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    let name = node.name();
    match node.kind() {
        NodeKind::Directory => {
            out.push_str(&format!("{}{}/ ({} bytes)\n", indent, name, node.size()));
            for child in node.children() {
                render_node(&child, depth + 1, out);
            }
        }
        NodeKind::RegularFile => {
            let format = node.xattr(XATTR_FORMAT).unwrap_or_default();
            out.push_str(&format!(
                "{}{} ({} bytes, {})\n",
                indent,
                name,
                node.size(),
                format
            ));
        }
        NodeKind::Symlink => {
            let target = node.symlink_target().unwrap_or_default();
            out.push_str(&format!("{}{} -> {}\n", indent, name, target));
        }
        NodeKind::Stream => {
            out.push_str(&format!("{}{} ({} bytes, stream)\n", indent, name, node.size()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use streamfs_core::tree;

    #[test]
    fn test_render_shows_kinds_and_sizes() {
        let root = Dentry::directory("/");
        let table = tree::create_directory(&root, "PAT");
        let version = tree::create_version_dir(&table, 1);
        tree::create_file(&version, "raw", Bytes::from_static(b"abcd"));

        let rendered = render_tree(&root);
        assert!(rendered.contains("PAT/ (4 bytes)"));
        assert!(rendered.contains("1/ (4 bytes)"));
        assert!(rendered.contains("raw (4 bytes, bin)"));
        assert!(rendered.contains("Current -> 1"));
    }
}
