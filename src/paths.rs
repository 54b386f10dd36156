use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[derive(Default)]
struct Node {
    children: BTreeMap<OsString, Node>,
}

/// The smallest set of directories that between them contain every path.
///
/// Native watchers are set up per directory and aren't free, so nested
/// directories are folded into their topmost ancestor in the set.
pub fn common_roots<P: AsRef<Path>>(paths: &[P]) -> Vec<PathBuf> {
    let mut parts: Vec<Vec<OsString>> = paths
        .iter()
        .map(|p| {
            p.as_ref()
                .components()
                .map(|c| c.as_os_str().to_os_string())
                .collect()
        })
        .collect();
    // Longest first, so a shorter prefix clears everything below it.
    parts.sort_by_key(|chunks| std::cmp::Reverse(chunks.len()));

    let mut tree = Node::default();
    for chunks in parts {
        let mut node = &mut tree;
        for chunk in chunks {
            node = node.children.entry(chunk).or_default();
        }
        node.children.clear();
    }

    let mut roots = Vec::new();
    walk(&tree, PathBuf::new(), &mut roots);
    roots
}

fn walk(node: &Node, path: PathBuf, roots: &mut Vec<PathBuf>) {
    if node.children.is_empty() {
        if !path.as_os_str().is_empty() {
            roots.push(path);
        }
        return;
    }

    for (chunk, child) in &node.children {
        walk(child, path.join(chunk), roots);
    }
}
