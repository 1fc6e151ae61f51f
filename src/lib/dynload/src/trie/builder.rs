//! Producing export tries from a name to export map.

use std::collections::BTreeMap;

use super::{ExportFlags, ExportRecord};

#[derive(Default)]
struct BuildNode {
    terminal: Vec<u8>,
    children: Vec<(Vec<u8>, usize)>,
}

/// Collects exports and lays them out as a trie that [super::lookup] can walk. Names must not
/// contain NUL bytes.
#[derive(Default, Clone, Debug)]
pub struct TrieBuilder {
    entries: BTreeMap<String, ExportRecord>,
}

impl TrieBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl ToString, record: ExportRecord) -> &mut Self {
        self.entries.insert(name.to_string(), record);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn build(&self) -> Vec<u8> {
        let entries: Vec<_> = self
            .entries
            .iter()
            .map(|(name, rec)| (name.as_bytes(), rec))
            .collect();
        let mut nodes = vec![];
        build_node(&entries, &mut nodes);

        // Child offsets are ULEB128s, so node sizes depend on the offsets and vice versa. Sizes
        // only grow, so iterate until the layout is stable.
        let mut offsets = vec![0usize; nodes.len()];
        loop {
            let mut changed = false;
            let mut offset = 0;
            for (i, node) in nodes.iter().enumerate() {
                if offsets[i] != offset {
                    offsets[i] = offset;
                    changed = true;
                }
                offset += node_size(node, &offsets);
            }
            if !changed {
                break;
            }
        }

        let mut out = vec![];
        for node in &nodes {
            push_uleb(&mut out, node.terminal.len() as u64);
            out.extend_from_slice(&node.terminal);
            out.push(node.children.len() as u8);
            for (label, child) in &node.children {
                out.extend_from_slice(label);
                out.push(0);
                push_uleb(&mut out, offsets[*child] as u64);
            }
        }
        out
    }
}

/// Build the node for a sorted set of suffixes, returning its index. Nodes are numbered in
/// preorder, so the root is node 0.
fn build_node(entries: &[(&[u8], &ExportRecord)], nodes: &mut Vec<BuildNode>) -> usize {
    let idx = nodes.len();
    nodes.push(BuildNode::default());

    let mut rest = entries;
    if let Some((name, rec)) = rest.first() {
        if name.is_empty() {
            encode_payload(rec, &mut nodes[idx].terminal);
            rest = &rest[1..];
        }
    }

    while let Some(&(first, _)) = rest.first() {
        let run = rest
            .iter()
            .take_while(|(name, _)| name[0] == first[0])
            .count();
        let (group, tail) = rest.split_at(run);
        rest = tail;

        let prefix = group.iter().fold(first.len(), |len, (name, _)| {
            first
                .iter()
                .zip(name.iter())
                .take(len)
                .take_while(|(a, b)| a == b)
                .count()
        });
        let stripped: Vec<_> = group
            .iter()
            .map(|(name, rec)| (&name[prefix..], *rec))
            .collect();
        let child = build_node(&stripped, nodes);
        nodes[idx].children.push((first[..prefix].to_vec(), child));
    }
    idx
}

fn node_size(node: &BuildNode, offsets: &[usize]) -> usize {
    uleb_len(node.terminal.len() as u64)
        + node.terminal.len()
        + 1
        + node
            .children
            .iter()
            .map(|(label, child)| label.len() + 1 + uleb_len(offsets[*child] as u64))
            .sum::<usize>()
}

fn encode_payload(rec: &ExportRecord, out: &mut Vec<u8>) {
    match rec {
        ExportRecord::Regular { offset } => {
            push_uleb(out, 0);
            push_uleb(out, *offset);
        }
        ExportRecord::Resolver {
            offset,
            resolver_offset,
        } => {
            push_uleb(out, ExportFlags::STUB_AND_RESOLVER.bits());
            push_uleb(out, *offset);
            push_uleb(out, *resolver_offset);
        }
        ExportRecord::ThreadLocal { offset } => {
            push_uleb(out, ExportFlags::KIND_THREAD_LOCAL.bits());
            push_uleb(out, *offset);
        }
        ExportRecord::Absolute { address } => {
            push_uleb(out, ExportFlags::KIND_ABSOLUTE.bits());
            push_uleb(out, *address);
        }
        ExportRecord::ReExport {
            ordinal,
            imported_name,
        } => {
            push_uleb(out, ExportFlags::REEXPORT.bits());
            push_uleb(out, *ordinal);
            if let Some(name) = imported_name {
                out.extend_from_slice(name.as_bytes());
            }
            out.push(0);
        }
    }
}

fn push_uleb(out: &mut Vec<u8>, value: u64) {
    // Writing into a Vec cannot fail.
    let _ = leb128::write::unsigned(out, value);
}

fn uleb_len(mut value: u64) -> usize {
    let mut len = 1;
    value >>= 7;
    while value != 0 {
        len += 1;
        value >>= 7;
    }
    len
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::trie::{find_export, lookup};

    #[test]
    fn empty_trie_has_a_root() {
        let trie = TrieBuilder::new().build();
        assert_eq!(trie, vec![0, 0]);
        assert!(lookup(&trie, "_x").unwrap().is_none());
    }

    #[test]
    fn shared_prefixes() {
        let mut b = TrieBuilder::new();
        b.add("_a", ExportRecord::Regular { offset: 1 })
            .add("_ab", ExportRecord::Regular { offset: 2 })
            .add("_abc", ExportRecord::Regular { offset: 3 })
            .add("_b", ExportRecord::Regular { offset: 4 });
        let trie = b.build();
        // root -> "_" -> {"a" -> {"b" -> {"c"}}, "b"}
        let root = lookup(&trie, "_a").unwrap().unwrap();
        assert_ne!(root.offset, 0);
        for (name, off) in [("_a", 1), ("_ab", 2), ("_abc", 3), ("_b", 4)] {
            assert_eq!(
                find_export(&trie, name).unwrap(),
                Some(ExportRecord::Regular { offset: off })
            );
        }
        assert_eq!(find_export(&trie, "_abcd").unwrap(), None);
        assert_eq!(find_export(&trie, "_c").unwrap(), None);
    }

    #[test]
    fn many_symbols_need_multibyte_offsets() {
        let mut b = TrieBuilder::new();
        for i in 0..500u64 {
            b.add(format!("_sym_{i:04}"), ExportRecord::Regular { offset: i * 16 });
        }
        let trie = b.build();
        assert!(trie.len() > 128);
        for i in (0..500u64).step_by(37) {
            assert_eq!(
                find_export(&trie, &format!("_sym_{i:04}")).unwrap(),
                Some(ExportRecord::Regular { offset: i * 16 })
            );
        }
        assert_eq!(find_export(&trie, "_sym_0500").unwrap(), None);
    }

    #[test]
    fn uleb_lengths() {
        assert_eq!(uleb_len(0), 1);
        assert_eq!(uleb_len(127), 1);
        assert_eq!(uleb_len(128), 2);
        assert_eq!(uleb_len(u64::MAX), 10);
    }
}
