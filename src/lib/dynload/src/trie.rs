//! Lookup of exported symbols in an image's export trie.
//!
//! The trie is a byte-encoded radix tree. Each node starts with the size of its terminal payload
//! as a ULEB128 (zero for non-terminal nodes), followed by the payload itself, a one-byte child
//! count, and for every child a NUL-terminated edge label and the ULEB128 offset of the child node
//! from the start of the trie. The bytes come from binaries the process does not fully trust, so
//! every offset is range checked, the walk is bounded to [MAX_TRIE_DEPTH] hops, and revisiting a
//! node on the current path is reported as a cycle.

use tracing::trace;

use crate::TrieError;

pub mod builder;

/// Maximum number of nodes visited on one walk.
pub const MAX_TRIE_DEPTH: usize = 128;

/// Mask selecting the export kind out of the terminal flags.
pub const EXPORT_KIND_MASK: u64 = 0x03;

bitflags::bitflags! {
    /// Terminal flags of an export.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ExportFlags: u64 {
        const KIND_THREAD_LOCAL = 0x01;
        const KIND_ABSOLUTE = 0x02;
        const WEAK_DEFINITION = 0x04;
        const REEXPORT = 0x08;
        const STUB_AND_RESOLVER = 0x10;
        const _ = !0;
    }
}

/// A decoded terminal payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportRecord {
    /// Offset from the image's load address.
    Regular { offset: u64 },
    /// A stub at `offset`, and a resolver function that returns the real address.
    Resolver { offset: u64, resolver_offset: u64 },
    /// Offset of the thread-local variable's descriptor from the load address.
    ThreadLocal { offset: u64 },
    Absolute { address: u64 },
    /// Defined by the dependency at the 1-based `ordinal`, possibly under another name.
    ReExport {
        ordinal: u64,
        imported_name: Option<String>,
    },
}

impl ExportRecord {
    /// Offset from the load address, for records that have one.
    pub fn image_offset(&self) -> Option<u64> {
        match self {
            ExportRecord::Regular { offset }
            | ExportRecord::Resolver { offset, .. }
            | ExportRecord::ThreadLocal { offset } => Some(*offset),
            _ => None,
        }
    }
}

/// A terminal node found by [lookup].
#[derive(Debug, Clone, Copy)]
pub struct TrieNode<'a> {
    pub offset: usize,
    pub payload: &'a [u8],
}

impl TrieNode<'_> {
    pub fn decode(&self) -> Result<ExportRecord, TrieError> {
        let mut r = Reader::new(self.payload, self.offset);
        let flags = r.uleb()?;
        if ExportFlags::from_bits_retain(flags).contains(ExportFlags::REEXPORT) {
            let ordinal = r.uleb()?;
            let name = r.cstr()?;
            let imported_name =
                (!name.is_empty()).then(|| String::from_utf8_lossy(name).into_owned());
            return Ok(ExportRecord::ReExport {
                ordinal,
                imported_name,
            });
        }

        let value = r.uleb()?;
        match flags & EXPORT_KIND_MASK {
            0 if ExportFlags::from_bits_retain(flags).contains(ExportFlags::STUB_AND_RESOLVER) => {
                Ok(ExportRecord::Resolver {
                    offset: value,
                    resolver_offset: r.uleb()?,
                })
            }
            0 => Ok(ExportRecord::Regular { offset: value }),
            1 => Ok(ExportRecord::ThreadLocal { offset: value }),
            2 => Ok(ExportRecord::Absolute { address: value }),
            _ => Err(TrieError::UnsupportedKind {
                flags,
                node: self.offset,
            }),
        }
    }
}

/// Cursor over trie bytes. `base` is added to positions when reporting errors.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8], base: usize) -> Self {
        Self {
            bytes,
            pos: 0,
            base,
        }
    }

    fn at(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos, base: 0 }
    }

    fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn uleb(&mut self) -> Result<u64, TrieError> {
        let offset = self.offset();
        let mut rest = self
            .bytes
            .get(self.pos..)
            .ok_or(TrieError::Truncated { offset })?;
        let before = rest.len();
        let value = leb128::read::unsigned(&mut rest).map_err(|e| match e {
            leb128::read::Error::Overflow => TrieError::Uleb128Overflow { offset },
            leb128::read::Error::IoError(_) => TrieError::Truncated { offset },
        })?;
        self.pos += before - rest.len();
        Ok(value)
    }

    fn byte(&mut self) -> Result<u8, TrieError> {
        let b = *self.bytes.get(self.pos).ok_or(TrieError::Truncated {
            offset: self.offset(),
        })?;
        self.pos += 1;
        Ok(b)
    }

    fn cstr(&mut self) -> Result<&'a [u8], TrieError> {
        let offset = self.offset();
        let rest = self
            .bytes
            .get(self.pos..)
            .ok_or(TrieError::UnterminatedString { offset })?;
        let len = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(TrieError::UnterminatedString { offset })?;
        self.pos += len + 1;
        Ok(&rest[..len])
    }
}

/// The parts of a node needed to continue a walk.
struct Node<'a> {
    payload: &'a [u8],
    children: Reader<'a>,
    child_count: u8,
}

fn read_node(trie: &[u8], offset: usize) -> Result<Node<'_>, TrieError> {
    let mut r = Reader::at(trie, offset);
    let terminal_size = r.uleb()?;
    let start = r.pos;
    let end = usize::try_from(terminal_size)
        .ok()
        .and_then(|size| start.checked_add(size))
        .filter(|end| *end <= trie.len())
        .ok_or(TrieError::TerminalPastEnd { node: offset })?;
    r.pos = end;
    let child_count = r.byte()?;
    Ok(Node {
        payload: &trie[start..end],
        children: r,
        child_count,
    })
}

fn check_child(trie: &[u8], offset: u64) -> Result<usize, TrieError> {
    usize::try_from(offset)
        .ok()
        .filter(|o| *o < trie.len())
        .ok_or(TrieError::ChildOffsetOutOfRange {
            offset,
            size: trie.len(),
        })
}

/// Walk the trie looking for `name`. Returns the terminal node for it, or `None` if the trie does
/// not export it.
pub fn lookup<'a>(trie: &'a [u8], name: &str) -> Result<Option<TrieNode<'a>>, TrieError> {
    if trie.is_empty() {
        return Ok(None);
    }
    let mut remaining = name.as_bytes();
    let mut offset = 0;
    let mut path = Vec::with_capacity(16);
    loop {
        if path.len() >= MAX_TRIE_DEPTH {
            return Err(TrieError::TooDeep);
        }
        path.push(offset);

        let mut node = read_node(trie, offset)?;
        if remaining.is_empty() && !node.payload.is_empty() {
            return Ok(Some(TrieNode {
                offset,
                payload: node.payload,
            }));
        }

        let mut next = None;
        for _ in 0..node.child_count {
            let label = node.children.cstr()?;
            let child = node.children.uleb()?;
            if remaining.starts_with(label) {
                next = Some((label.len(), child));
                break;
            }
        }
        let Some((consumed, child)) = next else {
            trace!("{} not in trie", name);
            return Ok(None);
        };

        let child = check_child(trie, child)?;
        if path.contains(&child) {
            return Err(TrieError::Cycle { offset: child });
        }
        remaining = &remaining[consumed..];
        offset = child;
    }
}

/// Look up `name` and decode its payload.
pub fn find_export(trie: &[u8], name: &str) -> Result<Option<ExportRecord>, TrieError> {
    lookup(trie, name)?.map(|node| node.decode()).transpose()
}

/// Every export in the trie, in trie order.
pub fn exports(trie: &[u8]) -> Result<Vec<(String, ExportRecord)>, TrieError> {
    let mut out = vec![];
    if !trie.is_empty() {
        walk(trie, 0, &mut vec![], &mut vec![], &mut out)?;
    }
    Ok(out)
}

fn walk(
    trie: &[u8],
    offset: usize,
    prefix: &mut Vec<u8>,
    path: &mut Vec<usize>,
    out: &mut Vec<(String, ExportRecord)>,
) -> Result<(), TrieError> {
    if path.len() >= MAX_TRIE_DEPTH {
        return Err(TrieError::TooDeep);
    }
    if path.contains(&offset) {
        return Err(TrieError::Cycle { offset });
    }
    path.push(offset);

    let mut node = read_node(trie, offset)?;
    if !node.payload.is_empty() {
        let record = TrieNode {
            offset,
            payload: node.payload,
        }
        .decode()?;
        out.push((String::from_utf8_lossy(prefix).into_owned(), record));
    }
    for _ in 0..node.child_count {
        let label = node.children.cstr()?;
        let child = check_child(trie, node.children.uleb()?)?;
        let len = prefix.len();
        prefix.extend_from_slice(label);
        walk(trie, child, prefix, path, out)?;
        prefix.truncate(len);
    }

    path.pop();
    Ok(())
}
