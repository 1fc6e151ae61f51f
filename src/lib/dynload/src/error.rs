//! Definitions for errors for the dynamic loader.
use itertools::{Either, Itertools};
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic, Default)]
#[error("{kind}")]
pub struct DynloadError {
    pub kind: DynloadErrorKind,
    #[related]
    pub related: Vec<DynloadError>,
}

impl DynloadError {
    pub fn new_collect(kind: DynloadErrorKind, related: Vec<DynloadError>) -> Self {
        Self { kind, related }
    }

    pub fn new(kind: DynloadErrorKind) -> Self {
        Self {
            kind,
            related: vec![],
        }
    }

    pub fn collect<I, T>(parent_kind: DynloadErrorKind, it: I) -> Result<Vec<T>, DynloadError>
    where
        I: IntoIterator<Item = Result<T, DynloadError>>,
    {
        // Collect errors and values, and then if there any errors, build a new error from them.
        let (vals, errs): (Vec<T>, Vec<DynloadError>) =
            it.into_iter().partition_map(|item| match item {
                Ok(o) => Either::Left(o),
                Err(e) => Either::Right(e),
            });

        if errs.is_empty() {
            Ok(vals)
        } else {
            Err(DynloadError {
                kind: parent_kind,
                related: errs,
            })
        }
    }

    /// True if this error is a negative lookup result rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.kind,
            DynloadErrorKind::SymbolNotFound { .. } | DynloadErrorKind::NotLoaded { .. }
        )
    }
}

impl From<DynloadErrorKind> for DynloadError {
    fn from(value: DynloadErrorKind) -> Self {
        Self {
            kind: value,
            related: vec![],
        }
    }
}

impl From<TrieError> for DynloadError {
    fn from(value: TrieError) -> Self {
        Self {
            kind: DynloadErrorKind::MalformedTrie { err: value },
            related: vec![],
        }
    }
}

#[derive(Debug, Error, Diagnostic, Default)]
pub enum DynloadErrorKind {
    #[default]
    #[error("unknown")]
    Unknown,
    #[error("malformed export trie: {err}")]
    MalformedTrie {
        #[source]
        #[from]
        #[diagnostic_source]
        err: TrieError,
    },
    #[error("unexpected > {max} images loaded for '{image}'")]
    ClosureTooLarge { image: String, max: usize },
    #[error("ordinal {ordinal} out of range for {symbol} in '{image}'")]
    OrdinalOutOfRange {
        ordinal: u64,
        symbol: String,
        image: String,
    },
    #[error("re-export cycle while resolving {symbol}")]
    ReExportCycle { symbol: String },
    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },
    #[error("invalid handle")]
    InvalidHandle,
    #[error("image '{path}' is not loaded")]
    NotLoaded { path: String },
    #[error("library '{path}' not found, needed by '{needed_by}'")]
    DependencyNotFound { path: String, needed_by: String },
    #[error("failed to enumerate dependencies for '{image}'")]
    DepEnumerationFail { image: String },
    #[error("called by unknown image (caller={addr:#x})")]
    UnknownCaller { addr: usize },
    #[error("dlopen({path}, 0x{mode:04X}): {}", format_messages(.messages))]
    ClosureBuildFail {
        path: String,
        mode: u32,
        messages: Vec<String>,
    },
    #[error("failed to map images: {message}")]
    MapFail { message: String },
}

fn format_messages(messages: &[String]) -> String {
    if messages.is_empty() {
        "closure service error".to_string()
    } else {
        messages.join(" ")
    }
}

/// Ways in which export trie bytes can be malformed.
#[derive(Debug, Error, Diagnostic, Clone, Copy, PartialEq, Eq)]
pub enum TrieError {
    #[error("uleb128 too big for uint64 at offset {offset:#x}")]
    Uleb128Overflow { offset: usize },
    #[error("malformed uleb128 at offset {offset:#x}")]
    Truncated { offset: usize },
    #[error("terminal of node {node:#x} extends past end of trie")]
    TerminalPastEnd { node: usize },
    #[error("child offset {offset:#x} out of range (trie size {size:#x})")]
    ChildOffsetOutOfRange { offset: u64, size: usize },
    #[error("cycle through node {offset:#x}")]
    Cycle { offset: usize },
    #[error("trie too deep")]
    TooDeep,
    #[error("unsupported exported symbol kind, flags={flags:#x} at node offset {node:#x}")]
    UnsupportedKind { flags: u64, node: usize },
    #[error("unterminated string at offset {offset:#x}")]
    UnterminatedString { offset: usize },
}
