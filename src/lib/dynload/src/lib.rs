//! Welcome to the dynamic loader runtime.
//!
//! The job of this crate is the part of a dynamic loader that lives on inside a running
//! process, after the program has started:
//!   1. Keep track of every image (executable, library, or plugin) mapped into the process.
//!   2. Answer requests to open, close, and search images (dlopen, dlclose, dlsym).
//!   3. Decide when an image can go away, and tear it down safely.
//!
//! What it does not do is parse binaries, map pages, or apply relocations. Those jobs belong to
//! a [engines::LoaderEngine], which the loader calls when it has decided what needs to happen.
//! The engine also builds closures (see below) for images that nobody has precomputed.
//!
//! # Basic Concepts
//!
//! ## Images and closures
//! An image is described by an [image::ImageDescriptor]: its path, a UUID, some flags, an
//! ordered list of dependencies, and an export trie. Descriptors come in groups: the shared
//! cache's images, the main program's closure, and groups built on demand. The list of groups
//! only ever grows ([image::KnownGroups]).
//!
//! The closure of an image is the image plus everything it transitively depends on. Opening an
//! image means computing its closure ([deps::closure]), mapping the part of it that is not yet
//! loaded, registering the new images, and then running initializers bottom-up: an image's
//! dependencies are initialized before the image itself. Dependency graphs may have cycles, so
//! "bottom-up" is the post-order of a depth-first walk from the opened image.
//!
//! ## The registry
//! [registry::ImageRegistry] holds every mapped image in load order, guarded by a reader/writer
//! lock. Load order is a total order that every observer agrees on, which matters because some
//! lookups search "everything loaded after me". Notification callbacks (load and unload
//! notifiers, runtime hooks, external monitors) are never called with the lock held, since they
//! are free to call back into the loader.
//!
//! ## Unloading
//! Only images opened directly are reference counted ([refcount::ReferenceCounter]). When the
//! last reference to an image goes away, the [gc::GarbageCollector] runs a mark-and-sweep pass:
//! everything still open is live, everything a live image depends on is live, and the rest is
//! finalized, unregistered, and unmapped. A finalizer may itself close an image; the collector
//! notices it is already running and does another pass instead of recursing. Images marked
//! never-unload (statically, or promoted at runtime) are exempt.
//!
//! ## Symbols
//! Each image exports symbols through a compressed trie ([trie]). An export may be a plain
//! offset, an absolute value, a thread-local, a lazily resolved function (the loader calls a
//! resolver in the image to get the final address), or a re-export that forwards to one of the
//! image's dependencies. The [symbol::SymbolResolver] chases re-exports, and rejects cycles.
//! Trie bytes come from files the process does not fully trust, so malformed tries produce
//! errors, never panics or unbounded loops.
//!
//! ## Context
//! All of this is owned by a [context::Context], which is the dlopen/dlsym/dlclose facade.
//! Opening and closing is serialized by one lock that the same thread may re-acquire.
//!
//! ## Error Handling
//! This crate reports errors with the [DynloadError] type, which implements
//! std::error::Error and miette's Diagnostic. Failures that mean the loader's own model of the
//! process is broken (two images at one address, say) are not errors: they panic.

pub mod config;
pub mod context;
pub mod deps;
pub mod engines;
mod error;
pub use error::*;
pub mod gc;
pub mod image;
pub mod monitor;
pub mod refcount;
pub mod registry;
pub mod symbol;
pub mod trie;

pub use config::LoaderConfig;
pub use context::{Context, Handle, OpenFlags};
