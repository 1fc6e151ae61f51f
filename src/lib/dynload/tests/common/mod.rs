#![allow(dead_code)]

use std::sync::Arc;

use dynload::{
    engines::memory::InMemoryEngine,
    image::{
        Dependency, DependencyKind, GroupKind, ImageDescriptor, ImageGroup, KnownGroups,
        Protections, Segment,
    },
    trie::{builder::TrieBuilder, ExportRecord},
    Context, LoaderConfig,
};

pub const APP: &str = "/bin/app";
pub const LIBSYSTEM: &str = "/usr/lib/libSystem.dylib";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

pub fn trie(entries: &[(&str, ExportRecord)]) -> Vec<u8> {
    let mut builder = TrieBuilder::new();
    for (name, record) in entries {
        builder.add(name, record.clone());
    }
    builder.build()
}

/// A library with a text segment at offset 0 and a data segment after it, exporting regular
/// symbols at the given offsets.
pub fn lib(path: &str, deps: &[&str], symbols: &[(&str, u64)]) -> ImageDescriptor {
    let entries: Vec<_> = symbols
        .iter()
        .map(|(name, offset)| (*name, ExportRecord::Regular { offset: *offset }))
        .collect();
    lib_with_exports(path, deps, trie(&entries))
}

pub fn lib_with_exports(path: &str, deps: &[&str], exports: Vec<u8>) -> ImageDescriptor {
    let mut desc = ImageDescriptor::new(path)
        .with_segment(Segment::new(0, 0x1000, Protections::READ | Protections::EXEC))
        .with_segment(Segment::new(
            0x1000,
            0x1000,
            Protections::READ | Protections::WRITE,
        ))
        .with_exports(exports);
    for dep in deps {
        desc = desc.with_dependency(Dependency::new(dep, DependencyKind::Regular));
    }
    desc
}

pub type TestContext = Context<InMemoryEngine>;

/// A context that has launched `/bin/app`, which depends on libSystem from the shared cache.
pub fn launched() -> Arc<TestContext> {
    launched_with(LoaderConfig::default())
}

pub fn launched_with(config: LoaderConfig) -> Arc<TestContext> {
    init_tracing();
    let system = lib(LIBSYSTEM, &[], &[("_malloc", 0x100), ("_free", 0x200)]);
    let app = lib(APP, &[LIBSYSTEM], &[("_main", 0x10), ("_shared", 0x20)]);
    let groups = KnownGroups::new(
        ImageGroup::new(GroupKind::CachedImages, [system]),
        ImageGroup::new(GroupKind::OtherImages, Vec::<ImageDescriptor>::new()),
        ImageGroup::new(GroupKind::MainClosure, [app]),
    );
    let ctx = Context::new(InMemoryEngine::new(0x10_0000), config, groups);
    ctx.launch(APP).unwrap();
    Arc::new(ctx)
}

/// Paths currently loaded, in load order.
pub fn loaded_paths(ctx: &TestContext) -> Vec<String> {
    (0..ctx.image_count())
        .filter_map(|i| ctx.image_name(i))
        .collect()
}
