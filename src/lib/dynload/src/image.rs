//! Image descriptors and the per-mapping state the loader tracks for them.

use std::{
    collections::hash_map::DefaultHasher,
    fmt::Display,
    hash::{Hash, Hasher},
    ops::Range,
    sync::Arc,
};

use uuid::Uuid;

mod group;
pub use group::*;

/// Upper bound on a closure size for descriptors that do not declare one.
pub const DEFAULT_MAX_LOAD_COUNT: usize = 1024;

/// Load paths starting with this marker are resolved through the parent image's own resolved
/// dependency rather than by path.
pub const RPATH_PREFIX: &str = "@rpath/";

/// Identity of an image, derived from its install path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub u64);

impl ImageId {
    pub fn from_path(path: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        Self(hasher.finish())
    }
}

impl Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

bitflags::bitflags! {
    /// Static properties of an image.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ImageFlags: u32 {
        /// The image may never be unloaded once mapped.
        const NEVER_UNLOAD = 1;
        /// The image carries runtime metadata that the registered runtime hooks want to see.
        const HAS_OBJC_METADATA = 2;
        /// The runtime's init hook must run before the image's initializers.
        const MAY_HAVE_EAGER_INIT_HOOKS = 4;
    }
}

bitflags::bitflags! {
    /// Memory protections of a segment.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct Protections: u8 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    Regular,
    /// Absence of the dependency is not an error.
    Weak,
    /// Exports of the dependency are visible as exports of the parent.
    ReExport,
    Upward,
}

/// One entry in an image's ordered dependency list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub load_path: String,
    pub kind: DependencyKind,
    /// The image this dependency was bound to when the closure was built, if known.
    pub resolved: Option<ImageId>,
}

impl Dependency {
    pub fn new(load_path: impl ToString, kind: DependencyKind) -> Self {
        Self {
            load_path: load_path.to_string(),
            kind,
            resolved: None,
        }
    }

    pub fn resolved_to(mut self, id: ImageId) -> Self {
        self.resolved = Some(id);
        self
    }

    pub fn is_relative(&self) -> bool {
        self.load_path.starts_with(RPATH_PREFIX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub vm_offset: usize,
    pub vm_size: usize,
    pub protections: Protections,
}

impl Segment {
    pub fn new(vm_offset: usize, vm_size: usize, protections: Protections) -> Self {
        Self {
            vm_offset,
            vm_size,
            protections,
        }
    }

    pub fn range_at(&self, load_address: usize) -> Range<usize> {
        let start = load_address + self.vm_offset;
        start..start + self.vm_size
    }
}

/// Immutable description of one binary, as produced by a closure. Shared between the group that
/// owns it and every mapping of it.
#[derive(Debug, Clone)]
pub struct ImageDescriptor {
    path: String,
    id: ImageId,
    uuid: Uuid,
    flags: ImageFlags,
    dependencies: Vec<Dependency>,
    exports: Arc<[u8]>,
    segments: Vec<Segment>,
    preferred_load_address: usize,
    max_load_count: usize,
}

impl ImageDescriptor {
    pub fn new(path: impl ToString) -> Self {
        let path = path.to_string();
        Self {
            id: ImageId::from_path(&path),
            path,
            uuid: Uuid::nil(),
            flags: ImageFlags::empty(),
            dependencies: vec![],
            exports: Arc::from(Vec::<u8>::new()),
            segments: vec![],
            preferred_load_address: 0,
            max_load_count: DEFAULT_MAX_LOAD_COUNT,
        }
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn with_flags(mut self, flags: ImageFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_dependency(mut self, dep: Dependency) -> Self {
        self.dependencies.push(dep);
        self
    }

    pub fn with_exports(mut self, trie: impl Into<Arc<[u8]>>) -> Self {
        self.exports = trie.into();
        self
    }

    pub fn with_segment(mut self, segment: Segment) -> Self {
        self.segments.push(segment);
        self
    }

    pub fn with_preferred_load_address(mut self, addr: usize) -> Self {
        self.preferred_load_address = addr;
        self
    }

    pub fn with_max_load_count(mut self, max: usize) -> Self {
        self.max_load_count = max;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The final path component.
    pub fn leaf_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn flags(&self) -> ImageFlags {
        self.flags
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Raw bytes of the export trie.
    pub fn exports(&self) -> &[u8] {
        &self.exports
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn preferred_load_address(&self) -> usize {
        self.preferred_load_address
    }

    pub fn max_load_count(&self) -> usize {
        self.max_load_count
    }

    /// Size of the address range covered by all segments.
    pub fn vm_size(&self) -> usize {
        self.segments
            .iter()
            .map(|s| s.vm_offset + s.vm_size)
            .max()
            .unwrap_or(0)
    }
}

impl Display for ImageDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum InitState {
    #[default]
    Uninited,
    BeingInited,
    Inited,
}

/// A currently mapped image.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    load_address: usize,
    descriptor: Arc<ImageDescriptor>,
    state: InitState,
    never_unload: bool,
}

impl LoadedImage {
    pub fn new(descriptor: Arc<ImageDescriptor>, load_address: usize) -> Self {
        Self {
            load_address,
            never_unload: descriptor.flags().contains(ImageFlags::NEVER_UNLOAD),
            descriptor,
            state: InitState::Uninited,
        }
    }

    pub fn load_address(&self) -> usize {
        self.load_address
    }

    pub fn descriptor(&self) -> &Arc<ImageDescriptor> {
        &self.descriptor
    }

    pub fn path(&self) -> &str {
        self.descriptor.path()
    }

    pub fn state(&self) -> InitState {
        self.state
    }

    /// Advance the init state. Returns false (and leaves the state alone) if `state` would move
    /// it backwards or nowhere.
    pub(crate) fn advance(&mut self, state: InitState) -> bool {
        if state > self.state {
            self.state = state;
            true
        } else {
            false
        }
    }

    pub fn is_never_unload(&self) -> bool {
        self.never_unload
    }

    pub(crate) fn set_never_unload(&mut self) {
        self.never_unload = true;
    }

    /// Difference between where the image was mapped and where it was linked to be mapped.
    pub fn slide(&self) -> isize {
        self.load_address
            .wrapping_sub(self.descriptor.preferred_load_address()) as isize
    }

    /// Returns the protections of the segment containing `addr`, if this image maps it.
    pub fn segment_containing(&self, addr: usize) -> Option<(Range<usize>, Protections)> {
        self.descriptor
            .segments()
            .iter()
            .map(|s| (s.range_at(self.load_address), s.protections))
            .find(|(r, _)| r.contains(&addr))
    }

    /// Executable ranges of this mapping.
    pub fn executable_ranges(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.descriptor
            .segments()
            .iter()
            .filter(|s| s.protections.contains(Protections::EXEC))
            .map(|s| s.range_at(self.load_address))
    }
}

impl PartialEq for LoadedImage {
    fn eq(&self, other: &Self) -> bool {
        self.load_address == other.load_address && self.descriptor.id() == other.descriptor.id()
    }
}

impl Eq for LoadedImage {}

impl Display for LoadedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{:#x}", self.descriptor.path(), self.load_address)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn state_only_advances() {
        let desc = Arc::new(ImageDescriptor::new("/usr/lib/liba.dylib"));
        let mut img = LoadedImage::new(desc, 0x1000);
        assert_eq!(img.state(), InitState::Uninited);
        assert!(img.advance(InitState::BeingInited));
        assert!(!img.advance(InitState::BeingInited));
        assert!(img.advance(InitState::Inited));
        assert!(!img.advance(InitState::Uninited));
        assert_eq!(img.state(), InitState::Inited);
    }

    #[test]
    fn equality_is_descriptor_and_address() {
        let a = Arc::new(ImageDescriptor::new("/usr/lib/liba.dylib"));
        let b = Arc::new(ImageDescriptor::new("/usr/lib/libb.dylib"));
        assert_eq!(
            LoadedImage::new(a.clone(), 0x1000),
            LoadedImage::new(a.clone(), 0x1000)
        );
        assert_ne!(
            LoadedImage::new(a.clone(), 0x1000),
            LoadedImage::new(a, 0x2000)
        );
        assert_ne!(
            LoadedImage::new(b, 0x1000),
            LoadedImage::new(Arc::new(ImageDescriptor::new("/x")), 0x1000)
        );
    }

    #[test]
    fn segments_and_slide() {
        let desc = Arc::new(
            ImageDescriptor::new("/usr/lib/liba.dylib")
                .with_preferred_load_address(0x1000)
                .with_segment(Segment::new(0, 0x1000, Protections::READ | Protections::EXEC))
                .with_segment(Segment::new(
                    0x1000,
                    0x800,
                    Protections::READ | Protections::WRITE,
                ))
                .with_flags(ImageFlags::NEVER_UNLOAD),
        );
        let img = LoadedImage::new(desc.clone(), 0x5000);
        assert!(img.is_never_unload());
        assert_eq!(img.slide(), 0x4000);
        assert_eq!(desc.vm_size(), 0x1800);
        assert_eq!(desc.leaf_name(), "liba.dylib");
        let (range, prot) = img.segment_containing(0x6100).unwrap();
        assert_eq!(range, 0x6000..0x6800);
        assert!(prot.contains(Protections::WRITE));
        assert!(img.segment_containing(0x6800).is_none());
        assert_eq!(img.executable_ranges().collect::<Vec<_>>(), vec![0x5000..0x6000]);
    }
}
