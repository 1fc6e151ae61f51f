//! The services the loader core relies on but does not implement: closure building, mapping and
//! fixups, unmapping, and running code inside images.

use std::{ops::Range, sync::Arc};

use crate::{
    image::{ImageDescriptor, ImageGroup, LoadedImage},
    DynloadError,
};

pub mod memory;

/// An image the mapper placed in memory.
#[derive(Debug, Clone)]
pub struct MappedImage {
    pub descriptor: Arc<ImageDescriptor>,
    pub load_address: usize,
}

/// The result of a successful [LoaderEngine::map_and_fixup].
#[derive(Debug, Clone, Default)]
pub struct MappedImages {
    /// Newly mapped images, in the order they were requested.
    pub images: Vec<MappedImage>,
    /// Load addresses of images (new or already loaded) that fixups pinned in memory, for
    /// example because another image now holds a weak reference into them.
    pub promoted: Vec<usize>,
}

/// Everything the loader needs from its environment. Implementations must be safe to call from
/// any thread; the loader serializes map and unmap requests itself.
pub trait LoaderEngine: Send + Sync {
    /// Build a dependency closure for an image not present in any known group. On failure,
    /// returns human readable reasons, of which the loader reports at most three.
    fn build_closure(&self, path: &str) -> Result<ImageGroup, Vec<String>>;

    /// Map `to_map` and apply fixups against the union of `to_map` and `already_loaded`. A failure
    /// leaves nothing from this request mapped.
    fn map_and_fixup(
        &self,
        to_map: &[Arc<ImageDescriptor>],
        already_loaded: &[LoadedImage],
        cache_base: usize,
    ) -> Result<MappedImages, DynloadError>;

    /// Release an image's memory. Best-effort.
    fn unmap(&self, image: &LoadedImage);

    /// Run an image's static initializers.
    fn run_initializers(&self, image: &LoadedImage);

    /// Call the lazy resolver function at `resolver` inside `image`, returning its result.
    fn call_resolver(&self, image: &LoadedImage, resolver: usize) -> usize;

    /// Run any registered finalizers whose code lies in `ranges`, which are about to be unmapped.
    fn finalize_ranges(&self, ranges: &[Range<usize>]);

    /// Check, without loading anything, whether `path` names a loadable image.
    fn can_load(&self, _path: &str) -> bool {
        false
    }
}
