use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use super::Context;
use crate::{
    engines::LoaderEngine,
    image::{LoadedImage, Protections},
    monitor::ImageMonitor,
    registry::{ImageNotifier, RuntimeHooks},
};

impl<E: LoaderEngine> Context<E> {
    pub fn image_count(&self) -> usize {
        self.registry.count()
    }

    /// Load address of the `index`th image in load order.
    pub fn image_header(&self, index: usize) -> Option<usize> {
        self.registry
            .find_by_load_order(index)
            .map(|li| li.load_address())
    }

    pub fn image_name(&self, index: usize) -> Option<String> {
        self.registry
            .find_by_load_order(index)
            .map(|li| li.path().to_string())
    }

    pub fn image_slide(&self, load_address: usize) -> Option<isize> {
        self.registry
            .find_by_load_address(load_address)
            .map(|li| li.slide())
    }

    pub fn image_uuid(&self, load_address: usize) -> Option<Uuid> {
        self.registry
            .find_by_load_address(load_address)
            .map(|li| li.descriptor().uuid())
    }

    /// Load address of the image whose segments contain `addr`.
    pub fn image_containing_address(&self, addr: usize) -> Option<usize> {
        self.registry
            .find_by_owned_address(addr)
            .map(|(li, _)| li.load_address())
    }

    /// True if `len` bytes at `addr` lie within a single read-only segment of a loaded image that
    /// can never be unloaded.
    pub fn is_memory_immutable(&self, addr: usize, len: usize) -> bool {
        let Some((image, _)) = self.registry.find_by_owned_address(addr) else {
            return false;
        };
        let Some((range, prot)) = image.segment_containing(addr) else {
            return false;
        };
        image.is_never_unload()
            && !prot.contains(Protections::WRITE)
            && addr.checked_add(len).is_some_and(|end| end <= range.end)
    }

    /// Check whether `path` could be opened, without loading anything.
    pub fn dlopen_preflight(&self, path: &str) -> bool {
        let ok = self.config.path_variants(path).iter().any(|p| {
            self.registry.find_by_path(p).is_some()
                || self.groups.find_by_path(p).is_some()
                || self.engine.can_load(p)
        });
        debug!("dlopen_preflight({}) => {}", path, ok);
        ok
    }

    /// Call `notifier` for every image loaded from now on, and right away for each image already
    /// loaded.
    pub fn add_load_notifier(&self, notifier: impl Fn(usize, isize) + Send + Sync + 'static) {
        let _guard = self.api_lock.lock();
        let existing: Vec<LoadedImage> = self.registry.iter().collect();
        let notifier: ImageNotifier = Arc::new(notifier);
        self.registry
            .notifiers()
            .add_load_notifier(notifier, &existing);
    }

    pub fn add_unload_notifier(&self, notifier: impl Fn(usize, isize) + Send + Sync + 'static) {
        self.registry
            .notifiers()
            .add_unload_notifier(Arc::new(notifier));
    }

    /// Install the language runtime's hooks. Images with runtime metadata that are already
    /// loaded are reported to `mapped` immediately.
    pub fn set_runtime_hooks(&self, hooks: RuntimeHooks) {
        let _guard = self.api_lock.lock();
        let existing: Vec<LoadedImage> = self.registry.iter().collect();
        self.registry
            .notifiers()
            .set_runtime_hooks(hooks, &existing);
    }

    /// Attach an external monitor. Returns its slot, or None if every slot is taken.
    pub fn register_monitor(&self, monitor: Arc<dyn ImageMonitor>) -> Option<usize> {
        self.registry.notifiers().monitors().register(monitor)
    }

    pub fn deregister_monitor(&self, slot: usize) {
        self.registry.notifiers().monitors().deregister(slot)
    }
}
