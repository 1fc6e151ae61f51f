//! Callbacks fired when the set of loaded images changes.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::{
    image::{ImageFlags, LoadedImage},
    monitor::MonitorSet,
};

/// Called with `(load_address, slide)` for each affected image.
pub type ImageNotifier = Arc<dyn Fn(usize, isize) + Send + Sync>;

/// Hooks for a language runtime that keeps its own per-image metadata. `mapped` and `unmapped`
/// only see images flagged [ImageFlags::HAS_OBJC_METADATA]; `init` only runs for images flagged
/// [ImageFlags::MAY_HAVE_EAGER_INIT_HOOKS], ahead of their initializers.
pub struct RuntimeHooks {
    pub mapped: Box<dyn Fn(&[LoadedImage]) + Send + Sync>,
    pub init: Box<dyn Fn(&LoadedImage) + Send + Sync>,
    pub unmapped: Box<dyn Fn(&LoadedImage) + Send + Sync>,
}

/// All registered sinks. None of these are called with a registry lock held.
pub struct Notifiers {
    load: RwLock<Vec<ImageNotifier>>,
    unload: RwLock<Vec<ImageNotifier>>,
    hooks: RwLock<Option<Arc<RuntimeHooks>>>,
    monitors: MonitorSet,
}

fn with_metadata(images: &[LoadedImage]) -> Vec<LoadedImage> {
    images
        .iter()
        .filter(|i| {
            i.descriptor()
                .flags()
                .contains(ImageFlags::HAS_OBJC_METADATA)
        })
        .cloned()
        .collect()
}

impl Notifiers {
    pub fn new(monitors: MonitorSet) -> Self {
        Self {
            load: RwLock::new(vec![]),
            unload: RwLock::new(vec![]),
            hooks: RwLock::new(None),
            monitors,
        }
    }

    pub fn monitors(&self) -> &MonitorSet {
        &self.monitors
    }

    /// Register a load notifier. It is first called for every image in `existing`.
    pub fn add_load_notifier(&self, notifier: ImageNotifier, existing: &[LoadedImage]) {
        for image in existing {
            notifier(image.load_address(), image.slide());
        }
        self.load.write().push(notifier);
    }

    pub fn add_unload_notifier(&self, notifier: ImageNotifier) {
        self.unload.write().push(notifier);
    }

    /// Install runtime hooks, reporting the already loaded metadata images to `mapped`.
    pub fn set_runtime_hooks(&self, hooks: RuntimeHooks, existing: &[LoadedImage]) {
        let hooks = Arc::new(hooks);
        *self.hooks.write() = Some(hooks.clone());
        let meta = with_metadata(existing);
        if !meta.is_empty() {
            (hooks.mapped)(&meta);
        }
    }

    fn hooks(&self) -> Option<Arc<RuntimeHooks>> {
        self.hooks.read().clone()
    }

    pub(crate) fn images_added(&self, images: &[LoadedImage]) {
        let load = self.load.read().clone();
        for notifier in &load {
            for image in images {
                trace!("load notifier for {}", image);
                notifier(image.load_address(), image.slide());
            }
        }

        if let Some(hooks) = self.hooks() {
            let meta = with_metadata(images);
            if !meta.is_empty() {
                (hooks.mapped)(&meta);
            }
        }

        self.monitors.notify(false, images);
    }

    pub(crate) fn images_removing(&self, images: &[LoadedImage]) {
        let unload = self.unload.read().clone();
        for notifier in &unload {
            for image in images {
                trace!("unload notifier for {}", image);
                notifier(image.load_address(), image.slide());
            }
        }

        if let Some(hooks) = self.hooks() {
            for image in with_metadata(images) {
                (hooks.unmapped)(&image);
            }
        }

        self.monitors.notify(true, images);
    }

    pub(crate) fn image_initializing(&self, image: &LoadedImage) {
        if !image
            .descriptor()
            .flags()
            .contains(ImageFlags::MAY_HAVE_EAGER_INIT_HOOKS)
        {
            return;
        }
        if let Some(hooks) = self.hooks() {
            trace!("init hook for {}", image);
            (hooks.init)(image);
        }
    }
}
