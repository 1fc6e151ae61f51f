//! Management of the loader's process-wide state.

use parking_lot::ReentrantMutex;
use tracing::debug;

use crate::{
    config::LoaderConfig,
    engines::LoaderEngine,
    gc::{CollectionStats, GarbageCollector},
    image::{KnownGroups, LoadedImage},
    monitor::MonitorSet,
    refcount::ReferenceCounter,
    registry::{ImageRegistry, Notifiers},
    DynloadError, DynloadErrorKind,
};

mod init;
mod load;
mod query;
mod syms;
mod unload;

pub use syms::SymbolInfo;

bitflags::bitflags! {
    /// Options for [Context::dlopen].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        const LAZY = 0x1;
        const NOW = 0x2;
        const LOCAL = 0x4;
        const GLOBAL = 0x8;
        /// Only succeed if the image is already loaded.
        const NOLOAD = 0x10;
        const NODELETE = 0x80;
        /// Symbol lookups through the returned handle search only the opened image.
        const FIRST = 0x100;
    }
}

const RAW_NEXT: usize = usize::MAX;
const RAW_DEFAULT: usize = usize::MAX - 1;
const RAW_SELF: usize = usize::MAX - 2;
const RAW_MAIN_ONLY: usize = usize::MAX - 4;

/// What a symbol lookup or close refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handle {
    /// An image returned by [Context::dlopen].
    Image {
        load_address: usize,
        first_only: bool,
    },
    /// Every image, in load order.
    Default,
    /// The main executable only.
    MainOnly,
    /// What the image containing `caller` would see, excluding itself.
    Next { caller: usize },
    /// The image containing `caller`, then what it would see.
    SelfImage { caller: usize },
}

impl Handle {
    /// Encode as an opaque pointer-sized token. Image tokens rely on load addresses being 64-byte
    /// aligned, since `first_only` lands in bit 0 of the shifted address.
    pub fn to_raw(&self) -> usize {
        match *self {
            Handle::Image {
                load_address,
                first_only,
            } => {
                debug_assert!(load_address & 0x3f == 0, "unaligned image {:#x}", load_address);
                (load_address >> 5) | first_only as usize
            }
            Handle::Default => RAW_DEFAULT,
            Handle::MainOnly => RAW_MAIN_ONLY,
            Handle::Next { .. } => RAW_NEXT,
            Handle::SelfImage { .. } => RAW_SELF,
        }
    }

    /// Decode a token made by [Handle::to_raw]. `caller` is an address inside the calling image,
    /// used by the caller-relative handles.
    pub fn from_raw(raw: usize, caller: usize) -> Self {
        match raw {
            RAW_DEFAULT => Handle::Default,
            RAW_MAIN_ONLY => Handle::MainOnly,
            RAW_NEXT => Handle::Next { caller },
            RAW_SELF => Handle::SelfImage { caller },
            _ => Handle::Image {
                load_address: (raw & !1) << 5,
                first_only: raw & 1 != 0,
            },
        }
    }
}

/// A loader instance. Owns the registry of loaded images and everything needed to change it.
/// Opening and closing is serialized by a single lock, which may be re-acquired by the same
/// thread (finalizers and initializers may call back into the loader).
pub struct Context<E> {
    engine: E,
    config: LoaderConfig,
    registry: ImageRegistry,
    refs: ReferenceCounter,
    gc: GarbageCollector,
    groups: KnownGroups,
    api_lock: ReentrantMutex<()>,
    init_lock: ReentrantMutex<()>,
}

impl<E: LoaderEngine> Context<E> {
    pub fn new(engine: E, config: LoaderConfig, groups: KnownGroups) -> Self {
        let monitors = MonitorSet::new(config.monitor_timeout, config.monitor_max_message);
        Self {
            engine,
            registry: ImageRegistry::new(Notifiers::new(monitors)),
            config,
            refs: ReferenceCounter::new(),
            gc: GarbageCollector::new(),
            groups,
            api_lock: ReentrantMutex::new(()),
            init_lock: ReentrantMutex::new(()),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn registry(&self) -> &ImageRegistry {
        &self.registry
    }

    pub fn refs(&self) -> &ReferenceCounter {
        &self.refs
    }

    pub fn groups(&self) -> &KnownGroups {
        &self.groups
    }

    /// Load the main executable and its dependencies. Everything loaded at launch stays loaded
    /// for the life of the context.
    pub fn launch(&self, main: &str) -> Result<LoadedImage, DynloadError> {
        let _guard = self.api_lock.lock();
        debug!("launching {}", main);
        let desc = match self.groups.find_by_path(main) {
            Some(desc) => desc,
            None => {
                let group = self.engine.build_closure(main).map_err(|messages| {
                    DynloadError::new(DynloadErrorKind::ClosureBuildFail {
                        path: main.to_string(),
                        mode: 0,
                        messages: messages.into_iter().take(3).collect(),
                    })
                })?;
                let group = self.groups.append(group);
                group.top().cloned().ok_or_else(|| {
                    DynloadError::new(DynloadErrorKind::NotLoaded {
                        path: main.to_string(),
                    })
                })?
            }
        };

        let main_image = self.load_image_and_dependents(desc, false)?;
        for image in self.registry.iter() {
            self.registry.mark_never_unload(image.load_address());
        }
        Ok(main_image)
    }

    /// Run a collection pass now. Normally this happens when the last open reference to an
    /// image is closed.
    pub fn collect(&self) -> CollectionStats {
        let _guard = self.api_lock.lock();
        self.gc.collect(&self.registry, &self.refs, &self.engine)
    }
}
