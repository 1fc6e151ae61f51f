//! The table of currently loaded images.

use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::debug;

use crate::image::{ImageId, InitState, LoadedImage, Protections};

mod notify;
pub use notify::*;

/// Every mapped image, in the order the images became visible. All mutation happens under the
/// write lock, and notification sinks run after it is released.
pub struct ImageRegistry {
    images: RwLock<Vec<LoadedImage>>,
    notifiers: Notifiers,
}

impl ImageRegistry {
    pub fn new(notifiers: Notifiers) -> Self {
        Self {
            images: RwLock::new(vec![]),
            notifiers,
        }
    }

    pub fn notifiers(&self) -> &Notifiers {
        &self.notifiers
    }

    /// Append newly mapped images. Registering no images, or an image at an address that is
    /// already occupied, means the caller's model of the address space is broken, and panics.
    pub fn add_images(&self, images: Vec<LoadedImage>) {
        assert!(!images.is_empty(), "add_images called with no images");
        {
            let mut loaded = self.images.write();
            for image in &images {
                if let Some(existing) = loaded
                    .iter()
                    .chain(images.iter().take_while(|i| !std::ptr::eq(*i, image)))
                    .find(|li| li.load_address() == image.load_address())
                {
                    panic!(
                        "{} registered at {:#x}, which is occupied by {}",
                        image.path(),
                        image.load_address(),
                        existing
                    );
                }
                debug!("loaded {}", image);
            }
            loaded.extend(images.iter().cloned());
        }
        self.notifiers.images_added(&images);
    }

    /// Remove images, which must all be registered. Unload sinks run before the images become
    /// unfindable.
    pub fn remove_images(&self, images: &[LoadedImage]) {
        if images.is_empty() {
            return;
        }
        self.notifiers.images_removing(images);
        let mut loaded = self.images.write();
        loaded.retain(|li| {
            let remove = images.contains(li);
            if remove {
                debug!("unloaded {}", li);
            }
            !remove
        });
    }

    pub fn count(&self) -> usize {
        self.images.read().len()
    }

    /// A snapshot of the registry in load order.
    pub fn iter(&self) -> std::vec::IntoIter<LoadedImage> {
        self.images.read().clone().into_iter()
    }

    pub fn find_by_load_order(&self, index: usize) -> Option<LoadedImage> {
        self.images.read().get(index).cloned()
    }

    pub fn find_by_load_address(&self, load_address: usize) -> Option<LoadedImage> {
        self.images
            .read()
            .iter()
            .find(|li| li.load_address() == load_address)
            .cloned()
    }

    /// The image with a segment containing `addr`, and that segment's protections.
    pub fn find_by_owned_address(&self, addr: usize) -> Option<(LoadedImage, Protections)> {
        self.images.read().iter().find_map(|li| {
            li.segment_containing(addr)
                .map(|(_, prot)| (li.clone(), prot))
        })
    }

    pub fn find_by_path(&self, path: &str) -> Option<LoadedImage> {
        self.images
            .read()
            .iter()
            .find(|li| li.path() == path)
            .cloned()
    }

    pub fn find_by_id(&self, id: ImageId) -> Option<LoadedImage> {
        self.images
            .read()
            .iter()
            .find(|li| li.descriptor().id() == id)
            .cloned()
    }

    /// The first image registered.
    pub fn main_executable(&self) -> Option<LoadedImage> {
        self.find_by_load_order(0)
    }

    /// Exempt an image from collection for the rest of the process. Returns false if no image is
    /// registered at that address.
    pub fn mark_never_unload(&self, load_address: usize) -> bool {
        let mut images = self.images.write();
        match images
            .iter_mut()
            .find(|li| li.load_address() == load_address)
        {
            Some(li) => {
                if !li.is_never_unload() {
                    debug!("{} promoted to never-unload", li);
                    li.set_never_unload();
                }
                true
            }
            None => false,
        }
    }

    pub fn state(&self, load_address: usize) -> Option<InitState> {
        self.find_by_load_address(load_address).map(|li| li.state())
    }

    /// Move an image's init state forward. Returns None if the image is not registered, and
    /// Some(false) if the state would not advance.
    pub(crate) fn advance_state(&self, load_address: usize, state: InitState) -> Option<bool> {
        let mut images = self.images.write();
        images
            .iter_mut()
            .find(|li| li.load_address() == load_address)
            .map(|li| li.advance(state))
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Vec<LoadedImage>> {
        self.images.write()
    }
}
