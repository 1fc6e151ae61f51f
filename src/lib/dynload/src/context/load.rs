use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::{Context, Handle, OpenFlags};
use crate::{
    deps::{self, ClosureMember, Resolution},
    engines::{LoaderEngine, MappedImages},
    image::{ImageDescriptor, LoadedImage},
    DynloadError, DynloadErrorKind,
};

/// Most closure failure reasons reported from one open.
const MAX_CLOSURE_MESSAGES: usize = 3;

impl<E: LoaderEngine> Context<E> {
    /// Open the image at `path`, loading it and its dependencies if needed. A `None` path opens
    /// the whole process: [Handle::Default], or [Handle::MainOnly] with [OpenFlags::FIRST].
    pub fn dlopen(&self, path: Option<&str>, flags: OpenFlags) -> Result<Handle, DynloadError> {
        let first_only = flags.contains(OpenFlags::FIRST);
        let Some(path) = path else {
            return Ok(if first_only {
                Handle::MainOnly
            } else {
                Handle::Default
            });
        };
        debug!("dlopen({}, {:#06x})", path, flags.bits());

        let _guard = self.api_lock.lock();
        let handle = |image: LoadedImage| {
            debug!("dlopen({}) => {}", path, image);
            Handle::Image {
                load_address: image.load_address(),
                first_only,
            }
        };
        let variants = self.config.path_variants(path);

        if let Some(image) = variants
            .iter()
            .find_map(|p| self.registry.find_by_path(p))
        {
            self.add_reference(&image);
            return Ok(handle(image));
        }

        let mut known = variants.iter().find_map(|p| self.groups.find_by_path(p));
        if let Some(desc) = &known {
            if let Some(image) = self.registry.find_by_id(desc.id()) {
                trace!("{} already loaded as {}", path, image);
                self.add_reference(&image);
                return Ok(handle(image));
            }
        }

        if flags.contains(OpenFlags::NOLOAD) {
            return Err(DynloadErrorKind::NotLoaded {
                path: path.to_string(),
            }
            .into());
        }

        if let Some(desc) = known.take() {
            match self.load_image_and_dependents(desc, true) {
                Ok(image) => return Ok(handle(image)),
                Err(e) => debug!("known closure for {} is unusable: {}", path, e),
            }
        }

        let mut top = None;
        let mut messages = vec![];
        for variant in &variants {
            match self.engine.build_closure(variant) {
                Ok(group) => {
                    top = self.groups.append(group).top().cloned();
                    messages.clear();
                    break;
                }
                Err(tried) => messages.extend(tried),
            }
        }
        messages.truncate(MAX_CLOSURE_MESSAGES);
        let mut related = vec![];
        if let Some(top) = top {
            match self.load_image_and_dependents(top, true) {
                Ok(image) => return Ok(handle(image)),
                Err(e) => {
                    if messages.len() < MAX_CLOSURE_MESSAGES {
                        messages.push(e.to_string());
                    }
                    related.push(e);
                }
            }
        }

        let err = DynloadError::new_collect(
            DynloadErrorKind::ClosureBuildFail {
                path: path.to_string(),
                mode: flags.bits(),
                messages,
            },
            related,
        );
        debug!("{}", err);
        Err(err)
    }

    /// Count a direct open of `image`. Never-unload images are not counted.
    fn add_reference(&self, image: &LoadedImage) {
        if !image.is_never_unload() {
            self.refs.open(image.load_address());
        }
    }

    fn resolve_dependency(
        &self,
        loaded: &[LoadedImage],
        desc: &ImageDescriptor,
        ordinal: usize,
    ) -> Resolution {
        if let Some(image) = deps::loaded_dependency(loaded, desc, ordinal) {
            return Resolution::Loaded(image.clone());
        }
        let Some(dep) = desc.dependencies().get(ordinal) else {
            return Resolution::NotFound;
        };
        dep.resolved
            .and_then(|id| self.groups.find_by_id(id))
            .or_else(|| self.groups.find_by_path(&dep.load_path))
            .map_or(Resolution::NotFound, Resolution::NotLoaded)
    }

    /// Map `top` and whatever part of its closure is not yet loaded, register the new images,
    /// and initialize them. With `open`, the top image gains a reference. If mapping fails, the
    /// registry is left untouched.
    pub(crate) fn load_image_and_dependents(
        &self,
        top: Arc<ImageDescriptor>,
        open: bool,
    ) -> Result<LoadedImage, DynloadError> {
        let loaded: Vec<LoadedImage> = self.registry.iter().collect();
        let start = ClosureMember {
            loaded: loaded
                .iter()
                .find(|li| li.descriptor().id() == top.id())
                .cloned(),
            descriptor: top.clone(),
        };
        let closure = deps::closure(start, |desc, ordinal| {
            self.resolve_dependency(&loaded, desc, ordinal)
        })?;

        let to_map = closure.unloaded();
        let top_image = match closure.root().loaded.clone() {
            Some(image) => {
                if open {
                    self.add_reference(&image);
                }
                image
            }
            None => {
                trace!("{}: mapping {} images", top, to_map.len());
                let MappedImages { images, promoted } =
                    self.engine
                        .map_and_fixup(&to_map, &loaded, self.config.cache_base)?;
                let new_images: Vec<LoadedImage> = images
                    .into_iter()
                    .map(|m| {
                        let mut image = LoadedImage::new(m.descriptor, m.load_address);
                        if promoted.contains(&m.load_address) {
                            image.set_never_unload();
                        }
                        image
                    })
                    .collect();

                let Some(top_image) = new_images
                    .iter()
                    .find(|li| li.descriptor().id() == top.id())
                    .cloned()
                else {
                    warn!("mapper did not map {}", top);
                    for image in &new_images {
                        self.engine.unmap(image);
                    }
                    return Err(DynloadErrorKind::MapFail {
                        message: format!("{} was not mapped", top),
                    }
                    .into());
                };

                if open {
                    self.add_reference(&top_image);
                }
                self.registry.add_images(new_images);
                for addr in promoted {
                    if loaded.iter().any(|li| li.load_address() == addr) {
                        self.registry.mark_never_unload(addr);
                    }
                }
                top_image
            }
        };

        self.run_initializers_bottom_up(&top_image)?;
        Ok(top_image)
    }
}
