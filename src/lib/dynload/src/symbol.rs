//! Resolving exported symbols to addresses across loaded images.

use tracing::{trace, warn};

use crate::{
    deps::{self, ClosureMember, Resolution},
    engines::LoaderEngine,
    image::{DependencyKind, LoadedImage},
    registry::ImageRegistry,
    trie::{self, ExportRecord},
    DynloadError, DynloadErrorKind,
};

/// Which images a lookup considers, and in what order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    /// Only the image loaded at this address.
    Image(usize),
    /// The image at `start` and its transitive dependencies, breadth-first.
    Dependents { start: usize, include_start: bool },
    /// The image at `start`, then every image loaded after it.
    LoadedAfter { start: usize, include_start: bool },
    /// Every image, in load order.
    LoadOrder,
}

/// Whether a lookup may run code in the target image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Produce the final address, calling lazy resolver functions if needed.
    Resolve,
    /// Only establish that the symbol exists. Never calls into image code; lazy resolvers
    /// report the address of their stub instead.
    Exists,
}

/// A symbol, and the image that defines it.
#[derive(Debug, Clone)]
pub struct ResolvedSymbol {
    pub image: LoadedImage,
    /// The name the defining image exports it under, which differs from the requested name if
    /// a renaming re-export was followed.
    pub name: String,
    pub record: ExportRecord,
    pub address: usize,
}

impl ResolvedSymbol {
    pub fn is_thread_local(&self) -> bool {
        matches!(self.record, ExportRecord::ThreadLocal { .. })
    }
}

/// Symbol lookup over a snapshot of the registry.
pub struct SymbolResolver<'a, E: ?Sized> {
    registry: &'a ImageRegistry,
    engine: &'a E,
}

impl<'a, E: LoaderEngine + ?Sized> SymbolResolver<'a, E> {
    pub fn new(registry: &'a ImageRegistry, engine: &'a E) -> Self {
        Self { registry, engine }
    }

    /// Find `name` (already mangled) within `scope`. Returns Ok(None) if no image in scope
    /// exports it.
    pub fn resolve(
        &self,
        name: &str,
        scope: SearchScope,
        mode: ResolveMode,
    ) -> Result<Option<ResolvedSymbol>, DynloadError> {
        let images: Vec<LoadedImage> = self.registry.iter().collect();
        let order = search_order(&images, scope)?;
        trace!("searching {} images for {}", order.len(), name);
        for image in order {
            let mut chain = vec![];
            if let Some(sym) = self.find_in(&images, &image, name, mode, &mut chain, false)? {
                return Ok(Some(sym));
            }
        }
        Ok(None)
    }

    fn find_in(
        &self,
        images: &[LoadedImage],
        image: &LoadedImage,
        name: &str,
        mode: ResolveMode,
        chain: &mut Vec<(usize, String)>,
        via_record: bool,
    ) -> Result<Option<ResolvedSymbol>, DynloadError> {
        let key = (image.load_address(), name.to_string());
        if chain.contains(&key) {
            if via_record {
                return Err(DynloadErrorKind::ReExportCycle {
                    symbol: name.to_string(),
                }
                .into());
            }
            return Ok(None);
        }
        chain.push(key);
        let ret = self.find_in_image(images, image, name, mode, chain);
        chain.pop();
        ret
    }

    fn find_in_image(
        &self,
        images: &[LoadedImage],
        image: &LoadedImage,
        name: &str,
        mode: ResolveMode,
        chain: &mut Vec<(usize, String)>,
    ) -> Result<Option<ResolvedSymbol>, DynloadError> {
        let desc = image.descriptor();
        let base = image.load_address();
        let Some(record) = trie::find_export(desc.exports(), name)? else {
            // Names an image does not export itself may come from a re-exported dylib.
            for (ordinal, dep) in desc.dependencies().iter().enumerate() {
                if dep.kind != DependencyKind::ReExport {
                    continue;
                }
                let Some(target) = reexport_target(images, image, ordinal) else {
                    continue;
                };
                if let Some(sym) = self.find_in(images, target, name, mode, chain, false)? {
                    return Ok(Some(sym));
                }
            }
            return Ok(None);
        };

        let address = match &record {
            ExportRecord::ReExport {
                ordinal,
                imported_name,
            } => {
                let ordinal = *ordinal;
                if ordinal == 0 || ordinal > desc.dependencies().len() as u64 {
                    return Err(DynloadErrorKind::OrdinalOutOfRange {
                        ordinal,
                        symbol: name.to_string(),
                        image: desc.path().to_string(),
                    }
                    .into());
                }
                let Some(target) = reexport_target(images, image, ordinal as usize - 1) else {
                    warn!(
                        "{}: dylib {} for re-exported {} is not loaded",
                        image, ordinal, name
                    );
                    return Ok(None);
                };
                let target_name = imported_name.as_deref().unwrap_or(name);
                trace!("{} re-exported from {} as {}", name, target, target_name);
                return self.find_in(images, target, target_name, mode, chain, true);
            }
            ExportRecord::Regular { offset } | ExportRecord::ThreadLocal { offset } => {
                base.wrapping_add(*offset as usize)
            }
            ExportRecord::Absolute { address } => *address as usize,
            ExportRecord::Resolver {
                offset,
                resolver_offset,
            } => match mode {
                ResolveMode::Resolve => self
                    .engine
                    .call_resolver(image, base.wrapping_add(*resolver_offset as usize)),
                ResolveMode::Exists => base.wrapping_add(*offset as usize),
            },
        };

        Ok(Some(ResolvedSymbol {
            image: image.clone(),
            name: name.to_string(),
            record,
            address,
        }))
    }
}

/// The image that dependency `index` of `image` refers to. Relative (`@rpath/`) load paths only
/// mean something to the image that declared them, so they go through that image's own resolved
/// binding. Other paths are looked up among the loaded images.
pub fn reexport_target<'b>(
    images: &'b [LoadedImage],
    image: &LoadedImage,
    index: usize,
) -> Option<&'b LoadedImage> {
    let dep = image.descriptor().dependencies().get(index)?;
    if dep.is_relative() {
        let id = dep.resolved?;
        images.iter().find(|li| li.descriptor().id() == id)
    } else {
        images.iter().find(|li| li.path() == dep.load_path)
    }
}

fn search_order(
    images: &[LoadedImage],
    scope: SearchScope,
) -> Result<Vec<LoadedImage>, DynloadError> {
    let position = |addr: usize| {
        images
            .iter()
            .position(|li| li.load_address() == addr)
            .ok_or(DynloadError::new(DynloadErrorKind::InvalidHandle))
    };

    Ok(match scope {
        SearchScope::Image(addr) => vec![images[position(addr)?].clone()],
        SearchScope::LoadOrder => images.to_vec(),
        SearchScope::LoadedAfter {
            start,
            include_start,
        } => {
            let pos = position(start)?;
            let skip = if include_start { pos } else { pos + 1 };
            images[skip..].to_vec()
        }
        SearchScope::Dependents {
            start,
            include_start,
        } => {
            let start_image = images[position(start)?].clone();
            let closure = deps::closure(
                ClosureMember {
                    descriptor: start_image.descriptor().clone(),
                    loaded: Some(start_image.clone()),
                },
                |desc, ordinal| match deps::loaded_dependency(images, desc, ordinal) {
                    Some(li) => Resolution::Loaded(li.clone()),
                    None => Resolution::NotFound,
                },
            )?;
            closure
                .members()
                .into_iter()
                .filter_map(|m| m.loaded.clone())
                .filter(|li| include_start || *li != start_image)
                .collect()
        }
    })
}
