//! An engine over synthetic descriptors. Nothing is actually mapped: images are assigned
//! addresses from a bump allocator, and code execution is simulated by registered callbacks.
//! Useful for tests, and for hosts that place images in memory themselves.

use std::{
    collections::{HashMap, HashSet},
    ops::Range,
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::trace;

use super::{LoaderEngine, MappedImage, MappedImages};
use crate::{
    image::{GroupKind, ImageDescriptor, ImageGroup, LoadedImage},
    DynloadError, DynloadErrorKind,
};

const PAGE_SIZE: usize = 0x1000;

/// Something the engine was asked to do, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Mapped { path: String, load_address: usize },
    Unmapped { path: String, load_address: usize },
    Initialized { path: String },
    Finalized { range: Range<usize> },
    ResolverCalled { path: String, resolver: usize },
}

type ImageCallback = Arc<dyn Fn(&LoadedImage) + Send + Sync>;
type FinalizeCallback = Arc<dyn Fn(&[Range<usize>]) + Send + Sync>;
type ResolverCallback = Arc<dyn Fn(&LoadedImage, usize) -> usize + Send + Sync>;

#[derive(Default)]
struct State {
    next_address: usize,
    closures: HashMap<String, Vec<ImageDescriptor>>,
    closure_errors: HashMap<String, Vec<String>>,
    map_failures: HashMap<String, String>,
    promote: HashSet<String>,
    initializers: HashMap<String, ImageCallback>,
    finalizer: Option<FinalizeCallback>,
    resolver: Option<ResolverCallback>,
    events: Vec<EngineEvent>,
}

pub struct InMemoryEngine {
    state: Mutex<State>,
}

impl InMemoryEngine {
    /// Create an engine that hands out addresses starting at `base`.
    pub fn new(base: usize) -> Self {
        Self {
            state: Mutex::new(State {
                next_address: base,
                ..Default::default()
            }),
        }
    }

    /// Make `path` loadable: a closure request for it yields `images`, the first of which is the
    /// image itself.
    pub fn add_closure(&self, path: &str, images: impl IntoIterator<Item = ImageDescriptor>) {
        self.state
            .lock()
            .closures
            .insert(path.to_string(), images.into_iter().collect());
    }

    /// Have closure requests for `path` fail with these messages.
    pub fn fail_closure(&self, path: &str, messages: impl IntoIterator<Item = impl ToString>) {
        self.state.lock().closure_errors.insert(
            path.to_string(),
            messages.into_iter().map(|m| m.to_string()).collect(),
        );
    }

    /// Have any map request that includes `path` fail.
    pub fn fail_mapping(&self, path: &str, message: impl ToString) {
        self.state
            .lock()
            .map_failures
            .insert(path.to_string(), message.to_string());
    }

    /// Report `path` as pinned whenever it is mapped.
    pub fn promote_on_map(&self, path: &str) {
        self.state.lock().promote.insert(path.to_string());
    }

    pub fn on_initialize(&self, path: &str, f: impl Fn(&LoadedImage) + Send + Sync + 'static) {
        self.state
            .lock()
            .initializers
            .insert(path.to_string(), Arc::new(f));
    }

    pub fn on_finalize(&self, f: impl Fn(&[Range<usize>]) + Send + Sync + 'static) {
        self.state.lock().finalizer = Some(Arc::new(f));
    }

    pub fn on_resolver(&self, f: impl Fn(&LoadedImage, usize) -> usize + Send + Sync + 'static) {
        self.state.lock().resolver = Some(Arc::new(f));
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Paths of images initialized so far, in order.
    pub fn initialized(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::Initialized { path } => Some(path),
                _ => None,
            })
            .collect()
    }

    /// Paths of images unmapped so far, in order.
    pub fn unmapped(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::Unmapped { path, .. } => Some(path),
                _ => None,
            })
            .collect()
    }
}

fn round_up(size: usize) -> usize {
    size.max(1).div_ceil(PAGE_SIZE) * PAGE_SIZE
}

impl LoaderEngine for InMemoryEngine {
    fn build_closure(&self, path: &str) -> Result<ImageGroup, Vec<String>> {
        let state = self.state.lock();
        if let Some(messages) = state.closure_errors.get(path) {
            return Err(messages.clone());
        }
        match state.closures.get(path) {
            Some(images) => Ok(ImageGroup::new(GroupKind::Dynamic, images.clone())),
            None => Err(vec![format!("tried: '{}' (no such file)", path)]),
        }
    }

    fn map_and_fixup(
        &self,
        to_map: &[Arc<ImageDescriptor>],
        _already_loaded: &[LoadedImage],
        _cache_base: usize,
    ) -> Result<MappedImages, DynloadError> {
        let mut state = self.state.lock();
        if let Some(message) = to_map
            .iter()
            .find_map(|d| state.map_failures.get(d.path()))
        {
            return Err(DynloadErrorKind::MapFail {
                message: message.clone(),
            }
            .into());
        }

        let mut mapped = MappedImages::default();
        for desc in to_map {
            let load_address = state.next_address;
            state.next_address += round_up(desc.vm_size());
            trace!("mapping {} at {:#x}", desc, load_address);
            state.events.push(EngineEvent::Mapped {
                path: desc.path().to_string(),
                load_address,
            });
            if state.promote.contains(desc.path()) {
                mapped.promoted.push(load_address);
            }
            mapped.images.push(MappedImage {
                descriptor: desc.clone(),
                load_address,
            });
        }
        Ok(mapped)
    }

    fn unmap(&self, image: &LoadedImage) {
        self.state.lock().events.push(EngineEvent::Unmapped {
            path: image.path().to_string(),
            load_address: image.load_address(),
        });
    }

    fn run_initializers(&self, image: &LoadedImage) {
        let init = {
            let mut state = self.state.lock();
            state.events.push(EngineEvent::Initialized {
                path: image.path().to_string(),
            });
            state.initializers.get(image.path()).cloned()
        };
        if let Some(init) = init {
            init(image);
        }
    }

    fn call_resolver(&self, image: &LoadedImage, resolver: usize) -> usize {
        let f = {
            let mut state = self.state.lock();
            state.events.push(EngineEvent::ResolverCalled {
                path: image.path().to_string(),
                resolver,
            });
            state.resolver.clone()
        };
        match f {
            Some(f) => f(image, resolver),
            None => resolver,
        }
    }

    fn finalize_ranges(&self, ranges: &[Range<usize>]) {
        let fini = {
            let mut state = self.state.lock();
            state.events.extend(
                ranges
                    .iter()
                    .map(|range| EngineEvent::Finalized { range: range.clone() }),
            );
            state.finalizer.clone()
        };
        if let Some(fini) = fini {
            fini(ranges);
        }
    }

    fn can_load(&self, path: &str) -> bool {
        let state = self.state.lock();
        state.closures.contains_key(path) && !state.closure_errors.contains_key(path)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::image::{Protections, Segment};

    #[test]
    fn mapping_hands_out_disjoint_addresses() {
        let engine = InMemoryEngine::new(0x10_0000);
        let a = Arc::new(
            ImageDescriptor::new("/lib/a")
                .with_segment(Segment::new(0, 0x1800, Protections::READ)),
        );
        let b = Arc::new(ImageDescriptor::new("/lib/b"));
        engine.promote_on_map("/lib/b");
        let mapped = engine.map_and_fixup(&[a, b], &[], 0).unwrap();
        assert_eq!(mapped.images[0].load_address, 0x10_0000);
        assert_eq!(mapped.images[1].load_address, 0x10_2000);
        assert_eq!(mapped.promoted, vec![0x10_2000]);
    }

    #[test]
    fn failures() {
        let engine = InMemoryEngine::new(0x1000);
        engine.fail_mapping("/lib/bad", "segment overlaps");
        let err = engine
            .map_and_fixup(&[Arc::new(ImageDescriptor::new("/lib/bad"))], &[], 0)
            .unwrap_err();
        assert!(matches!(err.kind, DynloadErrorKind::MapFail { .. }));
        assert!(engine.events().is_empty());

        assert_eq!(engine.build_closure("/lib/none").unwrap_err().len(), 1);
        engine.add_closure("/lib/x", [ImageDescriptor::new("/lib/x")]);
        engine.fail_closure("/lib/x", ["code signature invalid"]);
        assert!(!engine.can_load("/lib/x"));
        assert_eq!(
            engine.build_closure("/lib/x").unwrap_err(),
            vec!["code signature invalid".to_string()]
        );
    }

    #[test]
    fn callbacks_run_outside_the_engine_lock() {
        let engine = Arc::new(InMemoryEngine::new(0x1000));
        let e = engine.clone();
        engine.on_initialize("/lib/a", move |img| {
            // Re-entering the engine must not deadlock.
            e.unmap(img);
        });
        let img = LoadedImage::new(Arc::new(ImageDescriptor::new("/lib/a")), 0x1000);
        engine.run_initializers(&img);
        assert_eq!(engine.initialized(), vec!["/lib/a".to_string()]);
        assert_eq!(engine.unmapped(), vec!["/lib/a".to_string()]);
        assert_eq!(engine.call_resolver(&img, 0x1040), 0x1040);
        engine.on_resolver(|_, r| r + 8);
        assert_eq!(engine.call_resolver(&img, 0x1040), 0x1048);
    }
}
