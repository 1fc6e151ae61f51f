//! Mark-and-sweep collection of images that are no longer reachable from any direct open.

use std::{
    collections::HashMap,
    ops::Range,
    sync::atomic::{AtomicUsize, Ordering},
};

use petgraph::{algo::toposort, graph::DiGraph};
use tracing::{debug, trace};

use crate::{
    deps::loaded_dependency, engines::LoaderEngine, image::LoadedImage, refcount::ReferenceCounter,
    registry::ImageRegistry,
};

/// What a call to [GarbageCollector::collect] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollectionStats {
    /// Number of mark-and-sweep passes run. Zero if a collection was already running, in which
    /// case that collection runs one more pass on this call's behalf.
    pub passes: usize,
    /// Images considered for removal, summed over passes.
    pub candidates: usize,
    pub unloaded: usize,
}

/// Drives collection passes. Requests arriving while a pass is running (for example, a close
/// issued by a finalizer) are counted rather than run recursively.
#[derive(Default)]
pub struct GarbageCollector {
    pending: AtomicUsize,
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }

    /// Remove every image not reachable from an open reference.
    pub fn collect<E: LoaderEngine + ?Sized>(
        &self,
        registry: &ImageRegistry,
        refs: &ReferenceCounter,
        engine: &E,
    ) -> CollectionStats {
        let mut stats = CollectionStats::default();
        if self.pending.fetch_add(1, Ordering::AcqRel) != 0 {
            debug!("collection requested during collection, deferring");
            return stats;
        }

        loop {
            stats.passes += 1;
            let (candidates, dead) = mark(registry, refs);
            stats.candidates += candidates;
            stats.unloaded += dead.len();
            sweep(registry, refs, engine, dead);

            if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
            trace!("collection requested during pass, running again");
        }
        stats
    }
}

/// Find dead images, holding the registry write lock for the duration. Returns the number of
/// candidates and the dead images, dependents ahead of their dependencies.
fn mark(registry: &ImageRegistry, refs: &ReferenceCounter) -> (usize, Vec<LoadedImage>) {
    let images = registry.write();
    let candidates: Vec<&LoadedImage> = images.iter().filter(|li| !li.is_never_unload()).collect();
    let index: HashMap<usize, usize> = candidates
        .iter()
        .enumerate()
        .map(|(i, li)| (li.load_address(), i))
        .collect();

    let mut in_use: Vec<bool> = candidates
        .iter()
        .map(|li| refs.is_open(li.load_address()))
        .collect();

    loop {
        let mut changed = false;
        for (i, image) in candidates.iter().enumerate() {
            if !in_use[i] {
                continue;
            }
            let desc = image.descriptor();
            for ordinal in 0..desc.dependencies().len() {
                let Some(dep) = loaded_dependency(&images, desc, ordinal) else {
                    continue;
                };
                if dep.is_never_unload() {
                    continue;
                }
                if let Some(&j) = index.get(&dep.load_address()) {
                    if !in_use[j] {
                        in_use[j] = true;
                        changed = true;
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }

    let dead: Vec<LoadedImage> = candidates
        .iter()
        .zip(in_use.iter())
        .filter(|(_, used)| !**used)
        .map(|(li, _)| (*li).clone())
        .collect();
    let count = candidates.len();
    drop(candidates);
    drop(images);

    (count, teardown_order(dead))
}

/// Order dead images so that no image is torn down before something that depends on it. Falls
/// back to reverse load order if the dead set has a dependency cycle.
fn teardown_order(dead: Vec<LoadedImage>) -> Vec<LoadedImage> {
    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: Vec<_> = (0..dead.len()).map(|i| graph.add_node(i)).collect();
    for (i, image) in dead.iter().enumerate() {
        let desc = image.descriptor();
        for ordinal in 0..desc.dependencies().len() {
            if let Some(dep) = loaded_dependency(&dead, desc, ordinal) {
                if let Some(j) = dead.iter().position(|d| d == dep) {
                    if i != j {
                        graph.add_edge(nodes[i], nodes[j], ());
                    }
                }
            }
        }
    }

    match toposort(&graph, None) {
        Ok(order) => {
            let mut slots: Vec<Option<LoadedImage>> = dead.into_iter().map(Some).collect();
            order
                .into_iter()
                .filter_map(|n| slots[graph[n]].take())
                .collect()
        }
        Err(_) => {
            trace!("cycle among dead images, using reverse load order");
            dead.into_iter().rev().collect()
        }
    }
}

fn sweep<E: LoaderEngine + ?Sized>(
    registry: &ImageRegistry,
    refs: &ReferenceCounter,
    engine: &E,
    dead: Vec<LoadedImage>,
) {
    if dead.is_empty() {
        return;
    }
    for image in &dead {
        assert!(
            !refs.is_open(image.load_address()),
            "collector chose {} for removal while it is open",
            image
        );
        debug!("collecting {}", image);
    }

    let ranges: Vec<Range<usize>> = dead.iter().flat_map(|li| li.executable_ranges()).collect();
    if !ranges.is_empty() {
        engine.finalize_ranges(&ranges);
    }

    registry.remove_images(&dead);
    for image in &dead {
        engine.unmap(image);
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        engines::memory::InMemoryEngine,
        image::{Dependency, DependencyKind, ImageDescriptor},
        monitor::MonitorSet,
        registry::Notifiers,
    };

    fn setup(graph: &[(&str, &[&str])]) -> (ImageRegistry, Vec<LoadedImage>) {
        let registry = ImageRegistry::new(Notifiers::new(MonitorSet::new(
            Duration::from_millis(10),
            4096,
        )));
        let images: Vec<_> = graph
            .iter()
            .enumerate()
            .map(|(i, (path, deps))| {
                let mut d = ImageDescriptor::new(path);
                for dep in deps.iter() {
                    d = d.with_dependency(Dependency::new(dep, DependencyKind::Regular));
                }
                LoadedImage::new(Arc::new(d), 0x10000 * (i + 1))
            })
            .collect();
        registry.add_images(images.clone());
        (registry, images)
    }

    fn remaining(registry: &ImageRegistry) -> Vec<String> {
        registry.iter().map(|li| li.path().to_string()).collect()
    }

    #[test]
    fn unreachable_images_are_removed() {
        let (registry, images) = setup(&[("a", &["b"]), ("b", &["c"]), ("c", &[]), ("d", &[])]);
        let refs = ReferenceCounter::new();
        let engine = InMemoryEngine::new(0);
        refs.open(images[0].load_address());
        refs.open(images[3].load_address());

        let stats = GarbageCollector::new().collect(&registry, &refs, &engine);
        assert_eq!(stats.unloaded, 0);
        assert_eq!(remaining(&registry).len(), 4);

        refs.close(images[0].load_address());
        let stats = GarbageCollector::new().collect(&registry, &refs, &engine);
        assert_eq!(stats.passes, 1);
        assert_eq!(stats.candidates, 4);
        assert_eq!(stats.unloaded, 3);
        assert_eq!(remaining(&registry), vec!["d"]);
        assert_eq!(engine.unmapped(), vec!["a", "b", "c"]);
    }

    #[test]
    fn shared_dependency_survives() {
        let (registry, images) = setup(&[("a", &["b"]), ("b", &["c"]), ("c", &[]), ("d", &["c"])]);
        let refs = ReferenceCounter::new();
        refs.open(images[3].load_address());
        GarbageCollector::new().collect(&registry, &refs, &InMemoryEngine::new(0));
        assert_eq!(remaining(&registry), vec!["c", "d"]);
    }

    #[test]
    fn never_unload_is_exempt() {
        let (registry, images) = setup(&[("a", &["b"]), ("b", &[])]);
        registry.mark_never_unload(images[1].load_address());
        let refs = ReferenceCounter::new();
        GarbageCollector::new().collect(&registry, &refs, &InMemoryEngine::new(0));
        assert_eq!(remaining(&registry), vec!["b"]);
    }

    #[test]
    fn cycles_are_collected() {
        let (registry, _) = setup(&[("a", &["b"]), ("b", &["a"])]);
        let stats = GarbageCollector::new().collect(
            &registry,
            &ReferenceCounter::new(),
            &InMemoryEngine::new(0),
        );
        assert_eq!(stats.unloaded, 2);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn nested_requests_are_deferred() {
        let gc = GarbageCollector::new();
        gc.pending.store(1, Ordering::Release);
        let (registry, _) = setup(&[("a", &[])]);
        let stats = gc.collect(&registry, &ReferenceCounter::new(), &InMemoryEngine::new(0));
        assert_eq!(stats.passes, 0);
        assert_eq!(registry.count(), 1);
        assert!(gc.in_progress());
    }
}
