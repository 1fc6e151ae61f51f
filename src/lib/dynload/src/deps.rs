//! Computing the set of images reachable from a starting image.

use std::{collections::HashMap, sync::Arc};

use petgraph::{
    stable_graph::{NodeIndex, StableDiGraph},
    visit::{DfsPostOrder, EdgeFiltered},
};
use tracing::{trace, warn};

use crate::{
    image::{DependencyKind, ImageDescriptor, ImageId, LoadedImage},
    DynloadError, DynloadErrorKind,
};

/// The answer to "what is dependency N of this image".
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The dependency is mapped at this address.
    Loaded(LoadedImage),
    /// The dependency is known, but not currently mapped.
    NotLoaded(Arc<ImageDescriptor>),
    NotFound,
}

/// One image in a closure.
#[derive(Debug, Clone)]
pub struct ClosureMember {
    pub descriptor: Arc<ImageDescriptor>,
    pub loaded: Option<LoadedImage>,
}

impl ClosureMember {
    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }
}

/// The transitive dependency closure of one image. The graph may contain cycles.
#[derive(Debug)]
pub struct Closure {
    graph: StableDiGraph<ClosureMember, DependencyKind>,
    root: NodeIndex,
}

impl Closure {
    pub fn root(&self) -> &ClosureMember {
        &self.graph[self.root]
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ImageId) -> bool {
        self.graph
            .node_weights()
            .any(|member| member.descriptor.id() == id)
    }

    /// Members in the breadth-first order they were discovered in, root first.
    pub fn members(&self) -> Vec<&ClosureMember> {
        self.graph
            .node_indices()
            .map(|idx| &self.graph[idx])
            .collect()
    }

    /// Members that are not currently mapped, in breadth-first order.
    pub fn unloaded(&self) -> Vec<Arc<ImageDescriptor>> {
        self.members()
            .into_iter()
            .filter(|m| !m.is_loaded())
            .map(|m| m.descriptor.clone())
            .collect()
    }

    /// Members with every image's dependencies ahead of it, where the graph allows. This is the
    /// order initializers run in. Upward links do not impose an order.
    pub fn bottom_up(&self) -> Vec<&ClosureMember> {
        let mut ret = vec![];
        let downward =
            EdgeFiltered::from_fn(&self.graph, |e| *e.weight() != DependencyKind::Upward);
        let mut visit = DfsPostOrder::new(&downward, self.root);
        while let Some(node) = visit.next(&downward) {
            ret.push(&self.graph[node]);
        }
        ret
    }
}

/// Compute the closure of `start`. `resolve` is called once per declared dependency of every
/// visited image. The walk fails rather than truncating if the closure grows past the start
/// image's declared maximum load count.
pub fn closure<F>(start: ClosureMember, mut resolve: F) -> Result<Closure, DynloadError>
where
    F: FnMut(&ImageDescriptor, usize) -> Resolution,
{
    let max = start.descriptor.max_load_count();
    let start_path = start.descriptor.path().to_string();
    let mut graph = StableDiGraph::new();
    let mut seen = HashMap::new();

    let root_id = start.descriptor.id();
    let root = graph.add_node(start);
    seen.insert(root_id, root);
    let mut frontier = std::collections::VecDeque::from([root]);
    let mut errors = vec![];

    while let Some(node) = frontier.pop_front() {
        let desc = graph[node].descriptor.clone();
        for (ordinal, dep) in desc.dependencies().iter().enumerate() {
            let member = match resolve(&desc, ordinal) {
                Resolution::Loaded(image) => ClosureMember {
                    descriptor: image.descriptor().clone(),
                    loaded: Some(image),
                },
                Resolution::NotLoaded(descriptor) => ClosureMember {
                    descriptor,
                    loaded: None,
                },
                Resolution::NotFound if dep.kind == DependencyKind::Weak => {
                    trace!("{}: weak dependency {} missing", desc, dep.load_path);
                    continue;
                }
                Resolution::NotFound => {
                    errors.push(DynloadError::new(DynloadErrorKind::DependencyNotFound {
                        path: dep.load_path.clone(),
                        needed_by: desc.path().to_string(),
                    }));
                    continue;
                }
            };

            let child = match seen.get(&member.descriptor.id()) {
                Some(idx) => *idx,
                None => {
                    if graph.node_count() >= max {
                        warn!("closure of {} exceeds {} images", start_path, max);
                        return Err(DynloadErrorKind::ClosureTooLarge {
                            image: start_path,
                            max,
                        }
                        .into());
                    }
                    let id = member.descriptor.id();
                    let idx = graph.add_node(member);
                    seen.insert(id, idx);
                    frontier.push_back(idx);
                    idx
                }
            };
            graph.add_edge(node, child, dep.kind);
        }
    }

    DynloadError::collect(
        DynloadErrorKind::DepEnumerationFail { image: start_path },
        errors.into_iter().map(Err::<(), _>),
    )?;

    Ok(Closure { graph, root })
}

/// Single-hop dependency relation over a set of mapped images: the image in `images` that
/// dependency `ordinal` of `image` is bound to.
pub fn loaded_dependency<'a>(
    images: &'a [LoadedImage],
    image: &ImageDescriptor,
    ordinal: usize,
) -> Option<&'a LoadedImage> {
    let dep = image.dependencies().get(ordinal)?;
    if let Some(id) = dep.resolved {
        if let Some(found) = images.iter().find(|li| li.descriptor().id() == id) {
            return Some(found);
        }
    }
    images.iter().find(|li| li.path() == dep.load_path)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::image::Dependency;

    fn descs() -> HashMap<String, Arc<ImageDescriptor>> {
        let make = |path: &str, deps: &[(&str, DependencyKind)]| {
            let mut d = ImageDescriptor::new(path).with_max_load_count(8);
            for (p, k) in deps {
                d = d.with_dependency(Dependency::new(p, *k));
            }
            (path.to_string(), Arc::new(d))
        };
        [
            make(
                "a",
                &[
                    ("b", DependencyKind::Regular),
                    ("c", DependencyKind::Regular),
                ],
            ),
            make(
                "b",
                &[("c", DependencyKind::Regular), ("a", DependencyKind::Upward)],
            ),
            make("c", &[("gone", DependencyKind::Weak)]),
            make("d", &[("missing", DependencyKind::Regular)]),
        ]
        .into_iter()
        .collect()
    }

    fn resolver<'a>(
        all: &'a HashMap<String, Arc<ImageDescriptor>>,
        loaded: &'a [LoadedImage],
    ) -> impl FnMut(&ImageDescriptor, usize) -> Resolution + 'a {
        move |desc, ordinal| {
            if let Some(li) = loaded_dependency(loaded, desc, ordinal) {
                return Resolution::Loaded(li.clone());
            }
            let path = &desc.dependencies()[ordinal].load_path;
            match all.get(path) {
                Some(d) => Resolution::NotLoaded(d.clone()),
                None => Resolution::NotFound,
            }
        }
    }

    fn start(all: &HashMap<String, Arc<ImageDescriptor>>, path: &str) -> ClosureMember {
        ClosureMember {
            descriptor: all[path].clone(),
            loaded: None,
        }
    }

    #[test]
    fn dedups_and_tolerates_cycles() {
        let all = descs();
        let loaded = vec![LoadedImage::new(all["c"].clone(), 0x3000)];
        let closure = closure(start(&all, "a"), resolver(&all, &loaded)).unwrap();
        assert_eq!(closure.len(), 3);
        let order: Vec<_> = closure
            .members()
            .iter()
            .map(|m| m.descriptor.path().to_string())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        let unloaded: Vec<_> = closure
            .unloaded()
            .iter()
            .map(|d| d.path().to_string())
            .collect();
        assert_eq!(unloaded, vec!["a", "b"]);
        assert!(closure.contains(all["c"].id()));
        assert!(!closure.contains(all["d"].id()));

        let bottom_up: Vec<_> = closure
            .bottom_up()
            .iter()
            .map(|m| m.descriptor.path().to_string())
            .collect();
        assert_eq!(bottom_up.last().unwrap(), "a");
        let c = bottom_up.iter().position(|p| p == "c").unwrap();
        let b = bottom_up.iter().position(|p| p == "b").unwrap();
        assert!(c < b);
    }

    #[test]
    fn missing_regular_dependency_fails() {
        let all = descs();
        let err = closure(start(&all, "d"), resolver(&all, &[])).unwrap_err();
        assert!(matches!(
            err.kind,
            DynloadErrorKind::DepEnumerationFail { .. }
        ));
        assert_eq!(err.related.len(), 1);
    }

    #[test]
    fn bound_is_enforced() {
        let all = descs();
        let small = ClosureMember {
            descriptor: Arc::new((*all["a"]).clone().with_max_load_count(2)),
            loaded: None,
        };
        let err = closure(small, resolver(&all, &[])).unwrap_err();
        assert!(matches!(
            err.kind,
            DynloadErrorKind::ClosureTooLarge { max: 2, .. }
        ));
    }

    #[test]
    fn resolved_ids_take_precedence() {
        let target = Arc::new(ImageDescriptor::new("/real/libx.dylib"));
        let parent = ImageDescriptor::new("p").with_dependency(
            Dependency::new("@rpath/libx.dylib", DependencyKind::Regular).resolved_to(target.id()),
        );
        let loaded = vec![LoadedImage::new(target.clone(), 0x1000)];
        assert_eq!(
            loaded_dependency(&loaded, &parent, 0).unwrap().load_address(),
            0x1000
        );
        assert!(loaded_dependency(&loaded, &parent, 1).is_none());
    }
}
