use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{ImageDescriptor, ImageId};

/// Where a group of descriptors came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// Images in the precomputed system image set.
    CachedImages,
    /// Other images covered by the precomputed system image set.
    OtherImages,
    /// The program's own launch closure.
    MainClosure,
    /// A closure built at runtime for a path nobody had seen before.
    Dynamic,
}

/// A set of descriptors produced by one closure. The first image is the one the closure was built
/// for.
#[derive(Debug, Clone)]
pub struct ImageGroup {
    kind: GroupKind,
    images: Vec<Arc<ImageDescriptor>>,
}

impl ImageGroup {
    pub fn new(kind: GroupKind, images: impl IntoIterator<Item = ImageDescriptor>) -> Self {
        Self {
            kind,
            images: images.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    pub fn images(&self) -> &[Arc<ImageDescriptor>] {
        &self.images
    }

    pub fn top(&self) -> Option<&Arc<ImageDescriptor>> {
        self.images.first()
    }

    pub fn find_by_path(&self, path: &str) -> Option<&Arc<ImageDescriptor>> {
        self.images.iter().find(|d| d.path() == path)
    }

    pub fn find_by_id(&self, id: ImageId) -> Option<&Arc<ImageDescriptor>> {
        self.images.iter().find(|d| d.id() == id)
    }
}

/// All groups visible to path lookup. Append-only for the life of the process.
pub struct KnownGroups {
    groups: RwLock<Vec<Arc<ImageGroup>>>,
}

impl KnownGroups {
    /// Start with the two halves of the system image set and the program's own closure.
    pub fn new(cached: ImageGroup, other: ImageGroup, main: ImageGroup) -> Self {
        Self {
            groups: RwLock::new(vec![Arc::new(cached), Arc::new(other), Arc::new(main)]),
        }
    }

    pub fn empty() -> Self {
        Self {
            groups: RwLock::new(vec![]),
        }
    }

    pub fn append(&self, group: ImageGroup) -> Arc<ImageGroup> {
        let group = Arc::new(group);
        let mut groups = self.groups.write();
        debug!(
            "appending {:?} group {} with {} images",
            group.kind(),
            groups.len(),
            group.images().len()
        );
        groups.push(group.clone());
        group
    }

    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find_by_path(&self, path: &str) -> Option<Arc<ImageDescriptor>> {
        self.groups
            .read()
            .iter()
            .find_map(|g| g.find_by_path(path).cloned())
    }

    pub fn find_by_id(&self, id: ImageId) -> Option<Arc<ImageDescriptor>> {
        self.groups
            .read()
            .iter()
            .find_map(|g| g.find_by_id(id).cloned())
    }
}

impl Default for KnownGroups {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn groups_are_searched_in_order() {
        let groups = KnownGroups::new(
            ImageGroup::new(
                GroupKind::CachedImages,
                [ImageDescriptor::new("/usr/lib/libSystem.dylib")],
            ),
            ImageGroup::new(GroupKind::OtherImages, Vec::<ImageDescriptor>::new()),
            ImageGroup::new(GroupKind::MainClosure, [ImageDescriptor::new("/bin/app")]),
        );
        assert_eq!(groups.len(), 3);
        assert!(groups.find_by_path("/usr/lib/libfoo.dylib").is_none());

        let added = groups.append(ImageGroup::new(
            GroupKind::Dynamic,
            [
                ImageDescriptor::new("/usr/lib/libfoo.dylib"),
                ImageDescriptor::new("/usr/lib/libbar.dylib"),
            ],
        ));
        assert_eq!(added.top().unwrap().path(), "/usr/lib/libfoo.dylib");
        assert_eq!(groups.len(), 4);

        let bar = groups.find_by_path("/usr/lib/libbar.dylib").unwrap();
        assert_eq!(groups.find_by_id(bar.id()).unwrap().path(), bar.path());
        assert!(groups.find_by_path("/bin/app").is_some());
    }
}
