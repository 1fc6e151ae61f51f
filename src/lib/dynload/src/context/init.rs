use tracing::{debug, trace};

use super::Context;
use crate::{
    deps::{self, ClosureMember, Resolution},
    engines::LoaderEngine,
    image::{InitState, LoadedImage},
    DynloadError,
};

impl<E: LoaderEngine> Context<E> {
    /// Initialize `top` and everything it depends on, dependencies first. Each image is
    /// initialized at most once. An image found mid-initialization (because its initializer,
    /// directly or not, led back here) is skipped rather than waited on.
    pub(crate) fn run_initializers_bottom_up(&self, top: &LoadedImage) -> Result<(), DynloadError> {
        let loaded: Vec<LoadedImage> = self.registry.iter().collect();
        let closure = deps::closure(
            ClosureMember {
                descriptor: top.descriptor().clone(),
                loaded: Some(top.clone()),
            },
            |desc, ordinal| match deps::loaded_dependency(&loaded, desc, ordinal) {
                Some(image) => Resolution::Loaded(image.clone()),
                None => Resolution::NotFound,
            },
        )?;

        for member in closure.bottom_up() {
            if let Some(image) = &member.loaded {
                self.initialize(image);
            }
        }
        Ok(())
    }

    fn initialize(&self, image: &LoadedImage) {
        let addr = image.load_address();
        let guard = self.init_lock.lock();
        let Some(state) = self.registry.state(addr) else {
            panic!("{} scheduled for initialization but no longer loaded", image);
        };
        match state {
            InitState::Inited => return,
            InitState::BeingInited => {
                debug!("{} is already being initialized, skipping", image);
                return;
            }
            InitState::Uninited => {}
        }
        self.registry.advance_state(addr, InitState::BeingInited);
        drop(guard);

        self.registry.notifiers().image_initializing(image);
        trace!("running initializers for {}", image);
        self.engine.run_initializers(image);

        let _guard = self.init_lock.lock();
        self.registry.advance_state(addr, InitState::Inited);
    }
}
