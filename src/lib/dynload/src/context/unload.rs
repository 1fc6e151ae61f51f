use tracing::debug;

use super::{Context, Handle};
use crate::{engines::LoaderEngine, DynloadError, DynloadErrorKind};

impl<E: LoaderEngine> Context<E> {
    /// Drop a reference obtained from [Context::dlopen]. When an image's last reference goes, a
    /// collection pass unloads everything no longer reachable. Closing the whole-process handles
    /// is accepted and does nothing.
    pub fn dlclose(&self, handle: Handle) -> Result<(), DynloadError> {
        debug!("dlclose({:?})", handle);
        let load_address = match handle {
            Handle::Default | Handle::MainOnly => return Ok(()),
            Handle::Next { .. } | Handle::SelfImage { .. } => {
                return Err(DynloadErrorKind::InvalidHandle.into())
            }
            Handle::Image { load_address, .. } => load_address,
        };

        let _guard = self.api_lock.lock();
        let Some(image) = self.registry.find_by_load_address(load_address) else {
            return Err(DynloadErrorKind::InvalidHandle.into());
        };
        if image.is_never_unload() {
            return Ok(());
        }

        if self.refs.close(load_address) {
            let stats = self.gc.collect(&self.registry, &self.refs, &self.engine);
            debug!(
                "dlclose({}): {} passes, {} unloaded",
                image, stats.passes, stats.unloaded
            );
        }
        Ok(())
    }
}
