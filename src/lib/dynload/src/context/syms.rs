use tracing::{debug, warn};

use super::{Context, Handle};
use crate::{
    engines::LoaderEngine,
    symbol::{ResolveMode, ResolvedSymbol, SearchScope, SymbolResolver},
    trie::{self, ExportRecord},
    DynloadError, DynloadErrorKind,
};

/// Name reported for an address that is exactly an image's load address.
const IMAGE_HEADER_SYMBOL: &str = "__dso_handle";

/// What [Context::dladdr] knows about an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    /// Path of the image containing the address.
    pub path: String,
    pub base: usize,
    /// The nearest exported symbol at or below the address, with the symbol prefix removed.
    pub symbol: Option<String>,
    pub symbol_address: Option<usize>,
}

impl<E: LoaderEngine> Context<E> {
    fn scope_for(&self, handle: Handle) -> Result<SearchScope, DynloadError> {
        Ok(match handle {
            Handle::Default => SearchScope::LoadOrder,
            Handle::MainOnly => SearchScope::Image(
                self.registry
                    .main_executable()
                    .ok_or(DynloadError::new(DynloadErrorKind::InvalidHandle))?
                    .load_address(),
            ),
            Handle::Next { caller } | Handle::SelfImage { caller } => {
                let Some((image, _)) = self.registry.find_by_owned_address(caller) else {
                    return Err(DynloadErrorKind::UnknownCaller { addr: caller }.into());
                };
                SearchScope::Dependents {
                    start: image.load_address(),
                    include_start: matches!(handle, Handle::SelfImage { .. }),
                }
            }
            Handle::Image {
                load_address,
                first_only,
            } => {
                if self.registry.find_by_load_address(load_address).is_none() {
                    return Err(DynloadErrorKind::InvalidHandle.into());
                }
                if first_only {
                    SearchScope::Image(load_address)
                } else {
                    SearchScope::Dependents {
                        start: load_address,
                        include_start: true,
                    }
                }
            }
        })
    }

    /// Find the source-level symbol `name` through `handle`.
    pub fn lookup(
        &self,
        handle: Handle,
        name: &str,
        mode: ResolveMode,
    ) -> Result<ResolvedSymbol, DynloadError> {
        let scope = self.scope_for(handle)?;
        let mangled = self.config.mangle(name);
        SymbolResolver::new(&self.registry, &self.engine)
            .resolve(&mangled, scope, mode)?
            .ok_or_else(|| DynloadErrorKind::SymbolNotFound { symbol: mangled }.into())
    }

    /// The address of `name` as seen through `handle`. Lazily resolved symbols have their
    /// resolver called.
    pub fn dlsym(&self, handle: Handle, name: &str) -> Result<usize, DynloadError> {
        debug!("dlsym({:?}, {})", handle, name);
        let sym = self.lookup(handle, name, ResolveMode::Resolve)?;
        debug!("dlsym({}) => {:#x} in {}", name, sym.address, sym.image);
        Ok(sym.address)
    }

    /// Check whether `name` is visible through `handle`, without running any image code.
    pub fn has_symbol(&self, handle: Handle, name: &str) -> Result<bool, DynloadError> {
        match self.lookup(handle, name, ResolveMode::Exists) {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind, DynloadErrorKind::SymbolNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Describe the image and nearest symbol for an address.
    pub fn dladdr(&self, addr: usize) -> Option<SymbolInfo> {
        let (image, _) = self.registry.find_by_owned_address(addr)?;
        let base = image.load_address();
        let mut info = SymbolInfo {
            path: image.path().to_string(),
            base,
            symbol: None,
            symbol_address: None,
        };

        let exports = match trie::exports(image.descriptor().exports()) {
            Ok(exports) => exports,
            Err(e) => {
                warn!("dladdr: exports of {} unreadable: {}", image, e);
                vec![]
            }
        };
        let nearest = exports
            .into_iter()
            .filter_map(|(name, record)| match record {
                ExportRecord::Regular { offset } => {
                    Some((name, base.wrapping_add(offset as usize)))
                }
                _ => None,
            })
            .filter(|(_, sym_addr)| *sym_addr <= addr)
            .max_by_key(|(_, sym_addr)| *sym_addr);

        match nearest {
            Some((name, sym_addr)) if sym_addr == addr || addr != base => {
                let name = name
                    .strip_prefix(&self.config.symbol_prefix)
                    .map(String::from)
                    .unwrap_or(name);
                info.symbol = Some(name);
                info.symbol_address = Some(sym_addr);
            }
            _ if addr == base => {
                info.symbol = Some(IMAGE_HEADER_SYMBOL.to_string());
                info.symbol_address = Some(base);
            }
            _ => {}
        }
        Some(info)
    }
}
