//! Loader configuration.

use std::time::Duration;

use tracing::warn;

pub const LIBRARY_PATH_ENV: &str = "DYNLOAD_LIBRARY_PATH";
pub const FALLBACK_LIBRARY_PATH_ENV: &str = "DYNLOAD_FALLBACK_LIBRARY_PATH";
pub const MONITOR_TIMEOUT_ENV: &str = "DYNLOAD_MONITOR_TIMEOUT_MS";

const DEFAULT_MONITOR_TIMEOUT: Duration = Duration::from_millis(2000);
const DEFAULT_MONITOR_MAX_MESSAGE: usize = 32 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Directories tried, with the requested file name, before the requested path itself.
    pub library_path: Vec<String>,
    /// Directories tried, with the requested file name, after the requested path itself.
    pub fallback_library_path: Vec<String>,
    /// Prepended to every name passed to `dlsym`.
    pub symbol_prefix: String,
    pub monitor_timeout: Duration,
    /// Monitor messages larger than this are split.
    pub monitor_max_message: usize,
    /// Base address of the shared image cache, passed through to the mapper.
    pub cache_base: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            library_path: vec![],
            fallback_library_path: vec![],
            symbol_prefix: "_".to_string(),
            monitor_timeout: DEFAULT_MONITOR_TIMEOUT,
            monitor_max_message: DEFAULT_MONITOR_MAX_MESSAGE,
            cache_base: 0,
        }
    }
}

fn split_paths(value: &str) -> Vec<String> {
    value
        .split(':')
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

impl LoaderConfig {
    /// Defaults, overridden by the `DYNLOAD_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Like [LoaderConfig::from_env], but reading variables through `var`.
    pub fn from_vars(mut var: impl FnMut(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(paths) = var(LIBRARY_PATH_ENV) {
            config.library_path = split_paths(&paths);
        }
        if let Some(paths) = var(FALLBACK_LIBRARY_PATH_ENV) {
            config.fallback_library_path = split_paths(&paths);
        }
        if let Some(ms) = var(MONITOR_TIMEOUT_ENV) {
            match ms.parse() {
                Ok(ms) => config.monitor_timeout = Duration::from_millis(ms),
                Err(_) => warn!("ignoring invalid {}: {}", MONITOR_TIMEOUT_ENV, ms),
            }
        }
        config
    }

    pub fn with_library_path(mut self, dirs: impl IntoIterator<Item = impl ToString>) -> Self {
        self.library_path = dirs.into_iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_fallback_library_path(
        mut self,
        dirs: impl IntoIterator<Item = impl ToString>,
    ) -> Self {
        self.fallback_library_path = dirs.into_iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_symbol_prefix(mut self, prefix: impl ToString) -> Self {
        self.symbol_prefix = prefix.to_string();
        self
    }

    pub fn with_monitor_timeout(mut self, timeout: Duration) -> Self {
        self.monitor_timeout = timeout;
        self
    }

    pub fn with_monitor_max_message(mut self, max: usize) -> Self {
        self.monitor_max_message = max;
        self
    }

    pub fn with_cache_base(mut self, base: usize) -> Self {
        self.cache_base = base;
        self
    }

    /// Every path a request for `path` may be satisfied by, in the order they are tried.
    pub fn path_variants(&self, path: &str) -> Vec<String> {
        let leaf = path.rsplit('/').next().unwrap_or(path);
        let in_dir = |dir: &String| format!("{}/{}", dir.trim_end_matches('/'), leaf);
        self.library_path
            .iter()
            .map(in_dir)
            .chain(std::iter::once(path.to_string()))
            .chain(self.fallback_library_path.iter().map(in_dir))
            .collect()
    }

    /// Mangle a source-level symbol name.
    pub fn mangle(&self, name: &str) -> String {
        format!("{}{}", self.symbol_prefix, name)
    }
}
