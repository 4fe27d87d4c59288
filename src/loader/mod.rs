use std::ffi::{CString, OsStr, c_char, c_int};
use std::path::{Path, PathBuf};

use libloading::Library;
use log::{debug, info, warn};

use crate::env;
use crate::error::{BootstrapError, Result};
use crate::manifest::Manifest;

/// ABI version a library must export to be hosted inside the shell process.
pub const HOSTED_ABI_VERSION: u32 = 1;
/// `u32` static marking a library as implementing the hosted application contract.
pub const HOSTED_ABI_SYMBOL: &str = "bootstrap_hosted_abi";

/// Signature of every application entry point.
pub type EntryFn = unsafe extern "C" fn(argc: c_int, argv: *const *const c_char) -> c_int;

/// A resolved entry point. Only valid while the owning [`CodeContext`] is alive.
#[derive(Clone, Debug)]
pub struct EntryPoint {
    pub name: String,
    pub library: PathBuf,
    /// Whether the library implements the hosted application contract.
    pub hosted: bool,
    function: EntryFn,
}

#[cfg(test)]
impl EntryPoint {
    pub(crate) fn stub(name: &str, hosted: bool) -> Self {
        unsafe extern "C" fn noop(_argc: c_int, _argv: *const *const c_char) -> c_int {
            0
        }
        Self {
            name: name.to_owned(),
            library: PathBuf::from("stub"),
            hosted,
            function: noop,
        }
    }
}

struct LoadedLibrary {
    path: PathBuf,
    library: Library,
}

/// Makes a set of cached artifact locations resolvable by name in this process.
///
/// Contexts grow incrementally: extending with new locations keeps every
/// library opened so far loaded.
#[derive(Default)]
pub struct CodeContext {
    locations: Vec<PathBuf>,
    libraries: Vec<LoadedLibrary>,
    natives: Vec<(String, Library)>,
}

impl CodeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locations(&self) -> &[PathBuf] {
        &self.locations
    }

    pub fn native_libraries(&self) -> impl Iterator<Item = &str> {
        self.natives.iter().map(|(name, _)| name.as_str())
    }

    /// Add locations to the context, opening the ones that are dynamic
    /// libraries for this platform. Locations that are not on disk are skipped.
    pub fn extend<I>(&mut self, locations: I) -> Result<usize>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut added = 0;
        for location in locations {
            if self.locations.contains(&location) {
                continue;
            }
            if !location.exists() {
                debug!("loader: skipping missing artifact {}", location.display());
                continue;
            }
            if env::is_native_library(&location) {
                // SAFETY: artifacts are code shipped for this application; running
                // their initialisers is the point of loading them.
                let library =
                    unsafe { Library::new(&location) }.map_err(|e| BootstrapError::Link {
                        name: location.display().to_string(),
                        source: e.into(),
                    })?;
                debug!("loader: opened {}", location.display());
                self.libraries.push(LoadedLibrary {
                    path: location.clone(),
                    library,
                });
            }
            self.locations.push(location);
            added += 1;
        }
        Ok(added)
    }

    /// Load a native library by bare name, preferring a copy in `search_dir`.
    pub fn preload_native(&mut self, name: &str, search_dir: &Path) -> Result<()> {
        if self.native_libraries().any(|loaded| loaded == name) {
            return Ok(());
        }
        let filename = env::native_library_filename(name);
        let local = search_dir.join(&filename);
        let target = if local.is_file() {
            local.into_os_string()
        } else {
            filename.into()
        };
        // SAFETY: see `extend`.
        let library = unsafe { Library::new(&target) }.map_err(|e| BootstrapError::Link {
            name: name.to_owned(),
            source: e.into(),
        })?;
        info!("loader: preloaded native library {name}");
        self.natives.push((name.to_owned(), library));
        Ok(())
    }

    /// Find the exported entry point `name` in the opened libraries.
    pub fn resolve_entry(&self, name: &str) -> Result<EntryPoint> {
        for loaded in &self.libraries {
            // SAFETY: the symbol type is the documented entry contract.
            let Ok(symbol) = (unsafe { loaded.library.get::<EntryFn>(name.as_bytes()) }) else {
                continue;
            };
            let function = *symbol;
            let hosted = hosted_abi(&loaded.library) == Some(HOSTED_ABI_VERSION);
            debug!(
                "loader: resolved {name} in {} (hosted={hosted})",
                loaded.path.display()
            );
            return Ok(EntryPoint {
                name: name.to_owned(),
                library: loaded.path.clone(),
                hosted,
                function,
            });
        }
        Err(BootstrapError::Resolution {
            entry: name.to_owned(),
        })
    }

    /// Locate a resource by relative name among the context locations.
    pub fn find_resource(&self, name: &str) -> Option<&Path> {
        let wanted = Path::new(name);
        self.locations
            .iter()
            .find(|location| location.ends_with(wanted))
            .map(PathBuf::as_path)
    }

    /// Run `entry` on the calling thread with `args` as its argv.
    pub fn invoke(&self, entry: &EntryPoint, args: &[String]) -> i32 {
        let owned: Vec<CString> = args
            .iter()
            .filter_map(|arg| match CString::new(arg.as_str()) {
                Ok(arg) => Some(arg),
                Err(_) => {
                    warn!("loader: dropping argument with an embedded NUL: {arg:?}");
                    None
                }
            })
            .collect();
        let mut argv: Vec<*const c_char> = owned.iter().map(|arg| arg.as_ptr()).collect();
        argv.push(std::ptr::null());
        info!("loader: invoking {} from {}", entry.name, entry.library.display());
        // SAFETY: `entry` was resolved from a library owned by `self`, which is
        // borrowed for the whole call; argv is null-terminated and outlives it.
        unsafe { (entry.function)(owned.len() as c_int, argv.as_ptr()) }
    }
}

fn hosted_abi(library: &Library) -> Option<u32> {
    // SAFETY: the marker is documented as a `u32` static.
    let marker = unsafe { library.get::<*const u32>(HOSTED_ABI_SYMBOL.as_bytes()) }.ok()?;
    let ptr = *marker;
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null pointer to the exported static.
    Some(unsafe { *ptr })
}

pub struct LoaderBootstrap;

impl LoaderBootstrap {
    /// Preload the manifest's native libraries, then make its platform
    /// artifacts resolvable, extending `existing` when a context is active.
    pub fn build(
        manifest: &Manifest,
        cache_dir: &Path,
        existing: Option<CodeContext>,
    ) -> Result<CodeContext> {
        let mut context = existing.unwrap_or_default();
        for name in &manifest.preload_native_libraries {
            context.preload_native(name, cache_dir)?;
        }

        let locations = manifest
            .platform_artifacts()
            .map(|artifact| artifact.cache_path(cache_dir));
        let added = context.extend(locations)?;
        info!(
            "loader: context ready with {} location(s), {} new",
            context.locations().len(),
            added
        );
        Ok(context)
    }

    /// Build a context from a `--module-path` value handed to a re-invoked shell.
    pub fn from_module_path(module_path: &OsStr) -> Result<CodeContext> {
        let mut context = CodeContext::new();
        let locations: Vec<PathBuf> = std::env::split_paths(module_path).collect();
        if locations.is_empty() {
            warn!("loader: empty module path");
        }
        context.extend(locations)?;
        Ok(context)
    }
}
