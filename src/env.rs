use std::env;
use std::path::{Path, PathBuf};

/// Prefix in a manifest `cacheDir` that resolves to the per-user data directory.
pub const USER_LIB_PREFIX: &str = "USERLIB/";
/// Prefix in a manifest `cacheDir` that resolves to the machine-wide data directory.
pub const ALL_USERS_PREFIX: &str = "ALLUSERS/";

/// Returns the per-user data root (`%LOCALAPPDATA%`, `~/Library/Application Support`, `~/.local/share`).
pub fn user_data_dir() -> PathBuf {
    let base = match env::consts::OS {
        "windows" => env::var_os("LOCALAPPDATA")
            .or_else(|| env::var_os("APPDATA"))
            .map(PathBuf::from),
        "macos" => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join("Library").join("Application Support")),
        _ => env::var_os("XDG_DATA_HOME").map(PathBuf::from).or_else(|| {
            env::var_os("HOME")
                .map(PathBuf::from)
                .map(|home| home.join(".local").join("share"))
        }),
    };

    base.unwrap_or_else(|| PathBuf::from("."))
}

/// Returns the data root shared by every user of the machine.
pub fn all_users_data_dir() -> PathBuf {
    match env::consts::OS {
        "windows" => env::var_os("ALLUSERSPROFILE")
            .or_else(|| env::var_os("PROGRAMDATA"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData")),
        "macos" => PathBuf::from("/Library/Application Support"),
        _ => PathBuf::from("/usr/local/share"),
    }
}

/// Resolve a manifest `cacheDir` value into a concrete directory.
///
/// `None` means the working directory, matching a launcher shipped next to its files.
pub fn resolve_cache_dir(configured: Option<&str>) -> PathBuf {
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    resolve_cache_dir_in(configured, &cwd)
}

pub fn resolve_cache_dir_in(configured: Option<&str>, cwd: &Path) -> PathBuf {
    match configured.map(str::trim).filter(|value| !value.is_empty()) {
        None => cwd.to_path_buf(),
        Some(value) => {
            if let Some(rest) = value.strip_prefix(USER_LIB_PREFIX) {
                user_data_dir().join(rest)
            } else if let Some(rest) = value.strip_prefix(ALL_USERS_PREFIX) {
                all_users_data_dir().join(rest)
            } else {
                cwd.join(value)
            }
        }
    }
}

/// Platform tag matched against artifact platform filters.
pub fn host_platform_tag() -> &'static str {
    if cfg!(target_os = "windows") {
        "win"
    } else if cfg!(target_os = "macos") {
        "mac"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else {
        "other"
    }
}

/// Filename the system loader uses for a bare native library name (`foo` -> `libfoo.so`).
pub fn native_library_filename(name: &str) -> String {
    format!(
        "{}{}{}",
        env::consts::DLL_PREFIX,
        name,
        env::consts::DLL_SUFFIX
    )
}

/// Whether a path carries this platform's dynamic library extension.
pub fn is_native_library(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(env::consts::DLL_EXTENSION))
}
