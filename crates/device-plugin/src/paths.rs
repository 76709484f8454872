//! Resolution of the host paths a container needs to use the GPUs:
//! driver libraries, vendor binaries, and the complementary control
//! device nodes that are not requested individually.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

use thiserror::Error;
use tracing::debug;
use tracing::warn;

/// File inside the configuration directory listing the accelerator
/// libraries and binaries to expose, one entry per line.
const LIB_LIST_FILE: &str = "nvliblist.conf";

/// Control nodes required for the primary devices to work. The
/// per-GPU /dev/nvidiaN nodes are not listed here; those come from the
/// requested device ids.
const COMPLEMENTARY_DEVICES: [&str; 4] = [
    "/dev/nvidiactl",
    "/dev/nvidia-uvm",
    "/dev/nvidia-uvm-tools",
    "/dev/nvidia-modeset",
];

#[derive(Debug, Error)]
pub enum PathError {
    #[error("could not read library list {path}: {source}")]
    LibList {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not run ldconfig: {0}")]
    LdCache(#[source] std::io::Error),
}

/// Resolves host filesystem locations for the accelerator stack.
pub trait PathResolver: Send + Sync {
    /// Host paths of the accelerator libraries and binaries, in that
    /// order.
    fn accelerator_paths(&self) -> Result<(Vec<String>, Vec<String>), PathError>;

    /// Host paths of the complementary device nodes.
    fn complementary_devices(&self) -> Result<Vec<String>, PathError>;
}

/// Resolver for the NVIDIA userspace stack: library names from the
/// configured list file, locations from the dynamic linker cache and
/// `$PATH`.
pub struct NvidiaPathResolver {
    conf_dir: PathBuf,
}

impl NvidiaPathResolver {
    pub fn new(conf_dir: impl Into<PathBuf>) -> Self {
        Self {
            conf_dir: conf_dir.into(),
        }
    }
}

impl PathResolver for NvidiaPathResolver {
    fn accelerator_paths(&self) -> Result<(Vec<String>, Vec<String>), PathError> {
        let list_path = self.conf_dir.join(LIB_LIST_FILE);
        let contents = fs::read_to_string(&list_path).map_err(|source| PathError::LibList {
            path: list_path,
            source,
        })?;
        let (lib_names, bin_names) = parse_lib_list(&contents);

        let output = Command::new("ldconfig")
            .arg("-p")
            .output()
            .map_err(PathError::LdCache)?;
        let cache = parse_ld_cache(&String::from_utf8_lossy(&output.stdout));
        let libs = find_in_cache(&cache, &lib_names);
        debug!("resolved {} of {} libraries", libs.len(), lib_names.len());

        let mut bins = Vec::with_capacity(bin_names.len());
        for name in &bin_names {
            match find_executable(name) {
                Some(path) => bins.push(path.display().to_string()),
                None => warn!("binary {name} from the library list is not on PATH"),
            }
        }

        Ok((libs, bins))
    }

    fn complementary_devices(&self) -> Result<Vec<String>, PathError> {
        Ok(COMPLEMENTARY_DEVICES
            .iter()
            .filter(|path| Path::new(path).exists())
            .map(|path| path.to_string())
            .collect())
    }
}

/// Splits the library list into shared-object names and binary names.
/// Blank lines and `#` comments are skipped.
fn parse_lib_list(contents: &str) -> (Vec<String>, Vec<String>) {
    let mut libs = Vec::new();
    let mut bins = Vec::new();
    for line in contents.lines() {
        let entry = line.trim();
        if entry.is_empty() || entry.starts_with('#') {
            continue;
        }
        if entry.contains(".so") {
            libs.push(entry.to_string());
        } else {
            bins.push(entry.to_string());
        }
    }
    (libs, bins)
}

/// Parses `ldconfig -p` output into (soname, path) pairs. Lines that
/// do not look like cache entries are skipped.
fn parse_ld_cache(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let (name_part, path) = line.split_once("=>")?;
            let name = name_part.split_whitespace().next()?;
            Some((name.to_string(), path.trim().to_string()))
        })
        .collect()
}

/// The first cache entry whose soname starts with each wanted name,
/// in wanted-name order. Versioned sonames (libcuda.so.1) are matched
/// by their unversioned list entry (libcuda.so). One path per name:
/// multi-arch caches list the same soname again for the foreign ABI.
fn find_in_cache(cache: &[(String, String)], wanted: &[String]) -> Vec<String> {
    wanted
        .iter()
        .filter_map(|name| {
            cache
                .iter()
                .find(|(soname, _)| soname.starts_with(name.as_str()))
                .map(|(_, path)| path.clone())
        })
        .collect()
}

/// Searches `$PATH` for an executable, the way the shell would.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        let Ok(metadata) = fs::metadata(&candidate) else {
            continue;
        };
        if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
            return Some(candidate);
        }
    }
    None
}
