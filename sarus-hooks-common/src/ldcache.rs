//! Dynamic-linker cache scanning, shared by the mount (libfabric lookup),
//! glibc, and MPI hooks (spec sections 4.7-4.9).

use std::path::{Path, PathBuf};

use regex::Regex;
use sarus_core::error::{Error, Result};

/// One entry from `ldconfig -p`'s output: `name (flags) => path`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub name: String,
    pub path: PathBuf,
}

/// Runs `ldconfig_path -r rootfs -p` and parses its `name (flags) => path`
/// lines into [`CacheEntry`] records.
pub fn list_cache(ldconfig_path: &Path, rootfs: &Path) -> Result<Vec<CacheEntry>> {
    let output = std::process::Command::new(ldconfig_path)
        .arg("-r")
        .arg(rootfs)
        .arg("-p")
        .output()?;
    if !output.status.success() {
        return Err(Error::external_tool(format!("{} -r {} -p", ldconfig_path.display(), rootfs.display()), output.status.code().unwrap_or(-1)));
    }
    Ok(parse_cache_output(&String::from_utf8_lossy(&output.stdout)))
}

fn parse_cache_output(stdout: &str) -> Vec<CacheEntry> {
    let mut entries = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        let Some((name_and_flags, path)) = line.split_once("=>") else { continue };
        let Some(name) = name_and_flags.split_whitespace().next() else { continue };
        entries.push(CacheEntry { name: name.to_string(), path: PathBuf::from(path.trim()) });
    }
    entries
}

/// Finds the first cache entry whose resolved path's basename matches
/// `pattern`, used for the `<FI_PROVIDER_PATH>` libfabric fallback lookup
/// (matching `libfabric\.so(\.\d+)+`).
pub fn find_by_basename_pattern(entries: &[CacheEntry], pattern: &Regex) -> Option<PathBuf> {
    entries
        .iter()
        .find(|e| e.path.file_name().and_then(|n| n.to_str()).is_some_and(|n| pattern.is_match(n)))
        .map(|e| e.path.clone())
}

/// Finds the first cache entry whose basename matches `needle_prefix`,
/// used to locate a container's libc (`libc[.-]…`) among its cache entries.
pub fn find_libc(entries: &[CacheEntry]) -> Option<&CacheEntry> {
    let re = Regex::new(r"^libc[.\-]").ok()?;
    entries.iter().find(|e| re.is_match(&e.name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ldconfig_output() {
        let stdout = "1234 libs found in cache `/etc/ld.so.cache'\n\
                      \tlibc.so.6 (libc6,x86-64) => /lib/x86_64-linux-gnu/libc.so.6\n\
                      \tlibfabric.so.1 (libc6,x86-64) => /usr/lib/x86_64-linux-gnu/libfabric.so.1\n";
        let entries = parse_cache_output(stdout);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "libc.so.6");
        assert_eq!(entries[1].path, PathBuf::from("/usr/lib/x86_64-linux-gnu/libfabric.so.1"));
    }

    #[test]
    fn finds_libfabric_by_pattern() {
        let entries = vec![
            CacheEntry { name: "libc.so.6".into(), path: PathBuf::from("/lib/libc.so.6") },
            CacheEntry { name: "libfabric.so.1".into(), path: PathBuf::from("/usr/lib/libfabric.so.1") },
        ];
        let pattern = Regex::new(r"^libfabric\.so(\.\d+)+$").unwrap();
        assert_eq!(find_by_basename_pattern(&entries, &pattern), Some(PathBuf::from("/usr/lib/libfabric.so.1")));
    }

    #[test]
    fn finds_libc_entry() {
        let entries = vec![
            CacheEntry { name: "libfoo.so".into(), path: PathBuf::from("/lib/libfoo.so") },
            CacheEntry { name: "libc-2.31.so".into(), path: PathBuf::from("/lib/libc-2.31.so") },
        ];
        assert_eq!(find_libc(&entries).unwrap().name, "libc-2.31.so");
    }
}
