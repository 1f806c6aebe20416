//! File descriptor discipline across the `exec` boundary (spec section 4.3).
//!
//! `runc` must inherit exactly a known, contiguous set of fds starting at
//! 0. [`FdHandler`] closes everything else, then compacts the survivors
//! down to the lowest free integers so there are no gaps for `runc` to
//! misinterpret.

use std::collections::BTreeMap;
use std::fs;
use std::os::fd::RawFd;

use crate::error::{Error, Result};

/// A single preserved file descriptor and where its new value must be
/// reported once [`FdHandler::apply`] has possibly moved it.
#[derive(Debug, Clone)]
pub struct Preserved {
    pub name: String,
    pub env_var: Option<String>,
    pub annotation: Option<String>,
    /// If set, the original fd is duplicated *and* kept open (counts as two
    /// extras), instead of being moved and the original closed.
    pub force_dup: bool,
}

/// Bundles the fd table changes and the environment/annotation updates they
/// imply, ready for the bundle assembler to apply to `Config.env` and
/// `Config.annotations`.
#[derive(Debug, Default)]
pub struct Outcome {
    pub env_updates: Vec<(String, String)>,
    pub annotation_updates: Vec<(String, String)>,
    /// Number of fds beyond stdio (0,1,2) retained — reported via
    /// `--preserve-fds`.
    pub extra_file_descriptors: u32,
}

/// Tracks which fds must survive `apply()` and performs the close/compact.
#[derive(Debug, Default)]
pub struct FdHandler {
    preserve: BTreeMap<RawFd, Preserved>,
}

impl FdHandler {
    /// Starts a handler with stdio (0, 1, 2) always preserved.
    pub fn new() -> Self {
        let mut preserve = BTreeMap::new();
        for (fd, name) in [(0, "stdin"), (1, "stdout"), (2, "stderr")] {
            preserve.insert(fd, Preserved { name: name.into(), env_var: None, annotation: None, force_dup: false });
        }
        Self { preserve }
    }

    /// Adds `PMI_FD` from the host environment, if set, named `"PMI"`.
    pub fn preserve_pmi_fd(&mut self, host_env: &[(String, String)]) {
        if let Some((_, value)) = host_env.iter().find(|(k, _)| k == "PMI_FD") {
            if let Ok(fd) = value.parse::<RawFd>() {
                self.preserve.insert(
                    fd,
                    Preserved {
                        name: "PMI".into(),
                        env_var: Some("PMI_FD".into()),
                        annotation: None,
                        force_dup: false,
                    },
                );
            }
        }
    }

    /// Registers an additional fd to preserve, e.g. one injected by a hook
    /// via an OCI annotation.
    pub fn preserve(&mut self, fd: RawFd, entry: Preserved) {
        self.preserve.insert(fd, entry);
    }

    /// Scans `/proc/self/fd`, closes every fd not registered for
    /// preservation, then compacts the survivors down to the lowest free
    /// integers starting at 3, updating env/annotation targets.
    pub fn apply(&self) -> Result<Outcome> {
        let mut present: Vec<RawFd> = fs::read_dir("/proc/self/fd")?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str()?.parse::<RawFd>().ok())
            .collect();
        present.sort_unstable();

        for &fd in &present {
            if !self.preserve.contains_key(&fd) {
                unsafe {
                    libc::close(fd);
                }
            }
        }

        let mut outcome = Outcome::default();
        let mut next_free: RawFd = 3;

        for (&original, entry) in &self.preserve {
            if original < 3 {
                continue; // stdio never moves.
            }

            let new_fd = if entry.force_dup {
                let dup = unsafe { libc::dup(original) };
                if dup < 0 {
                    return Err(std::io::Error::last_os_error().into());
                }
                outcome.extra_file_descriptors += 1;
                dup
            } else {
                let target = next_free;
                next_free += 1;
                if target == original {
                    original
                } else {
                    let dup = unsafe { libc::dup2(original, target) };
                    if dup < 0 {
                        return Err(std::io::Error::last_os_error().into());
                    }
                    if dup != target {
                        return Err(Error::invariant(format!("dup2({original}, {target}) returned {dup}, expected {target}")));
                    }
                    unsafe {
                        libc::close(original);
                    }
                    dup
                }
            };

            if new_fd != original {
                outcome.extra_file_descriptors += 1;
            }

            if let Some(var) = &entry.env_var {
                outcome.env_updates.push((var.clone(), new_fd.to_string()));
            }
            if let Some(annotation) = &entry.annotation {
                outcome.annotation_updates.push((annotation.clone(), new_fd.to_string()));
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_always_preserved_by_default() {
        let handler = FdHandler::new();
        assert_eq!(handler.preserve.len(), 3);
    }

    #[test]
    fn preserve_pmi_fd_only_when_env_var_present() {
        let mut handler = FdHandler::new();
        handler.preserve_pmi_fd(&[]);
        assert_eq!(handler.preserve.len(), 3);

        handler.preserve_pmi_fd(&[("PMI_FD".into(), "9".into())]);
        assert_eq!(handler.preserve.len(), 4);
        assert!(handler.preserve.contains_key(&9));
    }
}
