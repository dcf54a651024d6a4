//! Scratch directories for per-operation checkouts.

use std::path::{Path, PathBuf};

use crate::error::StoreError;

/// Allocates one checkout directory per operation under `<base>/checkouts`.
#[derive(Debug, Clone)]
pub struct Workdirs {
    base: PathBuf,
}

impl Workdirs {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn checkouts_dir(&self) -> PathBuf {
        self.base.join("checkouts")
    }

    /// Claim a fresh, empty directory named `<pid>.<label>.<n>`.
    ///
    /// Directories left behind by dead processes are swept first.
    pub fn allocate(&self, label: &str) -> Result<PathBuf, StoreError> {
        let root = self.checkouts_dir();
        std::fs::create_dir_all(&root)?;
        Self::clean_stale(&root)?;

        let label = sanitize_label(label);
        for attempt in 0..100 {
            let candidate = root.join(format!("{}.{}.{}", std::process::id(), label, attempt));
            match std::fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::Command {
            op: "checkout".to_string(),
            message: format!(
                "failed to allocate a checkout directory in {}",
                root.display()
            ),
        })
    }

    fn clean_stale(root: &Path) -> Result<(), StoreError> {
        let current_pid = std::process::id();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if let Some(pid_str) = name_str.split('.').next()
                && let Ok(pid) = pid_str.parse::<u32>()
                && pid != current_pid
                && !is_process_alive(pid)
            {
                tracing::debug!(path = %entry.path().display(), "removing stale checkout");
                if let Err(err) = std::fs::remove_dir_all(entry.path()) {
                    tracing::warn!(
                        path = %entry.path().display(),
                        error = %err,
                        "failed to remove stale checkout"
                    );
                }
            }
        }
        Ok(())
    }
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "op".to_string()
    } else {
        cleaned
    }
}

/// Conservative liveness check; unknown platforms report alive.
fn is_process_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{}", pid)).exists()
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("ps")
            .args(["-p", &pid.to_string()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(true)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = pid;
        true
    }
}
