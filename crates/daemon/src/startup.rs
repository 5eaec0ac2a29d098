// Startup plumbing: state directory, PID file, database location.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::{global_dir, DaemonConfig};

/// PID file: ~/.slotsync/slotsyncd.pid (diagnostics only)
const PID_FILE_NAME: &str = "slotsyncd.pid";

/// Resolved paths for daemon runtime files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
    pub base_dir: PathBuf,
    pub pid_path: PathBuf,
    pub db_path: PathBuf,
}

impl DaemonPaths {
    /// Resolve paths under `~/.slotsync/`, creating the directory.
    pub fn resolve(config: &DaemonConfig) -> Result<Self> {
        let base_dir = global_dir().context("could not determine home directory")?;
        Self::resolve_in(base_dir, config)
    }

    pub fn resolve_in(base_dir: impl Into<PathBuf>, config: &DaemonConfig) -> Result<Self> {
        let base_dir = base_dir.into();
        ensure_private_dir(&base_dir)?;
        let db_path = config.db_path(&base_dir);
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create `{}`", parent.display()))?;
        }
        Ok(Self { pid_path: base_dir.join(PID_FILE_NAME), db_path, base_dir })
    }
}

/// Write the current process PID.
pub fn write_pid_file(path: &Path) -> Result<()> {
    let pid = std::process::id();
    let mut file = fs::File::create(path).context("failed to create PID file")?;
    write!(file, "{pid}").context("failed to write PID")?;
    info!(pid, path = %path.display(), "wrote PID file");
    Ok(())
}

/// Remove the PID file on shutdown.
pub fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(error = %e, "failed to remove PID file");
        }
    }
}

/// Create `path` if needed and restrict it to the owner (0700 on unix).
fn ensure_private_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("failed to create `{}`", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mode = fs::metadata(path)
            .with_context(|| format!("failed to read metadata for `{}`", path.display()))?
            .permissions()
            .mode()
            & 0o777;
        if mode != 0o700 {
            fs::set_permissions(path, fs::Permissions::from_mode(0o700))
                .with_context(|| format!("failed to set owner-only mode on `{}`", path.display()))?;
        }
    }

    Ok(())
}
