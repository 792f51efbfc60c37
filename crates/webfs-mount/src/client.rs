//! Mount and unmount through the system NFS client.

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::address::Endpoint;
use crate::command::{CommandRunner, Invocation, SystemRunner, needs_elevation};
use crate::error::{MountError, Result};

/// Export path on the server. webfs serves a single tree.
pub const REMOTE_EXPORT: &str = "/";

const MOUNT_DIR_MODE: u32 = 0o755;

/// What to mount and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMountSpec {
    /// NFS endpoint, usually the local tunnel listener (`host[:port]`).
    pub address: String,
    /// Local directory to mount onto.
    pub mount_path: PathBuf,
}

impl ClientMountSpec {
    pub fn new(address: impl Into<String>, mount_path: impl Into<PathBuf>) -> Self {
        Self {
            address: address.into(),
            mount_path: mount_path.into(),
        }
    }
}

/// Drives `mount -t nfs` / `umount`.
#[derive(Clone)]
pub struct NfsClient {
    runner: Arc<dyn CommandRunner>,
    elevate: bool,
}

impl NfsClient {
    /// Client that runs real commands, prefixed with `sudo` unless already root.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemRunner), needs_elevation())
    }

    pub fn new(runner: Arc<dyn CommandRunner>, elevate: bool) -> Self {
        Self { runner, elevate }
    }

    /// Builds the mount command for `spec` without running it.
    pub fn mount_invocation(&self, spec: &ClientMountSpec) -> Result<Invocation> {
        if spec.mount_path.as_os_str().is_empty() {
            return Err(MountError::Config("mount path is empty".to_string()));
        }
        let endpoint = Endpoint::parse(&spec.address)?;

        let mut args = vec!["-t".to_string(), "nfs".to_string()];
        args.extend(endpoint.mount_options());
        args.push(endpoint.source(REMOTE_EXPORT));
        args.push(spec.mount_path.to_string_lossy().into_owned());
        Ok(Invocation::new("mount", args, self.elevate))
    }

    /// Mounts the remote export at `spec.mount_path`, creating the directory
    /// if needed.
    pub fn mount(&self, spec: &ClientMountSpec) -> Result<()> {
        let invocation = self.mount_invocation(spec)?;
        prepare_mount_point(&spec.mount_path)?;

        let command = invocation.display();
        info!(%command, "Mounting");
        let output = invocation
            .run(self.runner.as_ref())
            .map_err(|e| MountError::Mount {
                command: command.clone(),
                output: e.to_string(),
            })?;
        if !output.success {
            return Err(MountError::Mount {
                command,
                output: output.combined(),
            });
        }
        info!(address = %spec.address, path = %spec.mount_path.display(), "Mounted");
        Ok(())
    }

    /// Unmounts `path`, retrying once with `-f` if the plain unmount fails.
    ///
    /// When the forced attempt also fails the error from the first attempt
    /// is returned.
    pub fn unmount(&self, path: &Path) -> Result<()> {
        let target = path.to_string_lossy().into_owned();

        let plain = Invocation::new("umount", vec![target.clone()], self.elevate);
        let Err(first) = self.run_unmount(&plain) else {
            info!(path = %path.display(), "Unmounted");
            return Ok(());
        };
        warn!(path = %path.display(), error = %first, "Unmount failed, retrying with force");

        let forced = Invocation::new("umount", vec!["-f".to_string(), target], self.elevate);
        match self.run_unmount(&forced) {
            Ok(()) => {
                info!(path = %path.display(), "Force unmounted");
                Ok(())
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Forced unmount failed, please unmount {} manually",
                    path.display()
                );
                Err(first)
            }
        }
    }

    fn run_unmount(&self, invocation: &Invocation) -> Result<()> {
        let command = invocation.display();
        debug!(%command, "Unmounting");
        let output = invocation
            .run(self.runner.as_ref())
            .map_err(|e| MountError::Unmount {
                command: command.clone(),
                output: e.to_string(),
            })?;
        if output.success {
            Ok(())
        } else {
            Err(MountError::Unmount {
                command,
                output: output.combined(),
            })
        }
    }
}

/// Creates the mount point and any missing parents.
fn prepare_mount_point(path: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(MOUNT_DIR_MODE)
        .create(path)
        .map_err(|source| MountError::Filesystem {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;
    use tempfile::TempDir;

    fn client(runner: &Arc<ScriptedRunner>, elevate: bool) -> NfsClient {
        NfsClient::new(Arc::clone(runner) as Arc<dyn CommandRunner>, elevate)
    }

    #[test]
    fn test_empty_mount_path_runs_nothing() {
        let runner = Arc::new(ScriptedRunner::new());
        let err = client(&runner, true)
            .mount(&ClientMountSpec::new("127.0.0.1:6049", ""))
            .unwrap_err();
        assert!(matches!(err, MountError::Config(_)));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_mount_creates_directory_and_runs_command() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("a/b/mnt");
        let runner = Arc::new(ScriptedRunner::new());

        client(&runner, true)
            .mount(&ClientMountSpec::new("1.2.3.4:555", &target))
            .unwrap();

        assert!(target.is_dir());
        assert_eq!(
            runner.calls(),
            [format!(
                "sudo mount -t nfs -o port=555 -o mountport=555 1.2.3.4:/ {}",
                target.display()
            )]
        );
    }

    #[test]
    fn test_existing_directory_does_not_block_mount() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let nfs = client(&runner, false);
        let spec = ClientMountSpec::new("1.2.3.4", tmp.path());

        nfs.mount(&spec).unwrap();
        nfs.mount(&spec).unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], format!("mount -t nfs 1.2.3.4:/ {}", tmp.path().display()));
    }

    #[test]
    fn test_mount_dir_creation_failure() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("file");
        std::fs::write(&file, b"").unwrap();
        let runner = Arc::new(ScriptedRunner::new());

        let err = client(&runner, false)
            .mount(&ClientMountSpec::new("1.2.3.4", file.join("mnt")))
            .unwrap_err();
        assert!(matches!(err, MountError::Filesystem { .. }));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_bad_address_is_config_error() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let err = client(&runner, false)
            .mount(&ClientMountSpec::new("host:notaport", tmp.path()))
            .unwrap_err();
        assert!(matches!(err, MountError::Config(_)));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_mount_failure_carries_output() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new().then_fail("access denied by server"));
        let err = client(&runner, false)
            .mount(&ClientMountSpec::new("1.2.3.4:1", tmp.path()))
            .unwrap_err();
        match err {
            MountError::Mount { output, .. } => assert_eq!(output, "access denied by server"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_ipv6_source_is_bracketed() {
        let runner = Arc::new(ScriptedRunner::new());
        let inv = client(&runner, false)
            .mount_invocation(&ClientMountSpec::new("[fd00::1]:6049", "/mnt/w"))
            .unwrap();
        assert_eq!(
            inv.display(),
            "mount -t nfs -o port=6049 -o mountport=6049 [fd00::1]:/ /mnt/w"
        );
    }

    #[test]
    fn test_unmount_success_single_call() {
        let runner = Arc::new(ScriptedRunner::new());
        client(&runner, true).unmount(Path::new("/mnt/w")).unwrap();
        assert_eq!(runner.calls(), ["sudo umount /mnt/w"]);
    }

    #[test]
    fn test_unmount_retries_forced_once() {
        let runner = Arc::new(ScriptedRunner::new().then_fail("busy").then_succeed());
        client(&runner, true).unmount(Path::new("/mnt/w")).unwrap();
        assert_eq!(runner.calls(), ["sudo umount /mnt/w", "sudo umount -f /mnt/w"]);
    }

    #[test]
    fn test_unmount_surfaces_original_error() {
        let runner = Arc::new(ScriptedRunner::new().then_fail("busy").then_fail("still busy"));
        let err = client(&runner, false).unmount(Path::new("/mnt/w")).unwrap_err();
        match err {
            MountError::Unmount { command, output } => {
                assert_eq!(command, "umount /mnt/w");
                assert_eq!(output, "busy");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(runner.calls().len(), 2);
    }

    #[test]
    fn test_unmount_spawn_failure_is_retried() {
        let runner = Arc::new(ScriptedRunner::new().then_spawn_error().then_succeed());
        client(&runner, true).unmount(Path::new("/mnt/w")).unwrap();
        assert_eq!(runner.calls().len(), 2);
    }
}
