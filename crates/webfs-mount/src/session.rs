//! Mount session with one-shot teardown.
//!
//! The OS mount table is the source of truth; the state kept here only
//! makes sure a session is unmounted at most once no matter how many times
//! teardown is requested.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::client::{ClientMountSpec, NfsClient};
use crate::error::{MountError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    Mounting,
    Mounted,
    Unmounting,
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unmounted => "unmounted",
            Self::Mounting => "mounting",
            Self::Mounted => "mounted",
            Self::Unmounting => "unmounting",
        })
    }
}

/// What a teardown request ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// This call ran the unmount and it succeeded.
    Unmounted,
    /// This call ran the unmount and it failed; the failure was logged.
    Failed,
    /// Nothing to do: not mounted, or another call already tore down.
    Skipped,
}

/// A single mount of a remote export at a local path.
pub struct MountSession {
    client: NfsClient,
    spec: ClientMountSpec,
    state: Mutex<MountState>,
}

impl MountSession {
    pub fn new(client: NfsClient, spec: ClientMountSpec) -> Self {
        Self {
            client,
            spec,
            state: Mutex::new(MountState::Unmounted),
        }
    }

    pub fn spec(&self) -> &ClientMountSpec {
        &self.spec
    }

    pub fn state(&self) -> MountState {
        *self.state.lock()
    }

    /// Mounts the export. Blocks for the duration of the mount command.
    pub fn mount(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != MountState::Unmounted {
                return Err(MountError::Config(format!(
                    "session is already {}",
                    *state
                )));
            }
            *state = MountState::Mounting;
        }

        let result = self.client.mount(&self.spec);
        *self.state.lock() = if result.is_ok() {
            MountState::Mounted
        } else {
            MountState::Unmounted
        };
        result
    }

    /// Unmounts if mounted. Only the first call after a successful mount
    /// runs the unmount; later and concurrent calls are skipped. Failures
    /// are logged, never returned.
    pub fn teardown(&self) -> Teardown {
        {
            let mut state = self.state.lock();
            if *state != MountState::Mounted {
                debug!(state = %*state, "Teardown skipped");
                return Teardown::Skipped;
            }
            *state = MountState::Unmounting;
        }

        let outcome = match self.client.unmount(&self.spec.mount_path) {
            Ok(()) => Teardown::Unmounted,
            Err(e) => {
                warn!(
                    path = %self.spec.mount_path.display(),
                    error = %e,
                    "Teardown could not unmount"
                );
                Teardown::Failed
            }
        };
        *self.state.lock() = MountState::Unmounted;
        outcome
    }
}

/// Waits for `stop`, then tears the session down on a blocking thread.
pub async fn teardown_on<F>(session: Arc<MountSession>, stop: F) -> Teardown
where
    F: Future<Output = ()>,
{
    stop.await;
    info!(path = %session.spec().mount_path.display(), "Shutting down mount");
    let worker = Arc::clone(&session);
    match tokio::task::spawn_blocking(move || worker.teardown()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(error = %e, "Teardown task failed");
            Teardown::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandRunner;
    use crate::testing::ScriptedRunner;
    use tempfile::TempDir;

    fn session(runner: &Arc<ScriptedRunner>, dir: &TempDir) -> MountSession {
        let client = NfsClient::new(Arc::clone(runner) as Arc<dyn CommandRunner>, false);
        MountSession::new(client, ClientMountSpec::new("127.0.0.1:6049", dir.path()))
    }

    fn unmount_calls(runner: &ScriptedRunner) -> usize {
        runner.calls().iter().filter(|c| c.starts_with("umount")).count()
    }

    #[test]
    fn test_mount_then_teardown() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let session = session(&runner, &dir);

        assert_eq!(session.state(), MountState::Unmounted);
        session.mount().unwrap();
        assert_eq!(session.state(), MountState::Mounted);
        assert_eq!(session.teardown(), Teardown::Unmounted);
        assert_eq!(session.state(), MountState::Unmounted);
    }

    #[test]
    fn test_teardown_runs_at_most_once() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let session = Arc::new(session(&runner, &dir));
        session.mount().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                std::thread::spawn(move || session.teardown())
            })
            .collect();
        let outcomes: Vec<Teardown> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(outcomes.iter().filter(|o| **o == Teardown::Unmounted).count(), 1);
        assert_eq!(unmount_calls(&runner), 1);
        assert_eq!(session.teardown(), Teardown::Skipped);
        assert_eq!(unmount_calls(&runner), 1);
    }

    #[test]
    fn test_teardown_without_mount_is_skipped() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new().then_fail("mount refused"));
        let session = session(&runner, &dir);

        assert!(session.mount().is_err());
        assert_eq!(session.state(), MountState::Unmounted);
        assert_eq!(session.teardown(), Teardown::Skipped);
        assert_eq!(unmount_calls(&runner), 0);
    }

    #[test]
    fn test_failed_unmount_is_logged_not_raised() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(
            ScriptedRunner::new()
                .then_succeed()
                .then_fail("busy")
                .then_fail("busy"),
        );
        let session = session(&runner, &dir);
        session.mount().unwrap();

        assert_eq!(session.teardown(), Teardown::Failed);
        assert_eq!(session.state(), MountState::Unmounted);
        assert_eq!(unmount_calls(&runner), 2);
    }

    #[test]
    fn test_double_mount_rejected() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let session = session(&runner, &dir);
        session.mount().unwrap();
        assert!(matches!(session.mount(), Err(MountError::Config(_))));
    }

    #[tokio::test]
    async fn test_teardown_on_signal_future() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let session = Arc::new(session(&runner, &dir));
        session.mount().unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let waiter = tokio::spawn(teardown_on(Arc::clone(&session), async {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();

        assert_eq!(waiter.await.unwrap(), Teardown::Unmounted);
        // A second signal after teardown does nothing
        let again = teardown_on(Arc::clone(&session), async {}).await;
        assert_eq!(again, Teardown::Skipped);
        assert_eq!(unmount_calls(&runner), 1);
    }
}
