use std::{path::PathBuf, process::Stdio, time::Duration};

use crate::{config::AgentConfig, process_manager::LaunchSpec, support::truncate_utf8};

const SYNC_OUTPUT_MAX_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Pull,
    Push,
}

impl SyncDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncDirection::Pull => "pull",
            SyncDirection::Push => "push",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("theme sync script not found: {}", .0.display())]
    ScriptMissing(PathBuf),
    #[error("failed to spawn theme {direction} script: {source}")]
    Spawn {
        direction: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("theme {direction} failed with code {code:?}: {output}")]
    Failed {
        direction: &'static str,
        code: Option<i32>,
        output: String,
    },
    #[error("theme {direction} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        direction: &'static str,
        timeout: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No sync script configured; the stage passes through.
    Skipped,
    Completed { output: String },
}

/// Runs the optional `pull`/`push` theme script ahead of a dev start.
#[derive(Debug, Clone)]
pub struct ThemeSync {
    script: Option<PathBuf>,
    timeout: Duration,
}

impl ThemeSync {
    pub fn new(cfg: &AgentConfig) -> Self {
        Self {
            script: cfg.sync_script.clone(),
            timeout: cfg.sync_timeout(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.script.is_some()
    }

    pub async fn run(
        &self,
        direction: SyncDirection,
        spec: &LaunchSpec,
    ) -> Result<SyncOutcome, SyncError> {
        let Some(script) = &self.script else {
            return Ok(SyncOutcome::Skipped);
        };
        if tokio::fs::metadata(script).await.is_err() {
            return Err(SyncError::ScriptMissing(script.clone()));
        }

        let dir = direction.as_str();
        let mut cmd = tokio::process::Command::new(script);
        cmd.arg(dir)
            .arg(&spec.user_id.0)
            .arg(&spec.sandbox_id.0)
            .arg(&spec.store_domain)
            .arg(&spec.access_token)
            .arg(spec.theme_id.to_string())
            .current_dir(&spec.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(sandbox_id = %spec.sandbox_id, direction = dir, "running theme sync");
        let child = cmd.spawn().map_err(|source| SyncError::Spawn {
            direction: dir,
            source,
        })?;

        let out = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(out)) => out,
            Ok(Err(source)) => {
                return Err(SyncError::Spawn {
                    direction: dir,
                    source,
                });
            }
            Err(_) => {
                tracing::warn!(sandbox_id = %spec.sandbox_id, direction = dir, "theme sync timed out");
                return Err(SyncError::Timeout {
                    direction: dir,
                    timeout: self.timeout,
                });
            }
        };

        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));
        let output = truncate_utf8(output.trim(), SYNC_OUTPUT_MAX_BYTES);

        if !out.status.success() {
            return Err(SyncError::Failed {
                direction: dir,
                code: out.status.code(),
                output,
            });
        }
        Ok(SyncOutcome::Completed { output })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use themebox_process::{PortPair, SandboxId, UserId};

    use super::*;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("sync.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn sync(script: Option<PathBuf>, timeout_ms: u64) -> ThemeSync {
        ThemeSync::new(&AgentConfig {
            sync_script: script,
            sync_timeout_ms: timeout_ms,
            ..AgentConfig::default()
        })
    }

    fn spec(workdir: &Path) -> LaunchSpec {
        LaunchSpec {
            user_id: UserId("user-1".into()),
            sandbox_id: SandboxId("sb-1".into()),
            store_domain: "example.myshopify.com".into(),
            access_token: "shpat_test".into(),
            theme_id: 42,
            store_password: None,
            ports: PortPair {
                app_port: 3100,
                proxy_port: 4100,
            },
            workdir: workdir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn unconfigured_sync_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let s = sync(None, 1_000);
        assert!(!s.is_configured());
        assert_eq!(
            s.run(SyncDirection::Pull, &spec(dir.path())).await.unwrap(),
            SyncOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn script_receives_direction_and_identity() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo \"$1 $2 $3 $4 $6\"");
        let s = sync(Some(script), 5_000);

        let out = s.run(SyncDirection::Push, &spec(dir.path())).await.unwrap();
        assert_eq!(
            out,
            SyncOutcome::Completed {
                output: "push user-1 sb-1 example.myshopify.com 42".into()
            }
        );
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo 'unauthorized' >&2\nexit 2");
        let s = sync(Some(script), 5_000);

        match s.run(SyncDirection::Pull, &spec(dir.path())).await {
            Err(SyncError::Failed { code, output, .. }) => {
                assert_eq!(code, Some(2));
                assert_eq!(output, "unauthorized");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_script_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "exec sleep 30");
        let s = sync(Some(script), 200);

        assert!(matches!(
            s.run(SyncDirection::Pull, &spec(dir.path())).await,
            Err(SyncError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn missing_script_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let s = sync(Some(dir.path().join("absent.sh")), 1_000);
        assert!(matches!(
            s.run(SyncDirection::Pull, &spec(dir.path())).await,
            Err(SyncError::ScriptMissing(_))
        ));
    }
}
