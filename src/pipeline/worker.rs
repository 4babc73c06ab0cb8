//! Toolchain subprocess execution.
//!
//! Spawns via `tokio::process::Command` inside a process group, captures
//! stdout/stderr concurrently with the wait, enforces a hard timeout, and
//! kills the whole process group on expiry — generalized to an allowlisted,
//! argv-only `generator`/`compiler` toolchain pair rather than one
//! hard-coded build command.

use crate::error::Error;
use crate::pool::BytePool;
use command_group::AsyncCommandGroup;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Resolved, absolute paths for the two toolchain executables, found once at
/// startup via `which` and treated as the allowlist for every subsequent
/// build — `spec.md` §4.4's "only commands whose resolved path is on an
/// allowlist may run."
#[derive(Debug, Clone)]
pub struct ToolchainPaths {
    pub generator: PathBuf,
    pub compiler: PathBuf,
}

impl ToolchainPaths {
    pub fn resolve(generator_name: &str, compiler_name: &str) -> Result<Self, Error> {
        let generator = which::which(generator_name)
            .map_err(|_| Error::ToolchainMissing(generator_name.to_string()))?;
        let compiler = which::which(compiler_name)
            .map_err(|_| Error::ToolchainMissing(compiler_name.to_string()))?;
        Ok(Self { generator, compiler })
    }

    pub fn allowlist(&self) -> HashSet<PathBuf> {
        [self.generator.clone(), self.compiler.clone()].into_iter().collect()
    }
}

/// Environment variables forwarded to toolchain subprocesses. Everything
/// else from the parent environment is scrubbed, per the "scrubbed
/// environment" security invariant.
const FORWARDED_ENV_VARS: &[&str] = &["PATH", "HOME"];

fn scrubbed_env() -> Vec<(String, String)> {
    FORWARDED_ENV_VARS
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        .collect()
}

/// Output of a single toolchain invocation, truncated to `cap_bytes`.
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub success: bool,
}

/// Run `exe args...` with no shell, a scrubbed environment, and a hard
/// timeout. `exe`'s canonical path must be a member of `allowlist`.
pub async fn run_allowlisted(
    exe: &Path,
    args: &[String],
    allowlist: &HashSet<PathBuf>,
    timeout: Duration,
    cap_bytes: usize,
    pool: &BytePool,
) -> Result<CommandOutput, Error> {
    if !allowlist.contains(exe) {
        return Err(Error::ToolchainMissing(exe.display().to_string()));
    }

    let mut command = tokio::process::Command::new(exe);
    command
        .args(args)
        .env_clear()
        .envs(scrubbed_env())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.group_spawn().map_err(Error::Io)?;
    let mut stdout_pipe = child.inner().stdout.take();
    let mut stderr_pipe = child.inner().stderr.take();

    let read_stdout = async {
        let mut buf = pool.acquire();
        if let Some(mut pipe) = stdout_pipe.take() {
            let _ = read_capped(&mut pipe, &mut buf, cap_bytes).await;
        }
        buf
    };
    let read_stderr = async {
        let mut buf = pool.acquire();
        if let Some(mut pipe) = stderr_pipe.take() {
            let _ = read_capped(&mut pipe, &mut buf, cap_bytes).await;
        }
        buf
    };

    let wait = async { child.wait().await };

    let result = tokio::time::timeout(timeout, async {
        let (stdout, stderr, status) = tokio::join!(read_stdout, read_stderr, wait);
        (stdout, stderr, status)
    })
    .await;

    match result {
        Ok((stdout, stderr, status)) => {
            let status = status.map_err(Error::Io)?;
            Ok(CommandOutput { stdout, stderr, success: status.success() })
        }
        Err(_elapsed) => {
            let _ = child.kill();
            Err(Error::ToolchainTimeout(timeout))
        }
    }
}

async fn read_capped(
    pipe: &mut (impl tokio::io::AsyncRead + Unpin),
    buf: &mut Vec<u8>,
    cap_bytes: usize,
) -> Result<(), std::io::Error> {
    let mut chunk = [0u8; 4096];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if buf.len() < cap_bytes {
            let remaining = cap_bytes - buf.len();
            buf.extend_from_slice(&chunk[..n.min(remaining)]);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrubbed_env_only_forwards_allowlisted_vars() {
        let env = scrubbed_env();
        assert!(env.iter().all(|(k, _)| FORWARDED_ENV_VARS.contains(&k.as_str())));
    }

    #[tokio::test]
    async fn rejects_non_allowlisted_executable() {
        let pool = BytePool::new(1024, 64 * 1024, 4096);
        let allowlist = HashSet::new();
        let result = run_allowlisted(
            Path::new("/bin/echo"),
            &[],
            &allowlist,
            Duration::from_secs(1),
            1024,
            &pool,
        )
        .await;
        assert!(matches!(result, Err(Error::ToolchainMissing(_))));
    }
}
