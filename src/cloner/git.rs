use super::{pick_root, Fetcher};
use crate::error::{CloneError, CloneResult};
use crate::storage::RootId;

use std::path::Path;
use std::process::Output;
use tokio::process::Command;

/// Fetches with the `git` binary as a bare mirror
#[derive(Debug, Clone)]
pub struct GitFetcher {
    git: String,
}

impl Default for GitFetcher {
    fn default() -> Self {
        Self {
            git: "git".to_string(),
        }
    }
}

impl GitFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific git executable
    pub fn with_binary(git: impl Into<String>) -> Self {
        Self { git: git.into() }
    }

    /// Git command with no system/user config and no prompts. The child is
    /// killed if the fetch future is dropped (deadline or abort).
    fn git_command(&self) -> Command {
        let mut cmd = Command::new(&self.git);
        cmd.env("GIT_CONFIG_NOSYSTEM", "1");
        cmd.env("GIT_CONFIG_GLOBAL", "/dev/null");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run(&self, endpoint: &str, mut cmd: Command) -> CloneResult<Output> {
        let output = cmd.output().await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(CloneError::FetchFailed {
                endpoint: endpoint.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait::async_trait]
impl Fetcher for GitFetcher {
    async fn fetch(&self, endpoint: &str, dest: &Path) -> CloneResult<RootId> {
        let mut clone = self.git_command();
        clone
            .args(["clone", "--mirror", "--quiet", "--", endpoint])
            .arg(dest);
        self.run(endpoint, clone).await?;

        let mut roots = self.git_command();
        roots
            .arg("-C")
            .arg(dest)
            .args(["rev-list", "--max-parents=0", "--all"]);
        let output = self.run(endpoint, roots).await?;

        pick_root(endpoint, &String::from_utf8_lossy(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn git_available() -> bool {
        StdCommand::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
            .current_dir(dir)
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("GIT_CONFIG_GLOBAL", "/dev/null")
            .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
            .args(args)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {:?} failed", args);
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    #[tokio::test]
    async fn test_fetch_local_repository() {
        if !git_available() {
            return;
        }

        let upstream = tempfile::tempdir().unwrap();
        git(upstream.path(), &["init", "--quiet"]);
        std::fs::write(upstream.path().join("README"), "hello").unwrap();
        git(upstream.path(), &["add", "README"]);
        git(upstream.path(), &["commit", "--quiet", "-m", "first"]);
        let expected = git(upstream.path(), &["rev-list", "--max-parents=0", "HEAD"]);

        let dest = tempfile::tempdir().unwrap();
        let mirror = dest.path().join("mirror");
        let endpoint = upstream.path().to_str().unwrap();

        let root = GitFetcher::new().fetch(endpoint, &mirror).await.unwrap();
        assert_eq!(root.as_str(), expected);
        assert!(mirror.join("HEAD").exists());
    }

    #[tokio::test]
    async fn test_fetch_empty_repository() {
        if !git_available() {
            return;
        }

        let upstream = tempfile::tempdir().unwrap();
        git(upstream.path(), &["init", "--quiet"]);

        let dest = tempfile::tempdir().unwrap();
        let result = GitFetcher::new()
            .fetch(upstream.path().to_str().unwrap(), &dest.path().join("m"))
            .await;
        assert!(matches!(result, Err(CloneError::EmptyRepository { .. })));
    }

    #[tokio::test]
    async fn test_fetch_missing_repository() {
        if !git_available() {
            return;
        }

        let dest = tempfile::tempdir().unwrap();
        let result = GitFetcher::new()
            .fetch("/nonexistent/repository", &dest.path().join("m"))
            .await;
        assert!(matches!(result, Err(CloneError::FetchFailed { .. })));
    }
}
