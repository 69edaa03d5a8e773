use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, TimeZone};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use crate::config::Config;
use crate::process::LaunchSpec;

/// Default timeout for subprocess calls (2 seconds).
const CMD_TIMEOUT: Duration = Duration::from_secs(2);

/// Places tmux is commonly installed when it is not on `PATH`
/// (GUI apps launched outside a login shell get a minimal `PATH`).
const FALLBACK_DIRS: &[&str] = &["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin", "/bin"];

/// Format for `list-sessions`. tmux prints control characters such as tab
/// as `_`, so fields are space separated with the free-text name last.
pub const LIST_SESSIONS_FORMAT: &str =
    "#{session_created} #{session_attached} #{session_windows} #{session_name}";

/// Run a Command with a timeout, returning its Output.
/// On timeout or spawn failure, returns an anyhow error.
pub async fn run_cmd_timeout(cmd: &mut Command) -> Result<std::process::Output> {
    match tokio::time::timeout(CMD_TIMEOUT, cmd.output()).await {
        Ok(result) => result.context("subprocess failed to execute"),
        Err(_) => bail!("subprocess timed out after {}s", CMD_TIMEOUT.as_secs()),
    }
}

/// Run a Command with a timeout, returning its ExitStatus.
/// On timeout or spawn failure, returns an anyhow error.
pub async fn run_status_timeout(cmd: &mut Command) -> Result<std::process::ExitStatus> {
    match tokio::time::timeout(CMD_TIMEOUT, cmd.status()).await {
        Ok(result) => result.context("subprocess failed to execute"),
        Err(_) => bail!("subprocess timed out after {}s", CMD_TIMEOUT.as_secs()),
    }
}

/// A tmux session discovered on the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalSession {
    pub name: String,
    pub created: Option<DateTime<Local>>,
    pub attached: bool,
    pub windows: usize,
}

/// Parse `list-sessions -F` output produced with [`LIST_SESSIONS_FORMAT`].
/// Rows without all four fields are skipped.
pub fn parse_session_list(stdout: &str) -> Vec<ExternalSession> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(4, ' ');
            let created = fields.next()?.parse::<i64>().ok()?;
            let attached = fields.next()?.parse::<u32>().ok()?;
            let windows = fields.next()?.parse().ok()?;
            let name = fields.next()?;
            if name.is_empty() {
                return None;
            }
            Some(ExternalSession {
                name: name.to_string(),
                created: Local.timestamp_opt(created, 0).single(),
                attached: attached > 0,
                windows,
            })
        })
        .collect()
}

/// Parse `show-environment` output. Removed variables (`-NAME`) are skipped.
pub fn parse_environment(stdout: &str) -> HashMap<String, String> {
    stdout
        .lines()
        .filter(|line| !line.starts_with('-'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Quote a string for use as a tmux command argument.
/// Wraps in single quotes and escapes `'` as `'\''` to prevent tmux
/// expanding `$VARS` and `#{formats}` inside the text.
pub fn quote_tmux_arg(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Access to the tmux server: introspection and launch specs for clients.
#[async_trait::async_trait]
pub trait Multiplexer: Send + Sync {
    /// Whether the tmux binary can be launched right now.
    fn is_available(&self) -> bool;

    /// A plain client attached to `session` (created if missing).
    fn attach_spec(
        &self,
        session: &str,
        cwd: &Path,
        shell: &str,
        env: &HashMap<String, String>,
    ) -> Option<LaunchSpec>;

    /// A control-mode client attached to `session` (created if missing).
    fn control_spec(
        &self,
        session: &str,
        cwd: &Path,
        shell: &str,
        env: &HashMap<String, String>,
    ) -> Option<LaunchSpec>;

    async fn list_sessions(&self) -> Result<Vec<ExternalSession>>;
    async fn has_session(&self, name: &str) -> Result<bool>;
    async fn kill_session(&self, name: &str) -> Result<()>;
    async fn set_environment(&self, session: &str, key: &str, value: &str) -> Result<()>;
    async fn show_environment(&self, session: &str) -> Result<HashMap<String, String>>;
}

/// [`Multiplexer`] backed by `tmux` subprocesses.
#[derive(Debug, Clone)]
pub struct TmuxCli {
    binary: Option<PathBuf>,
}

impl TmuxCli {
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self { binary }
    }

    /// Resolve the binary from config, then `PATH`, then common prefixes.
    pub fn detect(config: &Config) -> Self {
        let binary = config
            .tmux_path
            .clone()
            .filter(|p| p.is_file())
            .or_else(find_on_path)
            .or_else(|| {
                FALLBACK_DIRS
                    .iter()
                    .map(|dir| Path::new(dir).join("tmux"))
                    .find(|p| p.is_file())
            });
        match &binary {
            Some(path) => tracing::debug!(tmux = %path.display(), "tmux found"),
            None => tracing::info!("tmux not found; multiplexer backends unavailable"),
        }
        Self { binary }
    }

    pub fn binary(&self) -> Option<&Path> {
        self.binary.as_deref()
    }

    /// A tmux invocation on the same server the launch specs reach: `TMUX`
    /// would otherwise point it at an outer tmux's socket.
    fn command(&self) -> Result<Command> {
        match &self.binary {
            Some(path) => {
                let mut cmd = Command::new(path);
                cmd.env_remove("TMUX");
                Ok(cmd)
            }
            None => bail!("tmux is not installed"),
        }
    }

    /// `tmux -V`, e.g. `tmux 3.4`.
    pub async fn version(&self) -> Result<String> {
        let output = run_cmd_timeout(self.command()?.arg("-V")).await?;
        if !output.status.success() {
            bail!("tmux -V failed");
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn session_args(
        session: &str,
        cwd: &Path,
        shell: &str,
        env: &HashMap<String, String>,
    ) -> Vec<String> {
        let mut args = vec![
            "new-session".to_string(),
            "-A".to_string(),
            "-s".to_string(),
            session.to_string(),
            "-c".to_string(),
            cwd.to_string_lossy().into_owned(),
        ];
        let mut vars: Vec<_> = env.iter().collect();
        vars.sort();
        for (key, value) in vars {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(shell.to_string());
        args
    }
}

fn find_on_path() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join("tmux"))
        .find(|p| p.is_file())
}

/// Exact-match target for a session name (`=name`).
fn exact(name: &str) -> String {
    format!("={name}")
}

#[async_trait::async_trait]
impl Multiplexer for TmuxCli {
    fn is_available(&self) -> bool {
        self.binary.as_ref().is_some_and(|p| p.is_file())
    }

    fn attach_spec(
        &self,
        session: &str,
        cwd: &Path,
        shell: &str,
        env: &HashMap<String, String>,
    ) -> Option<LaunchSpec> {
        let binary = self.binary.as_ref()?;
        Some(
            LaunchSpec::new(binary.to_string_lossy())
                .args(Self::session_args(session, cwd, shell, env))
                .cwd(cwd)
                .env_remove("TMUX"),
        )
    }

    fn control_spec(
        &self,
        session: &str,
        cwd: &Path,
        shell: &str,
        env: &HashMap<String, String>,
    ) -> Option<LaunchSpec> {
        let binary = self.binary.as_ref()?;
        Some(
            LaunchSpec::new(binary.to_string_lossy())
                .arg("-C")
                .args(Self::session_args(session, cwd, shell, env))
                .cwd(cwd)
                .env_remove("TMUX"),
        )
    }

    async fn list_sessions(&self) -> Result<Vec<ExternalSession>> {
        let output =
            run_cmd_timeout(self.command()?.args(["list-sessions", "-F", LIST_SESSIONS_FORMAT]))
                .await?;

        // tmux returns error when no server is running - that's fine, just no sessions
        if !output.status.success() {
            return Ok(vec![]);
        }

        Ok(parse_session_list(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn has_session(&self, name: &str) -> Result<bool> {
        let status =
            run_status_timeout(self.command()?.args(["has-session", "-t", &exact(name)])).await?;
        Ok(status.success())
    }

    async fn kill_session(&self, name: &str) -> Result<()> {
        let status =
            run_status_timeout(self.command()?.args(["kill-session", "-t", &exact(name)]))
                .await
                .context("Failed to kill tmux session")?;

        if !status.success() {
            bail!("tmux kill-session failed for '{name}'");
        }
        Ok(())
    }

    async fn set_environment(&self, session: &str, key: &str, value: &str) -> Result<()> {
        let status = run_status_timeout(self.command()?.args([
            "set-environment",
            "-t",
            &exact(session),
            key,
            value,
        ]))
        .await
        .with_context(|| format!("Failed to set {key}"))?;

        if !status.success() {
            bail!("tmux set-environment {key} failed for '{session}'");
        }
        Ok(())
    }

    async fn show_environment(&self, session: &str) -> Result<HashMap<String, String>> {
        let output =
            run_cmd_timeout(self.command()?.args(["show-environment", "-t", &exact(session)]))
                .await
                .context("Failed to read tmux environment")?;

        if !output.status.success() {
            bail!("tmux show-environment failed for '{session}'");
        }
        Ok(parse_environment(&String::from_utf8_lossy(&output.stdout)))
    }
}
