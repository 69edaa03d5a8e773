//! In-memory stand-ins used by unit tests.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::process::LaunchSpec;
use crate::tmux::{parse_session_list, ExternalSession, Multiplexer};

type Sessions = Arc<Mutex<BTreeMap<String, HashMap<String, String>>>>;

/// How long a launched client takes to create its session.
const CREATE_DELAY: Duration = Duration::from_millis(20);

/// Speaks just enough control mode: the startup block, then an empty
/// `%begin`/`%end` reply per command line until stdin closes.
pub(crate) const FAKE_CONTROL_SCRIPT: &str = "printf '%%begin 0 0 0\\n%%end 0 0 0\\n'; n=0; \
     while IFS= read -r line; do n=$((n+1)); \
     printf '%%begin 1 %d 1\\n%%end 1 %d 1\\n' \"$n\" \"$n\"; done";

/// A tmux server that lives in a map. Attach clients are `cat`, control
/// clients run [`FAKE_CONTROL_SCRIPT`]. Like `new-session -A`, a launch
/// creates its session shortly after the client starts, not before.
pub(crate) struct FakeMux {
    available: AtomicBool,
    sessions: Sessions,
    failing_keys: Mutex<HashSet<String>>,
    launches: Mutex<Vec<String>>,
    stall_listing: AtomicBool,
    stall_control: AtomicBool,
}

impl FakeMux {
    pub(crate) fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            sessions: Arc::new(Mutex::new(BTreeMap::new())),
            failing_keys: Mutex::new(HashSet::new()),
            launches: Mutex::new(Vec::new()),
            stall_listing: AtomicBool::new(false),
            stall_control: AtomicBool::new(false),
        }
    }

    pub(crate) fn unavailable() -> Self {
        let mux = Self::new();
        mux.available.store(false, Ordering::SeqCst);
        mux
    }

    pub(crate) fn add_session(&self, name: &str) {
        self.sessions.lock().entry(name.to_string()).or_default();
    }

    pub(crate) fn add_session_with_env(&self, name: &str, env: &[(&str, String)]) {
        let mut sessions = self.sessions.lock();
        let vars = sessions.entry(name.to_string()).or_default();
        for (k, v) in env {
            vars.insert(k.to_string(), v.clone());
        }
    }

    /// Create `name` after `delay`, from a background task.
    pub(crate) fn add_session_later(&self, name: &str, delay: Duration) {
        create_later(self.sessions.clone(), name, HashMap::new(), delay);
    }

    pub(crate) fn has(&self, name: &str) -> bool {
        self.sessions.lock().contains_key(name)
    }

    pub(crate) fn env(&self, name: &str) -> HashMap<String, String> {
        self.sessions.lock().get(name).cloned().unwrap_or_default()
    }

    pub(crate) fn fail_key(&self, key: &str) {
        self.failing_keys.lock().insert(key.to_string());
    }

    /// Make `list_sessions` hang, like a wedged tmux server.
    pub(crate) fn stall_listing(&self) {
        self.stall_listing.store(true, Ordering::SeqCst);
    }

    /// Make control clients start but never answer, like a hung server.
    pub(crate) fn stall_control(&self) {
        self.stall_control.store(true, Ordering::SeqCst);
    }

    /// Session names passed to `attach_spec`/`control_spec`, in order.
    pub(crate) fn launches(&self) -> Vec<String> {
        self.launches.lock().clone()
    }

    fn launch(&self, session: &str, env: &HashMap<String, String>) {
        self.launches.lock().push(session.to_string());
        create_later(self.sessions.clone(), session, env.clone(), CREATE_DELAY);
    }
}

fn create_later(sessions: Sessions, name: &str, env: HashMap<String, String>, delay: Duration) {
    let name = name.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        sessions.lock().entry(name).or_default().extend(env);
    });
}

#[async_trait::async_trait]
impl Multiplexer for FakeMux {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn attach_spec(
        &self,
        session: &str,
        _cwd: &Path,
        _shell: &str,
        env: &HashMap<String, String>,
    ) -> Option<LaunchSpec> {
        if !self.is_available() {
            return None;
        }
        self.launch(session, env);
        Some(LaunchSpec::new("/bin/sh").args(["-c", "cat"]))
    }

    fn control_spec(
        &self,
        session: &str,
        _cwd: &Path,
        _shell: &str,
        env: &HashMap<String, String>,
    ) -> Option<LaunchSpec> {
        if !self.is_available() {
            return None;
        }
        self.launch(session, env);
        let script = if self.stall_control.load(Ordering::SeqCst) {
            "sleep 30"
        } else {
            FAKE_CONTROL_SCRIPT
        };
        Some(LaunchSpec::new("/bin/sh").args(["-c", script]))
    }

    async fn list_sessions(&self) -> Result<Vec<ExternalSession>> {
        if !self.is_available() {
            bail!("tmux is not installed");
        }
        if self.stall_listing.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        // Rendered the way `list-sessions -F` prints them.
        let listing: String = self
            .sessions
            .lock()
            .keys()
            .map(|name| format!("1700000000 0 1 {name}\n"))
            .collect();
        Ok(parse_session_list(&listing))
    }

    async fn has_session(&self, name: &str) -> Result<bool> {
        Ok(self.has(name))
    }

    async fn kill_session(&self, name: &str) -> Result<()> {
        if self.sessions.lock().remove(name).is_none() {
            bail!("can't find session: {name}");
        }
        Ok(())
    }

    async fn set_environment(&self, session: &str, key: &str, value: &str) -> Result<()> {
        if self.failing_keys.lock().contains(key) {
            bail!("set-environment {key} rejected");
        }
        match self.sessions.lock().get_mut(session) {
            Some(vars) => {
                vars.insert(key.to_string(), value.to_string());
                Ok(())
            }
            None => bail!("can't find session: {session}"),
        }
    }

    async fn show_environment(&self, session: &str) -> Result<HashMap<String, String>> {
        match self.sessions.lock().get(session) {
            Some(vars) => Ok(vars.clone()),
            None => bail!("can't find session: {session}"),
        }
    }
}
