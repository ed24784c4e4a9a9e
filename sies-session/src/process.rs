//! The default [`SessionSpawner`](crate::session::SessionSpawner): launches
//! a worker as a real OS subprocess over piped stdio.
//!
//! Grounded in `ahma_http_bridge::session`'s process bring-up (`Command`
//! with piped stdio, `kill_on_drop(true)` so an abandoned child is reaped
//! rather than orphaned) and `ahma_core::shell_pool`'s `PrewarmedShell`
//! spawn path (working directory and environment threaded through a small
//! config struct rather than hardcoded).

use crate::error::SessionError;
use crate::session::SessionSpawner;
use async_trait::async_trait;
use sies_core::{Transport, TransportConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, ChildStdin, Command};

/// The argv/env/cwd a worker subprocess is launched with (spec.md §4.6
/// "Startup: spawn the child process with a configured argv/env").
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub transport: TransportConfig,
}

impl SpawnSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            transport: TransportConfig::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Spawns a worker subprocess and wires its stdin/stdout into a
/// `Transport<ChildStdin>`. Stderr is inherited so worker panics/logs land
/// on the embedding process's own stderr rather than being silently
/// discarded.
pub struct ProcessSpawner {
    spec: SpawnSpec,
}

impl ProcessSpawner {
    pub fn new(spec: SpawnSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl SessionSpawner<ChildStdin> for ProcessSpawner {
    async fn spawn(&self) -> Result<(Transport<ChildStdin>, Option<Child>), SessionError> {
        let mut command = Command::new(&self.spec.program);
        command
            .args(&self.spec.args)
            .envs(&self.spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(SessionError::Spawn)?;
        let stdin = child
            .stdin
            .take()
            .expect("stdin was requested as piped");
        let stdout = child
            .stdout
            .take()
            .expect("stdout was requested as piped");

        let transport = Transport::open(stdout, stdin, self.spec.transport);
        Ok((transport, Some(child)))
    }
}
