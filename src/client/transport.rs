//! Process transport (§2 component 10): spawns the remote shell and
//! exposes its stdio as the duplex byte stream the event loop registers
//! against.
//!
//! A thin owner of a spawned `Child` responsible only for lifecycle
//! (spawn, kill on teardown), handing its piped stdio off to whatever
//! actually drives the read/write loop (the reactor and the ring/frame
//! codec, here).

use crate::error::TransportError;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

/// Owns the spawned remote-shell child process for its lifetime. Killed
/// and reaped on drop so an early session termination never leaves an
/// orphaned `ssh` (or overridden server binary) running.
pub struct ProcessHandle {
    child: Child,
}

impl ProcessHandle {
    pub fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Spawn over `ssh` to `host`, running the server binary remotely.
pub fn spawn_ssh(host: &str, remote_binary: &str) -> Result<(ProcessHandle, ChildStdin, ChildStdout), TransportError> {
    spawn(Command::new("ssh").arg(host).arg(remote_binary))
}

/// Spawn `path` directly, bypassing `ssh` (the `-S` override, used for
/// local testing against a server binary on the same host).
pub fn spawn_override(path: &str) -> Result<(ProcessHandle, ChildStdin, ChildStdout), TransportError> {
    spawn(&mut Command::new(path))
}

fn spawn(command: &mut Command) -> Result<(ProcessHandle, ChildStdin, ChildStdout), TransportError> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(TransportError::Spawn)?;
    let stdin = child.stdin.take().expect("stdin was piped");
    let stdout = child.stdout.take().expect("stdout was piped");
    Ok((ProcessHandle { child }, stdin, stdout))
}
