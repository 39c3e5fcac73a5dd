/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::{Readiness, Redirect, Target},
    transfer::Transfer,
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use colored::Colorize;
use std::{fs::OpenOptions, sync::Arc};
use subprocess::{Exec, NullFile, Popen, Redirection};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Owns the processes of the targets under benchmark.
#[async_trait]
pub trait TargetLifecycle: Send {
    /// Starts every target and waits for it to become ready. A target that fails to start or
    /// never becomes ready is logged and does not stop the others from being started.
    ///
    /// # Returns
    ///
    /// The names of the targets that answered their health check.
    async fn start_all(&mut self, targets: &[Target]) -> anyhow::Result<Vec<String>>;

    /// Stops every started target. Failures are logged, every target is attempted.
    fn stop_all(&mut self);
}

/// A launched target process.
pub trait ManagedProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Terminates the process and waits for it to exit.
    fn terminate(&mut self) -> anyhow::Result<()>;
}

/// Launches the process of a target.
pub trait Spawner: Send + Sync {
    fn spawn(&self, target: &Target) -> anyhow::Result<Box<dyn ManagedProcess>>;
}

/// Runs the given command as a detached process. This function does not block, the returned
/// handle is used to terminate the process later.
///
/// # Arguments
///
/// * command - The command to run.
/// * redirect - Where stdout and stderr of the process go, `.stdout`/`.stderr` files by default.
fn run_command_detached(command: &str, redirect: Option<Redirect>) -> anyhow::Result<Popen> {
    let redirect = redirect.unwrap_or(Redirect::File);

    // break command string into POSIX words
    let words = shlex::split(command)
        .context(format!("Command string is not POSIX compliant: {}", command))?;

    // split command string into command and args
    match &words[..] {
        [command, args @ ..] => {
            let exec = Exec::cmd(command).args(args);

            let exec = match redirect {
                Redirect::Null => exec.stdout(NullFile).stderr(NullFile),
                Redirect::Parent => exec,
                Redirect::File => {
                    let out_file = OpenOptions::new()
                        .append(true)
                        .create(true)
                        .open("./.stdout")?;
                    let err_file = OpenOptions::new()
                        .append(true)
                        .create(true)
                        .open("./.stderr")?;
                    exec.stdout(Redirection::File(out_file))
                        .stderr(Redirection::File(err_file))
                }
            };

            exec.detached().popen().context(format!(
                "Failed to spawn detached process, command: {}",
                command
            ))
        }
        _ => Err(anyhow!("Empty command")),
    }
}

struct SubprocessHandle {
    popen: Popen,
}
impl ManagedProcess for SubprocessHandle {
    fn pid(&self) -> Option<u32> {
        self.popen.pid()
    }

    fn terminate(&mut self) -> anyhow::Result<()> {
        self.popen.kill().context("Failed to kill process")?;
        self.popen
            .wait()
            .context("Failed to wait for process to exit")?;
        Ok(())
    }
}

/// Spawns real OS processes with `subprocess`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubprocessSpawner;
impl Spawner for SubprocessSpawner {
    fn spawn(&self, target: &Target) -> anyhow::Result<Box<dyn ManagedProcess>> {
        let up = target
            .up
            .as_deref()
            .context(format!("Target {} has no up command", target.name))?;

        debug!("Running command {} in detached mode", up);
        let popen = run_command_detached(up, target.redirect)?;
        Ok(Box::new(SubprocessHandle { popen }))
    }
}

/// Polls the health check of a target until it answers or the readiness timeout expires.
pub async fn wait_until_ready(
    transfer: &dyn Transfer,
    target: &Target,
    readiness: &Readiness,
) -> bool {
    let deadline = Instant::now() + readiness.timeout();
    loop {
        if transfer.probe(target).await {
            info!("target {} is ready", target.name);
            return true;
        }

        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(readiness.poll_interval()).await;
    }
}

/// Starts targets with an `up` command as child processes and kills them on `stop_all`.
/// Targets without an `up` command are assumed to be running already and are only probed.
pub struct ProcessLifecycle<S: Spawner = SubprocessSpawner> {
    spawner: S,
    transfer: Arc<dyn Transfer>,
    readiness: Readiness,
    running: Vec<(String, Box<dyn ManagedProcess>)>,
}
impl ProcessLifecycle<SubprocessSpawner> {
    pub fn new(transfer: Arc<dyn Transfer>, readiness: Readiness) -> Self {
        Self::with_spawner(SubprocessSpawner, transfer, readiness)
    }
}
impl<S: Spawner> ProcessLifecycle<S> {
    pub fn with_spawner(spawner: S, transfer: Arc<dyn Transfer>, readiness: Readiness) -> Self {
        Self {
            spawner,
            transfer,
            readiness,
            running: vec![],
        }
    }

    /// Names of the targets whose process is currently running.
    pub fn running(&self) -> Vec<&str> {
        self.running.iter().map(|(name, _)| name.as_str()).collect()
    }
}

#[async_trait]
impl<S: Spawner> TargetLifecycle for ProcessLifecycle<S> {
    async fn start_all(&mut self, targets: &[Target]) -> anyhow::Result<Vec<String>> {
        let mut ready = vec![];

        for target in targets {
            if let Some(up) = &target.up {
                print!("> starting target {}", target.name.green());
                match self.spawner.spawn(target) {
                    Ok(process) => {
                        println!("\t{}", "✓".green());
                        println!("\t{}", format!("- {}", up).bright_black());
                        if let Some(pid) = process.pid() {
                            debug!("target {} running with pid {}", target.name, pid);
                        }
                        self.running.push((target.name.clone(), process));
                    }
                    Err(err) => {
                        println!();
                        error!("Failed to start target {}: {:#}", target.name, err);
                        continue;
                    }
                }
            }

            if wait_until_ready(self.transfer.as_ref(), target, &self.readiness).await {
                ready.push(target.name.clone());
            } else {
                warn!(
                    "Target {} is not available after start (waited {:?})",
                    target.name,
                    self.readiness.timeout()
                );
            }
        }

        Ok(ready)
    }

    fn stop_all(&mut self) {
        for (name, mut process) in self.running.drain(..) {
            print!("> stopping target {}", name.green());
            match process.terminate() {
                Ok(()) => println!("\t{}", "✓".green()),
                Err(err) => {
                    println!();
                    warn!("Failed to stop target {}: {:#}", name, err);
                }
            }
        }
    }
}

impl<S: Spawner> Drop for ProcessLifecycle<S> {
    fn drop(&mut self) {
        if !self.running.is_empty() {
            self.stop_all();
        }
    }
}

/// For targets managed outside the harness: starts and stops nothing, only waits for each
/// target to become ready.
pub struct NoopLifecycle {
    transfer: Arc<dyn Transfer>,
    readiness: Readiness,
}
impl NoopLifecycle {
    pub fn new(transfer: Arc<dyn Transfer>, readiness: Readiness) -> Self {
        Self {
            transfer,
            readiness,
        }
    }
}

#[async_trait]
impl TargetLifecycle for NoopLifecycle {
    async fn start_all(&mut self, targets: &[Target]) -> anyhow::Result<Vec<String>> {
        let mut ready = vec![];
        for target in targets {
            if wait_until_ready(self.transfer.as_ref(), target, &self.readiness).await {
                ready.push(target.name.clone());
            } else {
                warn!("Target {} is not available", target.name);
            }
        }
        Ok(ready)
    }

    fn stop_all(&mut self) {}
}
