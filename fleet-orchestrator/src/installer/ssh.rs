use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_common::endpoint::clean_host;
use fleet_common::error::Result;
use fleet_common::{FleetError, Instance};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use uuid::Uuid;

use super::InstallationExecutor;
use crate::config::OrchestratorConfig;
use crate::logger::{self, Subject};
use crate::progress_hub::ProgressHub;
use crate::state_machine;
use crate::store::RecordStore;

/// Phases announced by the bootstrap script, in order.
pub const PHASES: &[&str] = &[
    "start",
    "system_deps",
    "clone",
    "python_env",
    "pip_install",
    "checkpoint",
    "service_start",
    "health_wait",
    "done",
];

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub user: String,
    pub key_file: Option<String>,
    pub timeout: Duration,
    pub service_port: u32,
    pub repo_url: String,
    pub checkpoint_url: Option<String>,
}

impl SshSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            user: config.ssh_user.clone(),
            key_file: config.ssh_key_file.clone(),
            timeout: config.ssh_timeout,
            service_port: config.candidate_plan.default_port,
            repo_url: config.comfy_repo_url.clone(),
            checkpoint_url: config.checkpoint_url.clone(),
        }
    }
}

/// Installs the generation service over `ssh` with a phased bash bootstrap.
pub struct SshInstaller {
    store: Arc<dyn RecordStore>,
    hub: Arc<ProgressHub>,
    settings: SshSettings,
}

fn tail_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars()
        .rev()
        .take(max_chars)
        .collect::<String>()
        .chars()
        .rev()
        .collect()
}

/// `::phase::<name>` marker on a stdout line.
fn phase_marker(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix("::phase::")
        .map(|rest| rest.trim())
        .filter(|name| !name.is_empty())
}

fn phase_step(name: &str) -> u32 {
    PHASES
        .iter()
        .position(|p| *p == name)
        .map(|i| i as u32 + 1)
        .unwrap_or(0)
}

fn sh_escape_single(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

fn bootstrap_script(instance_id: Uuid, settings: &SshSettings) -> String {
    format!(
        r#"#!/usr/bin/env bash
set -euo pipefail
export DEBIAN_FRONTEND=noninteractive

INSTANCE_ID={instance_id}
COMFY_REPO={repo}
COMFY_DIR=/opt/comfyui
COMFY_PORT={port}
CHECKPOINT_URL={checkpoint}

echo "::phase::start"
echo "[fleet] bootstrap starting for $INSTANCE_ID"

echo "::phase::system_deps"
if command -v apt-get >/dev/null 2>&1; then
  apt-get update -y
  apt-get install -y git python3 python3-venv python3-pip curl
fi

echo "::phase::clone"
if [ ! -d "$COMFY_DIR/.git" ]; then
  git clone --depth 1 "$COMFY_REPO" "$COMFY_DIR"
fi

echo "::phase::python_env"
if [ ! -x "$COMFY_DIR/venv/bin/python" ]; then
  python3 -m venv "$COMFY_DIR/venv"
fi

echo "::phase::pip_install"
"$COMFY_DIR/venv/bin/pip" install --upgrade pip
"$COMFY_DIR/venv/bin/pip" install -r "$COMFY_DIR/requirements.txt"

echo "::phase::checkpoint"
if [ -n "$CHECKPOINT_URL" ]; then
  mkdir -p "$COMFY_DIR/models/checkpoints"
  curl -fL --retry 3 -o "$COMFY_DIR/models/checkpoints/$(basename "$CHECKPOINT_URL")" "$CHECKPOINT_URL"
fi

echo "::phase::service_start"
if ! curl -fsS "http://127.0.0.1:$COMFY_PORT/system_stats" >/dev/null 2>&1; then
  cd "$COMFY_DIR"
  nohup "$COMFY_DIR/venv/bin/python" main.py --listen 0.0.0.0 --port "$COMFY_PORT" \
    > /var/log/comfyui.log 2>&1 &
fi

echo "::phase::health_wait"
for i in $(seq 1 150); do
  if curl -fsS "http://127.0.0.1:$COMFY_PORT/system_stats" >/dev/null 2>&1; then
    break
  fi
  if [ "$i" -eq 150 ]; then
    echo "service did not become healthy" >&2
    tail -n 100 /var/log/comfyui.log >&2 || true
    exit 1
  fi
  sleep 2
done

echo "::phase::done"
echo "[fleet] bootstrap done"
"#,
        instance_id = sh_escape_single(&instance_id.to_string()),
        repo = sh_escape_single(&settings.repo_url),
        port = settings.service_port,
        checkpoint = sh_escape_single(settings.checkpoint_url.as_deref().unwrap_or("")),
    )
}

impl SshInstaller {
    pub fn new(store: Arc<dyn RecordStore>, hub: Arc<ProgressHub>, settings: SshSettings) -> Self {
        Self {
            store,
            hub,
            settings,
        }
    }

    /// Runs the bootstrap to completion and reports the outcome into the store.
    #[allow(clippy::too_many_arguments)]
    async fn run_bootstrap(
        store: Arc<dyn RecordStore>,
        hub: Arc<ProgressHub>,
        settings: SshSettings,
        instance_id: Uuid,
        host: String,
        ssh_port: u16,
        key_file: String,
        execution_id: String,
    ) {
        let target = format!("{}@{}", settings.user, host.trim_start_matches('[').trim_end_matches(']'));
        let mut meta = serde_json::json!({
            "execution_id": execution_id,
            "host": host,
            "ssh_user": settings.user,
            "ssh_port": ssh_port,
            "ssh_key_path": key_file,
            "ssh_timeout_s": settings.timeout.as_secs(),
            "has_checkpoint_url": settings.checkpoint_url.is_some(),
        });

        match state_machine::instance_running_to_configuring(store.as_ref(), instance_id, "ssh bootstrap").await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                "ssh install: instance {} was not running, status left as is",
                instance_id
            ),
            Err(e) => tracing::error!(
                "ssh install: could not mark instance {} configuring: {}",
                instance_id,
                e
            ),
        }

        let log_id = logger::log_event_with_metadata(
            store.as_ref(),
            "SERVICE_SSH_INSTALL",
            "in_progress",
            Subject::instance(instance_id),
            None,
            Some(meta.clone()),
        )
        .await
        .ok();

        let started = std::time::Instant::now();
        let outcome = Self::execute(&hub, &settings, instance_id, &target, ssh_port, &key_file).await;
        let dur = logger::elapsed_ms(started);

        let (ok, error) = match &outcome {
            Ok(run) => {
                if let serde_json::Value::Object(ref mut obj) = meta {
                    obj.insert("ssh_exit_success".to_string(), serde_json::json!(run.success));
                    obj.insert("ssh_exit_status".to_string(), serde_json::json!(run.exit_status));
                    obj.insert("ssh_stdout_tail".to_string(), serde_json::json!(tail_str(&run.stdout, 8000)));
                    obj.insert("ssh_stderr_tail".to_string(), serde_json::json!(tail_str(&run.stderr, 8000)));
                    obj.insert("phases".to_string(), serde_json::json!(run.phases));
                    if let Some(p) = run.phases.last() {
                        obj.insert("last_phase".to_string(), serde_json::json!(p));
                    }
                }
                if run.success {
                    (true, None)
                } else {
                    (
                        false,
                        Some(format!(
                            "ssh bootstrap failed (exit={}): {}",
                            run.exit_status,
                            tail_str(&run.stderr, 2000)
                        )),
                    )
                }
            }
            Err(e) => (false, Some(e.to_string())),
        };

        if let Some(lid) = log_id {
            let status = if ok { "success" } else { "failed" };
            let _ = logger::log_event_complete_with_metadata(
                store.as_ref(),
                lid,
                status,
                dur,
                error.as_deref(),
                Some(meta),
            )
            .await;
        }

        Self::record_outcome(store.as_ref(), &hub, instance_id, error).await;
    }

    /// Store the install result. The instance goes back to running only if nothing
    /// else changed its status while the script ran.
    async fn record_outcome(
        store: &dyn RecordStore,
        hub: &ProgressHub,
        instance_id: Uuid,
        error: Option<String>,
    ) {
        match state_machine::instance_configuring_to_running(store, instance_id, "ssh bootstrap finished").await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                "ssh install: instance {} changed status during install, not resetting to running",
                instance_id
            ),
            Err(e) => tracing::error!(
                "ssh install: could not restore running status for instance {}: {}",
                instance_id,
                e
            ),
        }

        let result = match error {
            None => {
                hub.publish_setup_progress(
                    instance_id,
                    PHASES.len() as u32,
                    PHASES.len() as u32,
                    "service ready",
                )
                .await;
                state_machine::setup_installing_to_ready(store, instance_id, "ssh bootstrap done").await
            }
            Some(err) => {
                tracing::error!("❌ ssh install failed for instance {}: {}", instance_id, err);
                state_machine::setup_installing_to_failed(store, instance_id, &err).await
            }
        };
        if let Err(e) = result {
            tracing::error!(
                "ssh install: could not record outcome for instance {}: {}",
                instance_id,
                e
            );
        }
    }

    async fn execute(
        hub: &ProgressHub,
        settings: &SshSettings,
        instance_id: Uuid,
        target: &str,
        ssh_port: u16,
        key_file: &str,
    ) -> std::result::Result<SshRun, FleetError> {
        let script = bootstrap_script(instance_id, settings);

        let mut child = Command::new("ssh")
            .arg("-i")
            .arg(key_file)
            .arg("-p")
            .arg(ssh_port.to_string())
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("ConnectTimeout=10")
            .arg(target)
            .arg("bash -s")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FleetError::TransientNetwork(format!("ssh spawn failed: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(|e| FleetError::TransientNetwork(format!("ssh stdin failed: {}", e)))?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FleetError::TransientNetwork("ssh stdout unavailable".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| FleetError::TransientNetwork("ssh stderr unavailable".into()))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).to_string()
        });

        let total = PHASES.len() as u32;
        let run = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut collected = String::new();
            let mut phases = Vec::new();
            while let Some(line) = lines.next_line().await? {
                if let Some(name) = phase_marker(&line) {
                    tracing::info!("🛠️  instance {} install phase: {}", instance_id, name);
                    hub.publish_setup_progress(instance_id, phase_step(name), total, name)
                        .await;
                    phases.push(name.to_string());
                }
                collected.push_str(&line);
                collected.push('\n');
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, collected, phases))
        };

        let outcome = tokio::time::timeout(settings.timeout, run).await;
        match outcome {
            Ok(Ok((status, stdout, phases))) => {
                let stderr = stderr_task.await.unwrap_or_default();
                Ok(SshRun {
                    success: status.success(),
                    exit_status: status.to_string(),
                    stdout,
                    stderr,
                    phases,
                })
            }
            Ok(Err(e)) => Err(FleetError::TransientNetwork(format!("ssh wait failed: {}", e))),
            Err(_) => {
                let _ = child.kill().await;
                Err(FleetError::Timeout(format!(
                    "ssh bootstrap timed out after {}s",
                    settings.timeout.as_secs()
                )))
            }
        }
    }
}

struct SshRun {
    success: bool,
    exit_status: String,
    stdout: String,
    stderr: String,
    phases: Vec<String>,
}

#[async_trait]
impl InstallationExecutor for SshInstaller {
    async fn trigger_installation(&self, instance: &Instance) -> Result<String> {
        let raw_host = instance.host.as_deref().unwrap_or("");
        let host = clean_host(raw_host).ok_or_else(|| {
            FleetError::Configuration(format!(
                "instance {} has no usable host for ssh (got '{}')",
                instance.id, raw_host
            ))
        })?;
        let key_file = self
            .settings
            .key_file
            .clone()
            .ok_or_else(|| FleetError::Configuration("WORKER_SSH_PRIVATE_KEY_FILE is not set".into()))?;
        if tokio::fs::metadata(&key_file).await.is_err() {
            return Err(FleetError::Configuration(format!(
                "ssh private key '{}' is not readable",
                key_file
            )));
        }

        let execution_id = format!("ssh-{}", Uuid::new_v4());
        tracing::info!(
            "🚀 ssh install {} started for instance {} ({})",
            execution_id,
            instance.id,
            host
        );
        tokio::spawn(Self::run_bootstrap(
            self.store.clone(),
            self.hub.clone(),
            self.settings.clone(),
            instance.id,
            host,
            instance.ssh_port(),
            key_file,
            execution_id.clone(),
        ));
        Ok(execution_id)
    }
}
