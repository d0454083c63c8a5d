pub mod database;

use std::net::SocketAddr;
use std::time::Duration;

use fleet_common::endpoint::{parse_port_list, CandidatePlan, DEFAULT_COMMON_PORTS};
use fleet_common::FleetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallerMode {
    Ssh,
    Demo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMode {
    Http,
    Mock,
}

/// Runtime configuration, read from the environment (a `.env` file is honoured).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub redis_url: Option<String>,
    pub http_addr: SocketAddr,

    // lifecycle monitor
    pub instance_check_interval: Duration,
    pub instance_max_checks: u32,

    // job monitor
    pub job_initial_delay: Duration,
    pub job_poll_interval: Duration,
    pub job_max_polls: u32,
    pub remote_events: bool,

    // discovery
    pub discovery_max_attempts: u32,
    pub discovery_retry_delay: Duration,
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
    pub candidate_plan: CandidatePlan,

    // submission
    pub submit_max_attempts: u32,
    pub submit_retry_delay: Duration,

    pub hub_client_buffer: usize,

    pub installer: InstallerMode,
    pub remote: RemoteMode,
    pub ssh_user: String,
    pub ssh_key_file: Option<String>,
    pub ssh_timeout: Duration,
    pub comfy_repo_url: String,
    pub checkpoint_url: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 5,
            redis_url: None,
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8001)),
            instance_check_interval: Duration::from_secs(30),
            instance_max_checks: 20,
            job_initial_delay: Duration::from_millis(2000),
            job_poll_interval: Duration::from_millis(5000),
            job_max_polls: 60,
            remote_events: true,
            discovery_max_attempts: 3,
            discovery_retry_delay: Duration::from_millis(2000),
            probe_timeout: Duration::from_millis(3000),
            request_timeout: Duration::from_secs(30),
            candidate_plan: CandidatePlan::default(),
            submit_max_attempts: 3,
            submit_retry_delay: Duration::from_millis(1000),
            hub_client_buffer: 64,
            installer: InstallerMode::Ssh,
            remote: RemoteMode::Http,
            ssh_user: "root".to_string(),
            ssh_key_file: None,
            ssh_timeout: Duration::from_secs(1800),
            comfy_repo_url: "https://github.com/comfyanonymous/ComfyUI.git".to_string(),
            checkpoint_url: None,
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_str(key)
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_str(key)
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env_str(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, FleetError> {
        let d = Self::default();

        let http_addr = match env_str("FLEET_HTTP_ADDR") {
            Some(raw) => raw
                .parse::<SocketAddr>()
                .map_err(|e| FleetError::Configuration(format!("FLEET_HTTP_ADDR '{}': {}", raw, e)))?,
            None => d.http_addr,
        };

        let installer = match env_str("INSTALLER").map(|v| v.to_ascii_lowercase()).as_deref() {
            None | Some("ssh") => InstallerMode::Ssh,
            Some("demo") => InstallerMode::Demo,
            Some(other) => {
                return Err(FleetError::Configuration(format!(
                    "INSTALLER must be 'ssh' or 'demo', got '{}'",
                    other
                )))
            }
        };

        let remote = match env_str("FLEET_REMOTE").map(|v| v.to_ascii_lowercase()).as_deref() {
            None | Some("http") => RemoteMode::Http,
            Some("mock") => RemoteMode::Mock,
            Some(other) => {
                return Err(FleetError::Configuration(format!(
                    "FLEET_REMOTE must be 'http' or 'mock', got '{}'",
                    other
                )))
            }
        };

        let candidate_plan = CandidatePlan {
            default_port: env_u32("COMFY_DEFAULT_PORT", d.candidate_plan.default_port),
            offsets: env_u32("DISCOVERY_PORT_OFFSETS", d.candidate_plan.offsets),
            common_ports: parse_port_list(
                env_str("DISCOVERY_EXTRA_PORTS").as_deref(),
                DEFAULT_COMMON_PORTS,
            ),
        };

        Ok(Self {
            database_url: env_str("DATABASE_URL"),
            db_max_connections: env_u32("DB_MAX_CONNECTIONS", d.db_max_connections),
            redis_url: env_str("REDIS_URL"),
            http_addr,
            instance_check_interval: Duration::from_secs(env_u64(
                "INSTANCE_CHECK_INTERVAL_S",
                d.instance_check_interval.as_secs(),
            )),
            instance_max_checks: env_u32("INSTANCE_MAX_CHECKS", d.instance_max_checks),
            job_initial_delay: Duration::from_millis(env_u64(
                "JOB_INITIAL_DELAY_MS",
                d.job_initial_delay.as_millis() as u64,
            )),
            job_poll_interval: Duration::from_millis(env_u64(
                "JOB_POLL_INTERVAL_MS",
                d.job_poll_interval.as_millis() as u64,
            )),
            job_max_polls: env_u32("JOB_MAX_POLLS", d.job_max_polls),
            remote_events: env_bool("REMOTE_EVENTS", d.remote_events),
            discovery_max_attempts: env_u32("DISCOVERY_MAX_ATTEMPTS", d.discovery_max_attempts),
            discovery_retry_delay: Duration::from_millis(env_u64(
                "DISCOVERY_RETRY_DELAY_MS",
                d.discovery_retry_delay.as_millis() as u64,
            )),
            probe_timeout: Duration::from_millis(env_u64(
                "PROBE_TIMEOUT_MS",
                d.probe_timeout.as_millis() as u64,
            )),
            request_timeout: Duration::from_secs(env_u64(
                "REMOTE_REQUEST_TIMEOUT_S",
                d.request_timeout.as_secs(),
            )),
            candidate_plan,
            submit_max_attempts: env_u32("SUBMIT_MAX_ATTEMPTS", d.submit_max_attempts),
            submit_retry_delay: Duration::from_millis(env_u64(
                "SUBMIT_RETRY_DELAY_MS",
                d.submit_retry_delay.as_millis() as u64,
            )),
            hub_client_buffer: env_u64("HUB_CLIENT_BUFFER", d.hub_client_buffer as u64) as usize,
            installer,
            remote,
            ssh_user: env_str("WORKER_SSH_USER").unwrap_or(d.ssh_user),
            ssh_key_file: env_str("WORKER_SSH_PRIVATE_KEY_FILE"),
            ssh_timeout: Duration::from_secs(env_u64(
                "WORKER_SSH_BOOTSTRAP_TIMEOUT_S",
                d.ssh_timeout.as_secs(),
            )),
            comfy_repo_url: env_str("COMFY_REPO_URL").unwrap_or(d.comfy_repo_url),
            checkpoint_url: env_str("COMFY_CHECKPOINT_URL"),
        })
    }
}
