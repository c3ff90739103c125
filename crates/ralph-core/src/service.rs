//! Service lifecycle management for runtime verification: starting,
//! health-polling and tearing down backend/frontend dev or prod servers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::{RalphConfig, ServiceConfig};
use crate::timeline::TimelineLogger;

const DEFAULT_HEALTH_TIMEOUT: u64 = 30;
const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_millis(1000);

pub struct ServiceProcess {
    pub name: String,
    child: Child,
    pub port: u16,
    pub pid: u32,
    pub pid_file: PathBuf,
    pub url: String,
    pub started_at: Instant,
}

impl ServiceProcess {
    /// `true` once the process has exited; never blocks.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceResult {
    pub name: String,
    pub success: bool,
    pub port: u16,
    pub url: String,
    pub pid: Option<u32>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Manages the backend/frontend services spawned for runtime verification.
///
/// Cleanup is idempotent and registered once per manager: an explicit
/// `stop_all` call, a SIGINT/SIGTERM (via `run_with_abort`), or the
/// manager simply going out of scope (`_cleanup_guard`, including an
/// unwinding panic) must each leave no orphaned process group behind.
pub struct ServiceManager<'a> {
    config: &'a RalphConfig,
    env: String,
    timeline: Option<&'a TimelineLogger>,
    pids_dir: PathBuf,
    logs_dir: PathBuf,
    services: Arc<Mutex<HashMap<String, ServiceProcess>>>,
    /// At-exit guard: on drop — including an unwinding panic — kills
    /// whatever is listed in `pids/*.pid` synchronously. `stop_all`/
    /// `run_with_abort` already cover the graceful shutdown and signal
    /// paths; this is the backstop for paths that bypass both (a panic
    /// elsewhere in the process while services are up).
    _cleanup_guard: scopeguard::ScopeGuard<PathBuf, fn(PathBuf)>,
}

fn sync_sweep_pid_files(pids_dir: PathBuf) {
    let Ok(entries) = std::fs::read_dir(&pids_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("pid") {
            continue;
        }
        if let Ok(contents) = std::fs::read_to_string(&path) {
            if let Ok(pid) = contents.trim().parse::<i32>() {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{killpg, Signal};
                    use nix::unistd::Pid;
                    let _ = killpg(Pid::from_raw(pid), Signal::SIGTERM);
                    std::thread::sleep(Duration::from_millis(200));
                    let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
                }
            }
        }
        let _ = std::fs::remove_file(&path);
    }
}

impl<'a> ServiceManager<'a> {
    pub fn new(
        config: &'a RalphConfig,
        session_dir: Option<&Path>,
        env: &str,
        timeline: Option<&'a TimelineLogger>,
    ) -> std::io::Result<Self> {
        let session_dir = session_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config.repo_root.join(".ralph-session"));
        let pids_dir = session_dir.join("pids");
        let logs_dir = session_dir.join("logs");
        std::fs::create_dir_all(&pids_dir)?;
        std::fs::create_dir_all(&logs_dir)?;
        let cleanup_guard = scopeguard::guard(pids_dir.clone(), sync_sweep_pid_files as fn(PathBuf));
        Ok(Self {
            config,
            env: env.to_string(),
            timeline,
            pids_dir,
            logs_dir,
            services: Arc::new(Mutex::new(HashMap::new())),
            _cleanup_guard: cleanup_guard,
        })
    }

    fn start_command(&self, service_config: &ServiceConfig, service_type: &str) -> Option<String> {
        let cmd = if service_type == "frontend" {
            if self.env == "dev" {
                service_config.serve_dev.clone()
            } else {
                service_config.serve_prod.clone()
            }
        } else if self.env == "dev" {
            service_config.start_dev.clone()
        } else {
            service_config.start_prod.clone()
        };
        cmd.map(|c| c.replace("{port}", &service_config.port.to_string()))
    }

    fn write_pid_file(&self, name: &str, pid: u32) -> PathBuf {
        let pid_file = self.pids_dir.join(format!("{name}.pid"));
        let _ = std::fs::write(&pid_file, pid.to_string());
        pid_file
    }

    fn remove_pid_file(&self, name: &str) {
        let pid_file = self.pids_dir.join(format!("{name}.pid"));
        let _ = std::fs::remove_file(pid_file);
    }

    async fn check_health(url: &str, endpoints: &[String]) -> bool {
        let endpoints: Vec<String> = if endpoints.is_empty() {
            vec!["/".to_string()]
        } else {
            endpoints.to_vec()
        };
        let client = match reqwest::Client::builder().timeout(Duration::from_secs(5)).build() {
            Ok(c) => c,
            Err(_) => return false,
        };
        for endpoint in &endpoints {
            let check_url = format!("{}/{}", url.trim_end_matches('/'), endpoint.trim_start_matches('/'));
            if let Ok(response) = client.get(&check_url).send().await {
                if response.status().is_success() || response.status().is_redirection() {
                    return true;
                }
            }
        }
        false
    }

    async fn wait_for_health(
        service: &mut ServiceProcess,
        endpoints: &[String],
        timeout: Duration,
    ) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if !service.is_running() {
                return false;
            }
            if Self::check_health(&service.url, endpoints).await {
                return true;
            }
            tokio::time::sleep(DEFAULT_HEALTH_INTERVAL).await;
        }
        false
    }

    pub async fn start_service(&self, name: &str, service_config: &ServiceConfig) -> ServiceResult {
        let start = Instant::now();
        let port = service_config.port;

        if let Some(timeline) = self.timeline {
            timeline.service_start(name, port);
        }

        let Some(cmd) = self.start_command(service_config, name) else {
            let error = format!("No {} start command configured for {name}", self.env);
            if let Some(timeline) = self.timeline {
                timeline.service_failed(name, &error, None);
            }
            return ServiceResult {
                name: name.to_string(),
                success: false,
                port,
                error: Some(error),
                ..Default::default()
            };
        };

        let log_path = self.logs_dir.join(format!("{name}.log"));
        let log_file = match std::fs::File::create(&log_path) {
            Ok(f) => f,
            Err(e) => {
                let error = format!("failed to create log file for {name}: {e}");
                if let Some(timeline) = self.timeline {
                    timeline.service_failed(name, &error, None);
                }
                return ServiceResult {
                    name: name.to_string(),
                    success: false,
                    port,
                    error: Some(error),
                    ..Default::default()
                };
            }
        };
        let log_file_err = log_file.try_clone().expect("clone log file handle");

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&cmd)
            .current_dir(&self.config.repo_root)
            .stdout(log_file)
            .stderr(log_file_err)
            .stdin(std::process::Stdio::null());
        #[cfg(unix)]
        command.process_group(0);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let error = format!("Failed to start {name}: {e}");
                if let Some(timeline) = self.timeline {
                    timeline.service_failed(name, &error, None);
                }
                return ServiceResult {
                    name: name.to_string(),
                    success: false,
                    port,
                    error: Some(error),
                    ..Default::default()
                };
            }
        };

        let pid = child.id().unwrap_or(0);
        let pid_file = self.write_pid_file(name, pid);
        let url = format!("http://localhost:{port}");

        let mut service = ServiceProcess {
            name: name.to_string(),
            child,
            port,
            pid,
            pid_file,
            url: url.clone(),
            started_at: Instant::now(),
        };

        let timeout = Duration::from_secs(if service_config.timeout > 0 {
            service_config.timeout
        } else {
            DEFAULT_HEALTH_TIMEOUT
        });

        if Self::wait_for_health(&mut service, &service_config.health, timeout).await {
            let duration_ms = start.elapsed().as_millis() as u64;
            if let Some(timeline) = self.timeline {
                timeline.service_ready(name, &url, duration_ms);
            }
            self.services.lock().await.insert(name.to_string(), service);
            ServiceResult {
                name: name.to_string(),
                success: true,
                port,
                url,
                pid: Some(pid),
                error: None,
                duration_ms,
            }
        } else {
            Self::stop_process(&mut service, 10).await;
            self.remove_pid_file(name);
            let duration_ms = start.elapsed().as_millis() as u64;
            let error = format!("Health check failed after {}s", timeout.as_secs());
            if let Some(timeline) = self.timeline {
                timeline.service_failed(name, &error, Some(duration_ms));
            }
            ServiceResult {
                name: name.to_string(),
                success: false,
                port,
                error: Some(error),
                duration_ms,
                ..Default::default()
            }
        }
    }

    #[cfg(unix)]
    async fn stop_process(service: &mut ServiceProcess, timeout_secs: u64) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if !service.is_running() {
            return;
        }

        let pgid = Pid::from_raw(service.pid as i32);
        let _ = killpg(pgid, Signal::SIGTERM);

        let waited = tokio::time::timeout(Duration::from_secs(timeout_secs), service.child.wait()).await;
        if waited.is_err() {
            let _ = killpg(pgid, Signal::SIGKILL);
            let _ = tokio::time::timeout(Duration::from_secs(5), service.child.wait()).await;
        }
    }

    #[cfg(not(unix))]
    async fn stop_process(service: &mut ServiceProcess, timeout_secs: u64) {
        if !service.is_running() {
            return;
        }
        let _ = service.child.start_kill();
        let _ = tokio::time::timeout(Duration::from_secs(timeout_secs), service.child.wait()).await;
    }

    /// Races `f` against a shutdown signal. On shutdown, runs `stop_all`
    /// plus the pid-file sweep before returning, so a future cancelled
    /// mid-health-poll can't leave its child process running. Returns
    /// `Ok` with `f`'s output, or `Err(signum)` (2 = SIGINT, 15 = SIGTERM)
    /// if the signal won, along with the conventional `128 + signum`
    /// process exit code the caller should propagate.
    pub async fn run_with_abort<F, T>(&self, f: F) -> Result<T, i32>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::pin!(f);
        let shutdown = wait_for_shutdown_signal();
        tokio::pin!(shutdown);
        tokio::select! {
            biased;
            signum = &mut shutdown => {
                self.stop_all().await;
                self.sweep_pid_files().await;
                Err(signum)
            }
            output = &mut f => Ok(output),
        }
    }

    pub async fn stop_service(&self, name: &str) {
        let mut services = self.services.lock().await;
        if let Some(mut service) = services.remove(name) {
            Self::stop_process(&mut service, 10).await;
            self.remove_pid_file(name);
        }
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = self.services.lock().await.keys().cloned().collect();
        for name in names {
            self.stop_service(&name).await;
        }
    }

    /// Sweeps `pids/*.pid` for processes this manager doesn't currently
    /// have tracked in-memory — e.g. a service still mid health-poll when
    /// an abort signal lands, whose `ServiceProcess` hasn't been inserted
    /// into `self.services` yet. Called in addition to `stop_all` on the
    /// abort path so a cancelled `start_service` future still can't leak
    /// a process group.
    pub async fn sweep_pid_files(&self) {
        let Ok(entries) = std::fs::read_dir(&self.pids_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }
            if let Ok(contents) = std::fs::read_to_string(&path) {
                if let Ok(pid) = contents.trim().parse::<i32>() {
                    kill_pid_group(pid).await;
                }
            }
            let _ = std::fs::remove_file(&path);
        }
    }

    pub async fn start_backend(&self) -> ServiceResult {
        let Some(backend) = &self.config.backend else {
            return ServiceResult {
                name: "backend".to_string(),
                success: false,
                error: Some("No backend service configured".to_string()),
                ..Default::default()
            };
        };
        self.start_service("backend", backend).await
    }

    pub async fn start_frontend(&self, build_first: bool) -> ServiceResult {
        let Some(frontend) = &self.config.frontend else {
            return ServiceResult {
                name: "frontend".to_string(),
                success: false,
                error: Some("No frontend service configured".to_string()),
                ..Default::default()
            };
        };

        if build_first && self.env == "prod" {
            if let Some(build_cmd) = &frontend.build {
                let build_result = ralph_adapters::exec::run_command(
                    ralph_adapters::exec::CommandSpec::Shell(build_cmd.clone()),
                    ralph_adapters::exec::RunCommandOptions {
                        cwd: Some(self.config.repo_root.clone()),
                        timeout: Duration::from_secs(300),
                        ..Default::default()
                    },
                )
                .await;
                if !build_result.success() {
                    let error = build_result
                        .error
                        .clone()
                        .unwrap_or_else(|| build_result.stderr.clone());
                    return ServiceResult {
                        name: "frontend".to_string(),
                        success: false,
                        error: Some(format!("Build failed: {error}")),
                        ..Default::default()
                    };
                }
            }
        }

        self.start_service("frontend", frontend).await
    }

    pub async fn start_all(&self, build_frontend: bool) -> HashMap<String, ServiceResult> {
        let mut results = HashMap::new();
        if self.config.backend.is_some() {
            let backend_result = self.start_backend().await;
            let backend_ok = backend_result.success;
            results.insert("backend".to_string(), backend_result);
            if !backend_ok {
                return results;
            }
        }
        if self.config.frontend.is_some() {
            results.insert("frontend".to_string(), self.start_frontend(build_frontend).await);
        }
        results
    }

    pub async fn get_base_url(&self, prefer_frontend: bool) -> Option<String> {
        let services = self.services.lock().await;
        if prefer_frontend {
            if let Some(frontend) = services.get("frontend") {
                return Some(frontend.url.clone());
            }
        }
        services.get("backend").map(|s| s.url.clone())
    }

    pub async fn is_healthy(&self, name: &str) -> bool {
        let mut services = self.services.lock().await;
        let Some(service) = services.get_mut(name) else {
            return false;
        };
        if !service.is_running() {
            return false;
        }
        let endpoints = match name {
            "backend" => self
                .config
                .backend
                .as_ref()
                .map(|b| b.health.clone())
                .unwrap_or_else(|| vec!["/".to_string()]),
            _ => vec!["/".to_string()],
        };
        Self::check_health(&service.url, &endpoints).await
    }

    pub async fn running_services(&self) -> Vec<String> {
        self.services.lock().await.keys().cloned().collect()
    }
}

#[cfg(unix)]
async fn kill_pid_group(pid: i32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    let _ = killpg(Pid::from_raw(pid), Signal::SIGTERM);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
}

#[cfg(not(unix))]
async fn kill_pid_group(_pid: i32) {}

/// Awaits Ctrl-C or SIGTERM and reports which one fired as a conventional
/// Unix signal number (2, 15). Callers race this against the verified
/// task loop / verify run with `tokio::select!` so that whichever future
/// wins, cleanup still runs before the process exits with `128 + signum`.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> i32 {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => 2,
        _ = sigterm.recv() => 15,
    }
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> i32 {
    let _ = tokio::signal::ctrl_c().await;
    2
}

pub fn create_service_manager<'a>(
    config: &'a RalphConfig,
    session_dir: Option<&Path>,
    env: &str,
    timeline: Option<&'a TimelineLogger>,
) -> std::io::Result<ServiceManager<'a>> {
    ServiceManager::new(config, session_dir, env, timeline)
}

pub fn format_service_status(results: &HashMap<String, ServiceResult>) -> String {
    let mut names: Vec<&String> = results.keys().collect();
    names.sort();
    names
        .into_iter()
        .map(|name| {
            let result = &results[name];
            if result.success {
                format!("  [ok] {name} ready on {} ({}ms)", result.url, result.duration_ms)
            } else {
                format!(
                    "  [fail] {name} failed: {}",
                    result.error.as_deref().unwrap_or("unknown error")
                )
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatesConfig, Limits};
    use std::collections::HashMap as Map;

    fn config(backend: Option<ServiceConfig>, frontend: Option<ServiceConfig>) -> RalphConfig {
        RalphConfig {
            task_source: PathBuf::from("prd.json"),
            gates: GatesConfig::default(),
            agents: Map::new(),
            backend,
            frontend,
            test_paths: vec![],
            limits: Limits::default(),
            ui: None,
            repo_root: PathBuf::from("."),
            path: None,
        }
    }

    #[tokio::test]
    async fn start_backend_without_config_fails_cleanly() {
        let cfg = config(None, None);
        let dir = tempfile::tempdir().unwrap();
        let manager = ServiceManager::new(&cfg, Some(dir.path()), "dev", None).unwrap();
        let result = manager.start_backend().await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("No backend"));
    }

    #[tokio::test]
    async fn start_service_without_start_command_fails() {
        let cfg = config(
            Some(ServiceConfig {
                port: 8080,
                start_dev: None,
                start_prod: None,
                serve_dev: None,
                serve_prod: None,
                build: None,
                health: vec!["/".to_string()],
                timeout: 5,
            }),
            None,
        );
        let dir = tempfile::tempdir().unwrap();
        let manager = ServiceManager::new(&cfg, Some(dir.path()), "dev", None).unwrap();
        let result = manager.start_backend().await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("No dev start command"));
    }

    #[tokio::test]
    async fn spawns_process_and_writes_pid_file_even_if_health_never_comes_up() {
        let cfg = config(
            Some(ServiceConfig {
                port: 9,
                start_dev: Some("sleep 1".to_string()),
                start_prod: None,
                serve_dev: None,
                serve_prod: None,
                build: None,
                health: vec!["/".to_string()],
                timeout: 1,
            }),
            None,
        );
        let dir = tempfile::tempdir().unwrap();
        let manager = ServiceManager::new(&cfg, Some(dir.path()), "dev", None).unwrap();
        let result = manager.start_backend().await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Health check failed"));
        assert!(!dir.path().join("pids/backend.pid").exists());
    }

    #[tokio::test]
    async fn sweep_pid_files_kills_untracked_process_and_removes_pid_file() {
        let cfg = config(None, None);
        let dir = tempfile::tempdir().unwrap();
        let manager = ServiceManager::new(&cfg, Some(dir.path()), "dev", None).unwrap();

        let mut command = tokio::process::Command::new("sleep");
        command.arg("30");
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn().unwrap();
        let pid = child.id().unwrap();
        std::fs::write(dir.path().join("pids/stray.pid"), pid.to_string()).unwrap();

        manager.sweep_pid_files().await;

        assert!(!dir.path().join("pids/stray.pid").exists());
        let exited = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
        assert!(exited.is_ok(), "stray process should have been killed");
    }
}
