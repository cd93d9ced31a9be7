// SPDX-License-Identifier: MIT

//! Drives the OS service supervisor and HTTP health probes.

use sentinel_exec::CommandRunner;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to restart {service}: {detail}")]
    Restart { service: String, detail: String },
    #[error("failed to start {service}: {detail}")]
    Start { service: String, detail: String },
    #[error("failed to stop {service}: {detail}")]
    Stop { service: String, detail: String },
}

#[derive(Debug, Error)]
pub enum HealthCheckError {
    #[error("invalid health check URL `{0}`")]
    InvalidUrl(String),
    #[error("endpoint did not return 2xx within {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Drives `systemctl` (via privilege escalation for mutating verbs) and
/// performs HTTP health probes.
#[derive(Clone)]
pub struct ServiceManager {
    exec: CommandRunner,
    http: reqwest::Client,
    /// Command used for privilege escalation (e.g. `sudo`); empty disables it.
    escalation: Vec<String>,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self {
            exec: CommandRunner::new(),
            http: reqwest::Client::new(),
            escalation: vec!["sudo".to_string(), "-n".to_string()],
        }
    }

    /// Disable privilege escalation (e.g. in tests or rootless environments).
    pub fn without_escalation(mut self) -> Self {
        self.escalation.clear();
        self
    }

    async fn systemctl(&self, args: &[&str]) -> Result<String, String> {
        let program = self.escalation.first().map_or("systemctl", String::as_str);
        let mut rest: Vec<&str> = self.escalation.iter().skip(1).map(String::as_str).collect();
        if !self.escalation.is_empty() {
            rest.push("systemctl");
        }
        rest.extend_from_slice(args);
        self.exec
            .run(program, &rest, None)
            .await
            .map(|out| out.stdout)
            .map_err(|e| format!("{}{}", e, {
                let stderr = e.stderr();
                if stderr.is_empty() {
                    String::new()
                } else {
                    format!(" (stderr: {stderr})")
                }
            }))
    }

    pub async fn restart(&self, service: &str) -> Result<(), ServiceError> {
        info!(service, "restarting service");
        self.systemctl(&["restart", service])
            .await
            .map(|_| ())
            .map_err(|detail| ServiceError::Restart {
                service: service.to_string(),
                detail,
            })
    }

    pub async fn start(&self, service: &str) -> Result<(), ServiceError> {
        info!(service, "starting service");
        self.systemctl(&["start", service])
            .await
            .map(|_| ())
            .map_err(|detail| ServiceError::Start {
                service: service.to_string(),
                detail,
            })
    }

    pub async fn stop(&self, service: &str) -> Result<(), ServiceError> {
        info!(service, "stopping service");
        self.systemctl(&["stop", service])
            .await
            .map(|_| ())
            .map_err(|detail| ServiceError::Stop {
                service: service.to_string(),
                detail,
            })
    }

    /// `systemctl is-active <service>`'s verbatim token.
    pub async fn status(&self, service: &str) -> String {
        self.exec
            .run("systemctl", &["is-active", service], None)
            .await
            .map(|out| out.stdout.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Restart every listed service in parallel, one task each, returning a
    /// map of only the services that failed.
    pub async fn restart_many(&self, services: &[String]) -> HashMap<String, ServiceError> {
        let mut handles = Vec::with_capacity(services.len());
        for service in services {
            let service = service.clone();
            let manager = self.clone();
            handles.push(tokio::spawn(async move {
                let result = manager.restart(&service).await;
                (service, result)
            }));
        }

        let mut failures = HashMap::new();
        for handle in handles {
            if let Ok((service, Err(e))) = handle.await {
                failures.insert(service, e);
            }
        }
        failures
    }

    /// GET `url` up to `max_attempts` times, sleeping 1s between attempts;
    /// any 2xx response counts as success. A malformed URL fails fast
    /// without retrying.
    pub async fn check_health(
        &self,
        url: &str,
        max_attempts: u32,
        timeout: Duration,
    ) -> Result<(), HealthCheckError> {
        let parsed = reqwest::Url::parse(url).map_err(|_| HealthCheckError::InvalidUrl(url.to_string()))?;

        let mut last_error = String::new();
        for attempt in 1..=max_attempts.max(1) {
            match self
                .http
                .get(parsed.clone())
                .timeout(timeout)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => last_error = format!("status {}", response.status()),
                Err(e) => last_error = e.to_string(),
            }

            if attempt < max_attempts {
                warn!(url, attempt, "health check attempt failed, retrying");
                tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;
            }
        }

        Err(HealthCheckError::Exhausted {
            attempts: max_attempts.max(1),
            last_error,
        })
    }
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}
