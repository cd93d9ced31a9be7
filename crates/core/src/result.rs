// SPDX-License-Identifier: MIT

//! Outcome types for a deployment attempt: `ServiceDeployment` per component,
//! `DeploymentResult` as the aggregate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which class of service a [`ServiceDeployment`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Native,
    Container,
    Firmware,
    Assets,
}

/// Result of attempting to deploy one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDeployment {
    pub service_name: String,
    pub service_kind: ServiceKind,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ServiceDeployment {
    pub fn ok(service_name: impl Into<String>, kind: ServiceKind) -> Self {
        Self {
            service_name: service_name.into(),
            service_kind: kind,
            success: true,
            error_message: None,
        }
    }

    pub fn failed(service_name: impl Into<String>, kind: ServiceKind, error: impl ToString) -> Self {
        Self {
            service_name: service_name.into(),
            service_kind: kind,
            success: false,
            error_message: Some(error.to_string()),
        }
    }
}

/// Aggregate outcome of a `Deploy`/`HardUpdate` run.
///
/// `success` is true whenever at least one requested service succeeded, or
/// there were no requested services at all (the "nothing to do" case).
/// `deployed` is true iff at least one artifact or file was actually
/// replaced on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub success: bool,
    pub deployed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_after: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceDeployment>,
    #[serde(default)]
    pub firmware_deployed: bool,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl DeploymentResult {
    /// Nothing needed deploying: no git changes, no new artifact.
    pub fn no_op(duration: Duration) -> Self {
        Self {
            success: true,
            deployed: false,
            duration,
            ..Default::default()
        }
    }

    /// Fold the per-service outcomes into `success`/`deployed`/`error_message`:
    /// partial success is success iff at least one sub-deployment succeeded
    /// (or there were none to begin with).
    pub fn finalize(mut self) -> Self {
        let any_success = self.services.iter().any(|s| s.success);
        let any_requested = !self.services.is_empty();
        self.success = any_success || !any_requested;
        self.deployed = self.deployed || self.services.iter().any(|s| s.success);

        let failures: Vec<String> = self
            .services
            .iter()
            .filter(|s| !s.success)
            .map(|s| {
                format!(
                    "{}: {}",
                    s.service_name,
                    s.error_message.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();
        if !failures.is_empty() {
            self.error_message = Some(failures.join("; "));
        }
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u128(d.as_millis())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
