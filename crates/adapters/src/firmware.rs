// SPDX-License-Identifier: MIT

//! Compile and upload a microcontroller sketch via `arduino-cli` (spec
//! §4.7, FirmwareDeployer half).

use sentinel_exec::{CommandRunner, ExecError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("arduino-cli is not available and could not be installed: {0}")]
    CliUnavailable(#[source] ExecError),
    #[error("failed to install required platform `{platform}`: {source}")]
    PlatformInstall {
        platform: String,
        #[source]
        source: ExecError,
    },
    #[error("failed to compile sketch {sketch}: {source}")]
    Compile {
        sketch: PathBuf,
        #[source]
        source: ExecError,
    },
    #[error("failed to upload sketch {sketch} to {port}: {source}")]
    Upload {
        sketch: PathBuf,
        port: String,
        #[source]
        source: ExecError,
    },
}

/// Outcome of a firmware deployment: upload may legitimately be skipped
/// when no serial port is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareOutcome {
    CompiledAndUploaded { port: String },
    CompiledNoPortFound,
}

const LIBRARIES: &[&str] = &["ArduinoJson", "Adafruit NeoPixel", "PubSubClient"];

const SERIAL_PORT_CANDIDATES: &[&str] = &[
    "/dev/ttyACM0",
    "/dev/ttyACM1",
    "/dev/ttyUSB0",
    "/dev/ttyUSB1",
];

/// Drives `arduino-cli` for a single fixed board identifier.
#[derive(Clone)]
pub struct FirmwareDeployer {
    exec: CommandRunner,
    board_fqbn: String,
}

impl FirmwareDeployer {
    pub fn new(board_fqbn: impl Into<String>) -> Self {
        Self {
            exec: CommandRunner::new(),
            board_fqbn: board_fqbn.into(),
        }
    }

    async fn ensure_cli_installed(&self) -> Result<(), FirmwareError> {
        if self.exec.run("arduino-cli", &["version"], None).await.is_ok() {
            return Ok(());
        }

        warn!("arduino-cli not found, attempting best-effort install");
        self.exec
            .run("sh", &["-c", "curl -fsSL https://raw.githubusercontent.com/arduino/arduino-cli/master/install.sh | sh"], None)
            .await
            .map_err(FirmwareError::CliUnavailable)?;
        Ok(())
    }

    async fn update_index(&self) {
        if let Err(e) = self.exec.run("arduino-cli", &["core", "update-index"], None).await {
            warn!(error = %e, "failed to update arduino-cli core index, continuing");
        }
    }

    async fn install_platform(&self, platform: &str) -> Result<(), FirmwareError> {
        self.exec
            .run("arduino-cli", &["core", "install", platform], None)
            .await
            .map(|_| ())
            .map_err(|source| FirmwareError::PlatformInstall {
                platform: platform.to_string(),
                source,
            })
    }

    async fn install_libraries(&self) {
        for library in LIBRARIES {
            if let Err(e) = self
                .exec
                .run("arduino-cli", &["lib", "install", library], None)
                .await
            {
                warn!(library, error = %e, "failed to install library, continuing");
            }
        }
    }

    async fn compile(&self, sketch: &Path) -> Result<(), FirmwareError> {
        let sketch_str = sketch.to_string_lossy().into_owned();
        self.exec
            .run(
                "arduino-cli",
                &["compile", "--fqbn", &self.board_fqbn, &sketch_str],
                None,
            )
            .await
            .map(|_| ())
            .map_err(|source| FirmwareError::Compile {
                sketch: sketch.to_path_buf(),
                source,
            })
    }

    /// First existing candidate wins; `None` if no serial device is attached.
    async fn detect_serial_port(&self) -> Option<String> {
        for candidate in SERIAL_PORT_CANDIDATES {
            if tokio::fs::try_exists(candidate).await.unwrap_or(false) {
                return Some(candidate.to_string());
            }
        }
        None
    }

    async fn upload(&self, sketch: &Path, port: &str) -> Result<(), FirmwareError> {
        let sketch_str = sketch.to_string_lossy().into_owned();
        self.exec
            .run(
                "arduino-cli",
                &["upload", "-p", port, "--fqbn", &self.board_fqbn, &sketch_str],
                None,
            )
            .await
            .map(|_| ())
            .map_err(|source| FirmwareError::Upload {
                sketch: sketch.to_path_buf(),
                port: port.to_string(),
                source,
            })
    }

    /// Full pipeline: install the CLI if absent, refresh the index,
    /// install the required platform (fatal), install optional libraries
    /// (best-effort), compile (fatal), find a serial port and upload if one
    /// exists.
    pub async fn deploy(
        &self,
        sketch: &Path,
        platform: &str,
    ) -> Result<FirmwareOutcome, FirmwareError> {
        self.ensure_cli_installed().await?;
        self.update_index().await;
        self.install_platform(platform).await?;
        self.install_libraries().await;

        info!(sketch = %sketch.display(), fqbn = %self.board_fqbn, "compiling sketch");
        self.compile(sketch).await?;

        match self.detect_serial_port().await {
            Some(port) => {
                info!(port, "uploading sketch");
                self.upload(sketch, &port).await?;
                Ok(FirmwareOutcome::CompiledAndUploaded { port })
            }
            None => {
                warn!("no serial port found, sketch compiled but not uploaded");
                Ok(FirmwareOutcome::CompiledNoPortFound)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_port_candidates_are_checked_in_fixed_order() {
        assert_eq!(SERIAL_PORT_CANDIDATES[0], "/dev/ttyACM0");
        assert_eq!(SERIAL_PORT_CANDIDATES.last(), Some(&"/dev/ttyUSB1"));
    }

    #[tokio::test]
    async fn detect_serial_port_returns_none_when_nothing_attached() {
        let deployer = FirmwareDeployer::new("arduino:avr:uno");
        assert_eq!(deployer.detect_serial_port().await, None);
    }
}
