//! Firmware flashing through avrdude
//!
//! avrdude prints a `Writing |` marker followed by up to fifty `#`
//! characters, each worth 2% of the bytes written. Output may arrive split
//! at arbitrary points, so the progress parser keeps a cumulative buffer.

use grblbridge_core::FirmwareError;
use grblbridge_settings::FirmwareUploadConfig;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, error, info};

const PERCENT_PER_HASH: u32 = 2;

fn writing_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Writing \|(.*)").expect("invalid regex pattern"))
}

fn hashes_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(#+)(.*)").expect("invalid regex pattern"))
}

/// Decodes avrdude output into a write percentage
pub struct FlashProgressParser<F: FnMut(u32)> {
    pending: String,
    writing: bool,
    percent: u32,
    callback: F,
}

impl<F: FnMut(u32)> FlashProgressParser<F> {
    /// Create a parser; `callback` immediately receives 0
    pub fn new(mut callback: F) -> Self {
        callback(0);
        Self {
            pending: String::new(),
            writing: false,
            percent: 0,
            callback,
        }
    }

    /// Feed a chunk of tool output
    pub fn parse(&mut self, data: &str) {
        self.pending.push_str(data);

        if let Some(caps) = writing_regex().captures(&self.pending) {
            self.writing = true;
            self.pending = caps[1].to_string();
        }

        if !self.writing {
            return;
        }
        if let Some(caps) = hashes_regex().captures(&self.pending) {
            let hashes = u32::try_from(caps[1].len()).unwrap_or(u32::MAX);
            self.percent = self
                .percent
                .saturating_add(hashes.saturating_mul(PERCENT_PER_HASH))
                .min(100);
            self.pending = caps[2].to_string();
            (self.callback)(self.percent);
        }
    }

    /// Percentage reported so far
    pub fn percent(&self) -> u32 {
        self.percent
    }
}

/// Result of a flashing run
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct FlashOutcome {
    /// Tool exited with code 0
    pub success: bool,
    /// Exit code, absent when the tool was killed by a signal
    pub code: Option<i32>,
}

/// Location of the avrdude executable and its config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashTools {
    pub executable: PathBuf,
    pub config: PathBuf,
}

impl FlashTools {
    /// Resolve the bundled avrdude layout for the current platform
    pub fn for_current_platform(root: &Path) -> Result<Self, FirmwareError> {
        Self::for_platform(std::env::consts::OS, root)
    }

    /// Resolve the bundled avrdude layout for `os`
    pub fn for_platform(os: &str, root: &Path) -> Result<Self, FirmwareError> {
        let (dir, executable) = match os {
            "macos" => ("tools_darwin/avrdude", "bin/avrdude"),
            "windows" => ("tools_windows/avrdude", "bin/avrdude.exe"),
            other => {
                return Err(FirmwareError::UnsupportedPlatform {
                    platform: other.to_string(),
                })
            }
        };
        let base = root.join(dir);
        Ok(Self {
            executable: base.join(executable),
            config: base.join("etc/avrdude.conf"),
        })
    }

    /// avrdude arguments reading Intel hex from stdin
    pub fn args(&self, port_name: &str, upload: &FirmwareUploadConfig) -> Vec<String> {
        vec![
            "-C".to_string(),
            self.config.display().to_string(),
            "-p".to_string(),
            upload.avr_device.clone(),
            "-c".to_string(),
            upload.programmer.clone(),
            "-P".to_string(),
            port_name.to_string(),
            "-b".to_string(),
            upload.baud_rate.to_string(),
            "-D".to_string(),
            "-V".to_string(),
            "-U".to_string(),
            "flash:w:-:i".to_string(),
        ]
    }
}

/// Runs avrdude against a released serial port
#[derive(Debug, Clone)]
pub struct FirmwareFlasher {
    tools_root: PathBuf,
}

impl FirmwareFlasher {
    pub fn new(tools_root: impl Into<PathBuf>) -> Self {
        Self {
            tools_root: tools_root.into(),
        }
    }

    /// Flash `hex` to the device on `port_name`
    pub async fn upload<F>(
        &self,
        port_name: &str,
        hex: &str,
        upload: &FirmwareUploadConfig,
        progress: F,
    ) -> Result<FlashOutcome, FirmwareError>
    where
        F: FnMut(u32),
    {
        let tools = FlashTools::for_current_platform(&self.tools_root).map_err(|e| {
            error!(error = %e, "Firmware update aborted");
            e
        })?;
        self.run(&tools, port_name, hex, upload, progress).await
    }

    /// Flash using an explicit tool layout
    pub async fn run<F>(
        &self,
        tools: &FlashTools,
        port_name: &str,
        hex: &str,
        upload: &FirmwareUploadConfig,
        progress: F,
    ) -> Result<FlashOutcome, FirmwareError>
    where
        F: FnMut(u32),
    {
        let args = tools.args(port_name, upload);
        info!(
            program = %tools.executable.display(),
            args = %args.join(" "),
            "Flash command"
        );

        let mut child = Command::new(&tools.executable)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FirmwareError::SpawnFailed {
                program: tools.executable.display().to_string(),
                reason: e.to_string(),
            })?;

        let io_error = |e: std::io::Error| FirmwareError::Io {
            reason: e.to_string(),
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(hex.as_bytes()).await {
                error!(error = %e, "Failed writing hex to flash process");
            }
        }

        let mut parser = FlashProgressParser::new(progress);
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut out_buf = [0u8; 1024];
        let mut err_buf = [0u8; 1024];

        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                read = async { stdout.as_mut()?.read(&mut out_buf).await.ok() }, if stdout.is_some() => {
                    match read {
                        Some(n) if n > 0 => {
                            let chunk = String::from_utf8_lossy(&out_buf[..n]);
                            debug!(output = %chunk, "Flash progress");
                            parser.parse(&chunk);
                        }
                        _ => stdout = None,
                    }
                }
                read = async { stderr.as_mut()?.read(&mut err_buf).await.ok() }, if stderr.is_some() => {
                    match read {
                        Some(n) if n > 0 => {
                            let chunk = String::from_utf8_lossy(&err_buf[..n]);
                            debug!(output = %chunk, "Flash progress");
                            parser.parse(&chunk);
                        }
                        _ => stderr = None,
                    }
                }
            }
        }

        let status = child.wait().await.map_err(io_error)?;
        let outcome = FlashOutcome {
            success: status.code() == Some(0),
            code: status.code(),
        };
        info!(success = outcome.success, code = ?outcome.code, "Flash done");
        Ok(outcome)
    }
}
