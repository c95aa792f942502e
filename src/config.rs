use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DETECTOR_BACKEND: &str = "stub";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CLASS_NAMES: [&str; 2] = ["crack", "spalling"];
const DEFAULT_CONFIDENCE_FLOOR: f32 = 0.25;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
const DEFAULT_THRESHOLD: f32 = 0.5;
const DEFAULT_EVIDENCE_DIR: &str = "evidence";
const DEFAULT_CAMERA: &str = "/dev/video0";
const DEFAULT_POLL_INTERVAL_MS: u64 = 30;
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_REPORT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_REPORT_MODEL: &str = "gpt-4.1-mini";
const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
const DEFAULT_MAX_TOKENS: u32 = 300;
const DEFAULT_TEMPERATURE: f32 = 0.1;
const DEFAULT_REPORT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SUBJECT_PREFIX: &str = "[crackwatch]";
const DEFAULT_SMTP_PORT: u16 = 587;
const DEFAULT_SMTP_PASSWORD_ENV: &str = "CRACKWATCH_SMTP_PASSWORD";
const DEFAULT_SMTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CrackwatchConfigFile {
    detector: Option<DetectorConfigFile>,
    policy: Option<PolicyConfigFile>,
    evidence: Option<EvidenceConfigFile>,
    camera: Option<CameraConfigFile>,
    report: Option<ReportConfigFile>,
    mail: Option<MailConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    class_names: Option<Vec<String>>,
    confidence_floor: Option<f32>,
    iou_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PolicyConfigFile {
    threshold: Option<f32>,
    capture_annotated: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct EvidenceConfigFile {
    dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CameraConfigFile {
    device: Option<String>,
    poll_interval_ms: Option<u64>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ReportConfigFile {
    endpoint: Option<String>,
    model: Option<String>,
    api_key_env: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    timeout_secs: Option<u64>,
    auto_on_detection: Option<bool>,
    subject_prefix: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MailConfigFile {
    smtp_host: Option<String>,
    smtp_port: Option<u16>,
    username: Option<String>,
    password_env: Option<String>,
    from: Option<String>,
    to: Option<Vec<String>>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CrackwatchConfig {
    pub detector: DetectorSettings,
    pub policy: PolicySettings,
    pub evidence_dir: PathBuf,
    pub camera: CameraSettings,
    pub report: ReportSettings,
    /// `None` when no mail relay is configured; dispatch is then unavailable.
    pub mail: Option<MailSettings>,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// "stub" or "tract".
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub class_names: Vec<String>,
    pub confidence_floor: f32,
    pub iou_threshold: f32,
}

#[derive(Debug, Clone)]
pub struct PolicySettings {
    pub threshold: f32,
    /// Persist the annotated frame instead of the raw one.
    pub capture_annotated: bool,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub device: String,
    pub poll_interval: Duration,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct ReportSettings {
    pub endpoint: String,
    pub model: String,
    /// Name of the env var holding the API key. The key itself is never stored.
    pub api_key_env: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
    /// Generate (and dispatch, when mail is configured) as soon as a single
    /// inspected image is significant.
    pub auto_on_detection: bool,
    pub subject_prefix: String,
}

#[derive(Debug, Clone)]
pub struct MailSettings {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    /// Name of the env var holding the SMTP password.
    pub password_env: String,
    pub from: String,
    pub to: Vec<String>,
    pub timeout: Duration,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_REPORT_ENDPOINT.to_string(),
            model: DEFAULT_REPORT_MODEL.to_string(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            timeout: Duration::from_secs(DEFAULT_REPORT_TIMEOUT_SECS),
            auto_on_detection: true,
            subject_prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
        }
    }
}

impl CrackwatchConfig {
    /// Load configuration: optional TOML file named by `CRACKWATCH_CONFIG`,
    /// then env overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CRACKWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CrackwatchConfigFile) -> Result<Self> {
        let detector_file = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            backend: detector_file
                .backend
                .unwrap_or_else(|| DEFAULT_DETECTOR_BACKEND.to_string()),
            model_path: detector_file.model_path,
            input_size: detector_file.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            class_names: detector_file.class_names.unwrap_or_else(|| {
                DEFAULT_CLASS_NAMES.iter().map(|s| s.to_string()).collect()
            }),
            confidence_floor: detector_file
                .confidence_floor
                .unwrap_or(DEFAULT_CONFIDENCE_FLOOR),
            iou_threshold: detector_file.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
        };

        let policy_file = file.policy.unwrap_or_default();
        let policy = PolicySettings {
            threshold: policy_file.threshold.unwrap_or(DEFAULT_THRESHOLD),
            capture_annotated: policy_file.capture_annotated.unwrap_or(false),
        };

        let evidence_dir = file
            .evidence
            .and_then(|evidence| evidence.dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_EVIDENCE_DIR));

        let camera_file = file.camera.unwrap_or_default();
        let camera = CameraSettings {
            device: camera_file
                .device
                .unwrap_or_else(|| DEFAULT_CAMERA.to_string()),
            poll_interval: Duration::from_millis(
                camera_file
                    .poll_interval_ms
                    .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            width: camera_file.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
            height: camera_file.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
        };

        let report_file = file.report.unwrap_or_default();
        let defaults = ReportSettings::default();
        let report = ReportSettings {
            endpoint: report_file.endpoint.unwrap_or(defaults.endpoint),
            model: report_file.model.unwrap_or(defaults.model),
            api_key_env: report_file.api_key_env.unwrap_or(defaults.api_key_env),
            max_tokens: report_file.max_tokens.unwrap_or(defaults.max_tokens),
            temperature: report_file.temperature.unwrap_or(defaults.temperature),
            timeout: report_file
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            auto_on_detection: report_file
                .auto_on_detection
                .unwrap_or(defaults.auto_on_detection),
            subject_prefix: report_file
                .subject_prefix
                .unwrap_or(defaults.subject_prefix),
        };

        let mail = file.mail.map(|mail| MailSettings {
            smtp_host: mail.smtp_host.unwrap_or_default(),
            smtp_port: mail.smtp_port.unwrap_or(DEFAULT_SMTP_PORT),
            username: mail.username.unwrap_or_default(),
            password_env: mail
                .password_env
                .unwrap_or_else(|| DEFAULT_SMTP_PASSWORD_ENV.to_string()),
            from: mail.from.unwrap_or_default(),
            to: mail.to.unwrap_or_default(),
            timeout: Duration::from_secs(mail.timeout_secs.unwrap_or(DEFAULT_SMTP_TIMEOUT_SECS)),
        });

        Ok(Self {
            detector,
            policy,
            evidence_dir,
            camera,
            report,
            mail,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(threshold) = std::env::var("CRACKWATCH_THRESHOLD") {
            self.policy.threshold = threshold
                .trim()
                .parse()
                .map_err(|_| anyhow!("CRACKWATCH_THRESHOLD must be a number in [0, 1]"))?;
        }
        if let Some(dir) = non_empty_env("CRACKWATCH_EVIDENCE_DIR") {
            self.evidence_dir = PathBuf::from(dir);
        }
        if let Some(path) = non_empty_env("CRACKWATCH_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(device) = non_empty_env("CRACKWATCH_CAMERA") {
            self.camera.device = device;
        }
        if let Ok(interval) = std::env::var("CRACKWATCH_POLL_INTERVAL_MS") {
            let millis: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("CRACKWATCH_POLL_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.camera.poll_interval = Duration::from_millis(millis);
        }
        if let Ok(max_tokens) = std::env::var("CRACKWATCH_REPORT_MAX_TOKENS") {
            self.report.max_tokens = max_tokens
                .trim()
                .parse()
                .map_err(|_| anyhow!("CRACKWATCH_REPORT_MAX_TOKENS must be a positive integer"))?;
        }

        let smtp_host = non_empty_env("CRACKWATCH_SMTP_HOST");
        let smtp_username = non_empty_env("CRACKWATCH_SMTP_USERNAME");
        let mail_from = non_empty_env("CRACKWATCH_MAIL_FROM");
        let mail_to = std::env::var("CRACKWATCH_MAIL_TO")
            .ok()
            .map(|value| split_csv(&value))
            .filter(|parsed| !parsed.is_empty());
        if smtp_host.is_some() || smtp_username.is_some() || mail_from.is_some() || mail_to.is_some()
        {
            let mail = self.mail.get_or_insert_with(|| MailSettings {
                smtp_host: String::new(),
                smtp_port: DEFAULT_SMTP_PORT,
                username: String::new(),
                password_env: DEFAULT_SMTP_PASSWORD_ENV.to_string(),
                from: String::new(),
                to: Vec::new(),
                timeout: Duration::from_secs(DEFAULT_SMTP_TIMEOUT_SECS),
            });
            if let Some(host) = smtp_host {
                mail.smtp_host = host;
            }
            if let Some(username) = smtp_username {
                mail.username = username;
            }
            if let Some(from) = mail_from {
                mail.from = from;
            }
            if let Some(to) = mail_to {
                mail.to = to;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.policy.threshold) {
            return Err(anyhow!(
                "policy threshold must be within [0, 1], got {}",
                self.policy.threshold
            ));
        }
        match self.detector.backend.as_str() {
            "stub" => {}
            "tract" => {
                if self.detector.model_path.is_none() {
                    return Err(anyhow!("detector backend 'tract' requires model_path"));
                }
            }
            other => {
                return Err(anyhow!(
                    "unknown detector backend '{}'; expected stub or tract",
                    other
                ))
            }
        }
        if self.detector.class_names.is_empty() {
            return Err(anyhow!("detector class_names cannot be empty"));
        }
        if self.detector.input_size == 0 || self.detector.input_size % 32 != 0 {
            return Err(anyhow!("detector input_size must be a positive multiple of 32"));
        }
        if self.camera.poll_interval.is_zero() {
            return Err(anyhow!("camera poll interval must be greater than zero"));
        }
        if self.report.max_tokens == 0 {
            return Err(anyhow!("report max_tokens must be greater than zero"));
        }
        if !(0.0..=2.0).contains(&self.report.temperature) {
            return Err(anyhow!("report temperature must be within [0, 2]"));
        }
        if self.report.api_key_env.trim().is_empty() {
            return Err(anyhow!("report api_key_env cannot be empty"));
        }
        if let Some(mail) = &mut self.mail {
            if mail.smtp_host.trim().is_empty() {
                return Err(anyhow!("mail smtp_host is required when mail is configured"));
            }
            if mail.from.trim().is_empty() {
                return Err(anyhow!("mail from is required when mail is configured"));
            }
            if mail.to.is_empty() {
                return Err(anyhow!("mail needs at least one recipient"));
            }
            let mut seen = HashSet::new();
            mail.to.retain(|addr| seen.insert(addr.clone()));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<CrackwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
