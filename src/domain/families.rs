//! Job families: one named queue per family, each declaring its payload shape.
//!
//! Handlers for these payloads live outside this crate; only the shape and the
//! cheap structural checks are declared here.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use super::policy::{Backoff, QueuePolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobFamily {
    AudioConvert,
    AudioMix,
    CsvImport,
    Analytics,
    Email,
}

impl JobFamily {
    pub const ALL: [JobFamily; 5] = [
        JobFamily::AudioConvert,
        JobFamily::AudioMix,
        JobFamily::CsvImport,
        JobFamily::Analytics,
        JobFamily::Email,
    ];

    pub fn queue_name(&self) -> &'static str {
        match self {
            JobFamily::AudioConvert => "audio-convert",
            JobFamily::AudioMix => "audio-mix",
            JobFamily::CsvImport => "csv-import",
            JobFamily::Analytics => "analytics",
            JobFamily::Email => "email",
        }
    }

    pub fn from_queue_name(name: &str) -> Option<JobFamily> {
        Self::ALL
            .iter()
            .copied()
            .find(|family| family.queue_name() == name)
    }

    /// Check an untyped payload against this family's declared shape.
    pub fn check_payload(&self, payload: &Value) -> Result<(), String> {
        match self {
            JobFamily::AudioConvert => check::<AudioConvert>(payload),
            JobFamily::AudioMix => check::<AudioMix>(payload),
            JobFamily::CsvImport => check::<CsvImport>(payload),
            JobFamily::Analytics => check::<Analytics>(payload),
            JobFamily::Email => check::<Email>(payload),
        }
    }

    /// Prefix for this family's environment overrides, e.g. `AUDIO_CONVERT`.
    pub fn env_prefix(&self) -> String {
        self.queue_name().replace('-', "_").to_uppercase()
    }

    pub fn default_concurrency(&self) -> usize {
        match self {
            JobFamily::AudioConvert => 2,
            JobFamily::AudioMix => 1,
            JobFamily::CsvImport => 2,
            JobFamily::Analytics => 4,
            JobFamily::Email => 10,
        }
    }

    pub fn default_policy(&self) -> QueuePolicy {
        let (max_attempts, base_delay, timeout) = match self {
            JobFamily::AudioConvert => (3, Duration::from_secs(5), Duration::from_secs(600)),
            JobFamily::AudioMix => (2, Duration::from_secs(10), Duration::from_secs(900)),
            JobFamily::CsvImport => (3, Duration::from_secs(5), Duration::from_secs(300)),
            JobFamily::Analytics => (3, Duration::from_secs(2), Duration::from_secs(120)),
            JobFamily::Email => (5, Duration::from_secs(2), Duration::from_secs(30)),
        };
        QueuePolicy {
            max_attempts,
            backoff: Backoff::Exponential {
                delay_ms: base_delay.as_millis() as u64,
                jitter: true,
            },
            timeout_ms: timeout.as_millis() as u64,
            ..QueuePolicy::default()
        }
    }
}

/// A typed payload bound to one family's queue.
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync {
    const FAMILY: JobFamily;

    fn job_type(&self) -> &'static str;

    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

fn check<P: JobPayload>(payload: &Value) -> Result<(), String> {
    let typed = P::deserialize(payload)
        .map_err(|e| format!("not a {} payload: {}", P::FAMILY.queue_name(), e))?;
    typed.validate()
}

fn require(value: &str, field: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{} must not be empty", field))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConvert {
    pub source_key: String,
    pub target_format: String,
    pub bitrate_kbps: Option<u32>,
}

impl JobPayload for AudioConvert {
    const FAMILY: JobFamily = JobFamily::AudioConvert;

    fn job_type(&self) -> &'static str {
        "convert"
    }

    fn validate(&self) -> Result<(), String> {
        require(&self.source_key, "source_key")?;
        require(&self.target_format, "target_format")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioMix {
    pub track_keys: Vec<String>,
    pub output_key: String,
}

impl JobPayload for AudioMix {
    const FAMILY: JobFamily = JobFamily::AudioMix;

    fn job_type(&self) -> &'static str {
        "mix"
    }

    fn validate(&self) -> Result<(), String> {
        if self.track_keys.len() < 2 {
            return Err("a mix needs at least two tracks".to_string());
        }
        require(&self.output_key, "output_key")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvImport {
    pub upload_key: String,
    pub target: String,
    pub delimiter: char,
    pub has_header: bool,
}

impl JobPayload for CsvImport {
    const FAMILY: JobFamily = JobFamily::CsvImport;

    fn job_type(&self) -> &'static str {
        "import"
    }

    fn validate(&self) -> Result<(), String> {
        require(&self.upload_key, "upload_key")?;
        require(&self.target, "target")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analytics {
    pub metric: String,
    pub subject_id: String,
    pub window_days: u32,
}

impl JobPayload for Analytics {
    const FAMILY: JobFamily = JobFamily::Analytics;

    fn job_type(&self) -> &'static str {
        "compute"
    }

    fn validate(&self) -> Result<(), String> {
        require(&self.metric, "metric")?;
        if self.window_days == 0 {
            return Err("window_days must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub to: String,
    pub template: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl JobPayload for Email {
    const FAMILY: JobFamily = JobFamily::Email;

    fn job_type(&self) -> &'static str {
        "send"
    }

    fn validate(&self) -> Result<(), String> {
        require(&self.template, "template")?;
        if !self.to.contains('@') {
            return Err(format!("invalid recipient: {}", self.to));
        }
        Ok(())
    }
}
