//! Configuration file support for bpfman-purger
//!
//! Every setting has a default matching the bpfman operator's layout, so a
//! config file is only needed to retarget the purger or tune its pacing.

use std::{fs, path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PurgeConfig {
	/// Application token used in label selectors and name matching.
	pub app: String,

	/// Label keys that mark a resource as belonging to the app; each is
	/// queried as `<key>=<app>`.
	pub label_keys: Vec<String>,

	/// CRD names that always belong to the app.
	pub crd_names: Vec<String>,

	/// Name fragments that identify app resources besides the app token.
	pub name_fragments: Vec<String>,

	/// Plural names of the app's own custom resource types. Objects of these
	/// types are deleted first.
	pub instance_resources: Vec<String>,

	/// Deadline for the whole run.
	pub timeout_seconds: u64,

	/// Maximum simultaneous list calls during generic resource discovery.
	pub max_concurrent_requests: usize,

	pub rate_limit: RateLimitConfig,
}

/// Pacing of API calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
	pub initial_delay_ms: u64,
	pub min_delay_ms: u64,
	pub max_delay_ms: u64,
	/// Total attempts per call, including the first.
	pub max_attempts: u32,
}

impl Default for RateLimitConfig {
	fn default() -> Self {
		Self {
			initial_delay_ms: 100,
			min_delay_ms: 50,
			max_delay_ms: 5000,
			max_attempts: 3,
		}
	}
}

impl RateLimitConfig {
	pub fn initial_delay(&self) -> Duration {
		Duration::from_millis(self.initial_delay_ms)
	}

	pub fn min_delay(&self) -> Duration {
		Duration::from_millis(self.min_delay_ms)
	}

	pub fn max_delay(&self) -> Duration {
		Duration::from_millis(self.max_delay_ms)
	}
}

fn strings(items: &[&str]) -> Vec<String> {
	items.iter().map(|s| s.to_string()).collect()
}

impl Default for PurgeConfig {
	fn default() -> Self {
		Self {
			app: "bpfman".to_string(),
			label_keys: strings(&["app.kubernetes.io/name", "app.kubernetes.io/part-of", "app"]),
			crd_names: strings(&[
				"bpfapplications.bpfman.io",
				"bpfapplicationstates.bpfman.io",
				"clusterbpfapplications.bpfman.io",
				"clusterbpfapplicationstates.bpfman.io",
			]),
			name_fragments: strings(&[
				"bpfapplication",
				"xdpprogram",
				"tcprogram",
				"tracepointprogram",
				"kprobeprogram",
				"uprobeprogram",
				"fentryprogram",
				"fexitprogram",
			]),
			instance_resources: strings(&[
				"bpfapplications",
				"bpfapplicationstates",
				"clusterbpfapplications",
				"clusterbpfapplicationstates",
			]),
			timeout_seconds: 600,
			max_concurrent_requests: 10,
			rate_limit: RateLimitConfig::default(),
		}
	}
}

impl PurgeConfig {
	/// Load config from a specific file path
	pub fn load_from_file(path: &Path) -> Result<Self> {
		let content = fs::read_to_string(path)
			.with_context(|| format!("failed to read config file: {}", path.display()))?;
		Self::from_yaml(&content)
			.with_context(|| format!("failed to parse config file: {}", path.display()))
	}

	/// Parse and validate a YAML config document.
	pub fn from_yaml(content: &str) -> Result<Self> {
		let config: PurgeConfig = serde_yaml_with_quirks::from_str(content)?;
		config.validate()?;
		Ok(config)
	}

	/// Load from `path` if given, defaults otherwise.
	pub fn load(path: Option<&Path>) -> Result<Self> {
		match path {
			Some(path) => Self::load_from_file(path),
			None => Ok(Self::default()),
		}
	}

	pub fn validate(&self) -> Result<()> {
		if self.app.trim().is_empty() {
			bail!("app must not be empty");
		}
		if self.max_concurrent_requests == 0 {
			bail!("maxConcurrentRequests must be at least 1");
		}
		if self.timeout_seconds == 0 {
			bail!("timeoutSeconds must be at least 1");
		}
		let rate = &self.rate_limit;
		if rate.max_attempts == 0 {
			bail!("rateLimit.maxAttempts must be at least 1");
		}
		if rate.min_delay_ms > rate.max_delay_ms {
			bail!(
				"rateLimit.minDelayMs ({}) exceeds rateLimit.maxDelayMs ({})",
				rate.min_delay_ms,
				rate.max_delay_ms
			);
		}
		Ok(())
	}

	pub fn timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_seconds)
	}

	/// Label selectors identifying app resources, one per label key.
	pub fn label_selectors(&self) -> Vec<String> {
		self.label_keys
			.iter()
			.map(|key| format!("{key}={}", self.app))
			.collect()
	}
}
