use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use crate::backend::BackendKind;
use crate::provider::PodSpec;
use crate::types::Priority;

/// Top-level configuration, one section per subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorConfig {
    pub queue: QueueConfig,
    pub fleet: FleetConfig,
    pub pod: PodSpec,
    pub backends: BackendsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    pub high: u32,
    pub normal: u32,
    pub low: u32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            high: 3,
            normal: 2,
            low: 1,
        }
    }
}

impl PriorityWeights {
    pub fn weight(&self, priority: Priority) -> u32 {
        match priority {
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub default_timeout_ms: u64,
    pub default_max_retries: u32,
    pub priority_weights: PriorityWeights,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_queue_size: 100,
            default_timeout_ms: 300_000,
            default_max_retries: 3,
            priority_weights: PriorityWeights::default(),
        }
    }
}

impl QueueConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent == 0 {
            anyhow::bail!("queue.maxConcurrent must be > 0");
        }
        if self.max_queue_size == 0 {
            anyhow::bail!("queue.maxQueueSize must be > 0");
        }
        if self.default_timeout_ms == 0 {
            anyhow::bail!("queue.defaultTimeoutMs must be > 0");
        }
        let w = self.priority_weights;
        if w.high == 0 || w.normal == 0 || w.low == 0 {
            anyhow::bail!("queue.priorityWeights must all be > 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FleetConfig {
    pub min_pods: usize,
    pub max_pods: usize,
    /// Pending queue length at or above which the autoscaler adds a pod.
    pub scale_up_threshold: usize,
    /// Pending queue length at or below which the autoscaler removes a pod.
    pub scale_down_threshold: usize,
    pub scale_up_cooldown_ms: u64,
    pub scale_down_cooldown_ms: u64,
    pub pod_idle_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    /// Upper bound on waiting for a freshly deployed pod to become ready.
    pub provision_timeout_ms: u64,
    pub readiness_poll_ms: u64,
    /// Price per pod-hour used for cost accrual.
    pub pod_hourly_cost: f64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            min_pods: 0,
            max_pods: 5,
            scale_up_threshold: 10,
            scale_down_threshold: 2,
            scale_up_cooldown_ms: 120_000,
            scale_down_cooldown_ms: 300_000,
            pod_idle_timeout_ms: 600_000,
            health_check_interval_ms: 30_000,
            provision_timeout_ms: 300_000,
            readiness_poll_ms: 5_000,
            pod_hourly_cost: 0.34,
        }
    }
}

impl FleetConfig {
    pub fn scale_up_cooldown(&self) -> Duration {
        Duration::from_millis(self.scale_up_cooldown_ms)
    }

    pub fn scale_down_cooldown(&self) -> Duration {
        Duration::from_millis(self.scale_down_cooldown_ms)
    }

    pub fn pod_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.pod_idle_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_millis(self.provision_timeout_ms)
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_pods > self.max_pods {
            anyhow::bail!(
                "fleet.minPods ({}) exceeds fleet.maxPods ({})",
                self.min_pods,
                self.max_pods
            );
        }
        if self.health_check_interval_ms == 0 {
            anyhow::bail!("fleet.healthCheckIntervalMs must be > 0");
        }
        if self.readiness_poll_ms == 0 {
            anyhow::bail!("fleet.readinessPollMs must be > 0");
        }
        if self.pod_hourly_cost < 0.0 {
            anyhow::bail!("fleet.podHourlyCost must not be negative");
        }
        Ok(())
    }
}

/// Static per-backend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    pub url: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
    /// Charge for one served generation.
    pub cost_per_unit: f64,
    #[serde(default)]
    pub provider: Option<String>,
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackendsConfig {
    pub backend_priority_order: Vec<BackendKind>,
    pub local: BackendConfig,
    pub cloud: BackendConfig,
    pub gemini: BackendConfig,
    /// Liveness endpoint of the local generation service.
    pub local_health_url: String,
    /// Statically provisioned cloud pod used when the fleet has none running.
    pub cloud_pod_id: Option<String>,
    pub gemini_api_key: Option<String>,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            backend_priority_order: vec![BackendKind::Local, BackendKind::Cloud, BackendKind::Gemini],
            local: BackendConfig {
                url: "http://localhost:8188".to_string(),
                timeout_ms: 120_000,
                max_retries: 2,
                cost_per_unit: 0.0,
                provider: None,
            },
            cloud: BackendConfig {
                url: String::new(),
                timeout_ms: 180_000,
                max_retries: 3,
                cost_per_unit: 0.02,
                provider: Some("runpod".to_string()),
            },
            gemini: BackendConfig {
                url: "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash-exp:generateContent"
                    .to_string(),
                timeout_ms: 60_000,
                max_retries: 2,
                cost_per_unit: 0.5,
                provider: Some("google".to_string()),
            },
            local_health_url: "http://localhost:8000/health/system_stats".to_string(),
            cloud_pod_id: None,
            gemini_api_key: None,
        }
    }
}

impl BackendsConfig {
    pub fn config_for(&self, kind: BackendKind) -> &BackendConfig {
        match kind {
            BackendKind::Local => &self.local,
            BackendKind::Cloud => &self.cloud,
            BackendKind::Gemini => &self.gemini,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend_priority_order.is_empty() {
            anyhow::bail!("backends.backendPriorityOrder must not be empty");
        }
        for kind in &self.backend_priority_order {
            let cfg = self.config_for(*kind);
            if !cfg.url.is_empty() {
                url::Url::parse(&cfg.url)
                    .map_err(|e| anyhow::anyhow!("backends.{}.url is invalid: {}", kind, e))?;
            }
            if cfg.cost_per_unit < 0.0 {
                anyhow::bail!("backends.{}.costPerUnit must not be negative", kind);
            }
        }
        url::Url::parse(&self.local_health_url)
            .map_err(|e| anyhow::anyhow!("backends.localHealthUrl is invalid: {}", e))?;
        Ok(())
    }
}

impl OrchestratorConfig {
    /// Load from `ORCHESTRATOR_CONFIG` or `./orchestrator.json`, falling back
    /// to built-in defaults when neither exists.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_with(None)
    }

    /// Like [`load`](Self::load), but an explicit path takes precedence.
    pub fn load_with(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(resolve_config_path);
        let mut cfg = match path {
            Some(path) => Self::load_from(&path)?,
            None => {
                tracing::info!("No orchestrator config file found, using defaults");
                Self::default()
            }
        };
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let cfg = Self::from_json_str(&raw)?;
        tracing::info!("Loaded orchestrator config from {}", path.display());
        Ok(cfg)
    }

    /// Parse JSON, expanding `${VAR}` references in every string value.
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let mut value: Value = serde_json::from_str(raw)?;
        expand_value(&mut value);
        let cfg: Self = serde_json::from_value(value)?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(order) = env::var("BACKEND_PRIORITY") {
            self.backends.backend_priority_order = parse_backend_priority(&order)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.queue.validate()?;
        self.fleet.validate()?;
        self.backends.validate()?;
        Ok(())
    }

    /// Copy safe to print: credentials replaced by a marker.
    pub fn redacted(&self) -> Self {
        let mut cfg = self.clone();
        if cfg.backends.gemini_api_key.is_some() {
            cfg.backends.gemini_api_key = Some("***".to_string());
        }
        cfg
    }
}

/// Parse a comma separated backend list such as `cloud,local,gemini`.
pub fn parse_backend_priority(raw: &str) -> anyhow::Result<Vec<BackendKind>> {
    let order = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse::<BackendKind>)
        .collect::<anyhow::Result<Vec<_>>>()?;
    if order.is_empty() {
        anyhow::bail!("BACKEND_PRIORITY is empty");
    }
    Ok(order)
}

pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("ORCHESTRATOR_CONFIG") {
        return Some(PathBuf::from(p));
    }

    let candidate = PathBuf::from("orchestrator.json");
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || !matches!(chars.peek(), Some('{')) {
            out.push(ch);
            continue;
        }
        chars.next();
        let mut name = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            name.push(c);
        }
        if !closed {
            out.push_str("${");
            out.push_str(&name);
            break;
        }
        match env::var(&name) {
            Ok(val) => out.push_str(&val),
            // Unset variables are left verbatim so the mistake is visible.
            Err(_) => {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        }
    }

    out
}

fn expand_value(value: &mut Value) {
    match value {
        Value::String(s) => *s = expand_env_vars(s),
        Value::Array(items) => items.iter_mut().for_each(expand_value),
        Value::Object(map) => map.values_mut().for_each(expand_value),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = OrchestratorConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.queue.max_concurrent, 3);
        assert_eq!(cfg.fleet.max_pods, 5);
        assert_eq!(
            cfg.backends.backend_priority_order,
            vec![BackendKind::Local, BackendKind::Cloud, BackendKind::Gemini]
        );
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg = OrchestratorConfig::from_json_str(
            r#"{ "queue": { "maxConcurrent": 7 }, "fleet": { "maxPods": 2, "scaleUpCooldownMs": 10 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.queue.max_concurrent, 7);
        assert_eq!(cfg.queue.max_queue_size, 100);
        assert_eq!(cfg.fleet.max_pods, 2);
        assert_eq!(cfg.fleet.scale_up_cooldown(), Duration::from_millis(10));
        assert_eq!(cfg.fleet.pod_idle_timeout_ms, 600_000);
    }

    #[test]
    fn test_env_expansion_in_strings() {
        // SAFETY: test-only variable with a unique name.
        unsafe { env::set_var("RO_TEST_GEMINI_KEY", "secret-key") };
        let cfg = OrchestratorConfig::from_json_str(
            r#"{ "backends": { "geminiApiKey": "${RO_TEST_GEMINI_KEY}", "cloudPodId": "${RO_TEST_UNSET_VAR}" } }"#,
        )
        .unwrap();
        assert_eq!(cfg.backends.gemini_api_key.as_deref(), Some("secret-key"));
        assert_eq!(cfg.backends.cloud_pod_id.as_deref(), Some("${RO_TEST_UNSET_VAR}"));
        assert_eq!(cfg.redacted().backends.gemini_api_key.as_deref(), Some("***"));
    }

    #[test]
    fn test_unterminated_reference_is_kept_verbatim() {
        // SAFETY: test-only variable with a unique name.
        unsafe { env::set_var("RO_TEST_POD_SUFFIX", "abc") };
        assert_eq!(expand_env_vars("pod-${RO_TEST_POD_SUFFIX"), "pod-${RO_TEST_POD_SUFFIX");
        assert_eq!(expand_env_vars("${RO_TEST_POD_SUFFIX}-${"), "abc-${");
        assert_eq!(expand_env_vars("cost $5"), "cost $5");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "backends": {{ "backendPriorityOrder": ["gemini", "local"] }} }}"#
        )
        .unwrap();

        let cfg = OrchestratorConfig::load_from(file.path()).unwrap();
        assert_eq!(
            cfg.backends.backend_priority_order,
            vec![BackendKind::Gemini, BackendKind::Local]
        );
    }

    #[test]
    fn test_validation_rejects_inconsistent_values() {
        let mut cfg = OrchestratorConfig::default();
        cfg.fleet.min_pods = 4;
        cfg.fleet.max_pods = 2;
        assert!(cfg.validate().is_err());

        let mut cfg = OrchestratorConfig::default();
        cfg.queue.max_concurrent = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = OrchestratorConfig::default();
        cfg.backends.local.url = "not a url".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_parse_backend_priority() {
        assert_eq!(
            parse_backend_priority(" cloud , gemini").unwrap(),
            vec![BackendKind::Cloud, BackendKind::Gemini]
        );
        assert!(parse_backend_priority("cloud,mainframe").is_err());
        assert!(parse_backend_priority(" , ").is_err());
    }
}
