use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

// ── Resolution ───────────────────────────────────────────────────────────────

/// Per-dimension weights of the pairwise scorer. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchWeights {
    pub email:        f64,
    pub company_name: f64,
    pub domain:       f64,
    pub temporal:     f64,
    pub amount:       f64,
    pub phone:        f64,
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            email:        0.35,
            company_name: 0.25,
            domain:       0.15,
            temporal:     0.10,
            amount:       0.10,
            phone:        0.05,
        }
    }
}

impl MatchWeights {
    pub fn as_pairs(&self) -> [(&'static str, f64); 6] {
        [
            ("email", self.email),
            ("company_name", self.company_name),
            ("domain", self.domain),
            ("temporal", self.temporal),
            ("amount", self.amount),
            ("phone", self.phone),
        ]
    }

    pub fn sum(&self) -> f64 {
        self.as_pairs().iter().map(|(_, w)| w).sum()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (dimension, value) in self.as_pairs() {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::WeightOutOfRange { dimension, value });
            }
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::WeightSum { sum });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    pub weights: MatchWeights,
    /// Pairs scoring at or above this are merged (inclusive).
    pub accept_threshold: f64,
    /// Pairs in [review_threshold, accept_threshold) are reported, not merged.
    pub review_threshold: f64,
    /// Characters of the normalized company name used as a blocking key.
    pub name_prefix_len: usize,
    /// Temporal proximity reaches zero at this many days apart.
    pub temporal_tolerance_days: f64,
    /// Amount proximity reaches zero at this relative difference.
    pub amount_tolerance: f64,
    /// Buckets above this size are skipped.
    pub max_bucket_size: usize,
    /// Fields merged by record completeness instead of recency.
    pub numeric_fields: Vec<String>,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            weights: MatchWeights::default(),
            accept_threshold: 0.70,
            review_threshold: 0.50,
            name_prefix_len: 4,
            temporal_tolerance_days: 7.0,
            amount_tolerance: 0.10,
            max_bucket_size: 1000,
            numeric_fields: vec!["amount".into(), "previous_amount".into()],
        }
    }
}

impl ResolutionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.weights.validate()?;
        check_unit("accept_threshold", self.accept_threshold)?;
        check_unit("review_threshold", self.review_threshold)?;
        if self.review_threshold > self.accept_threshold {
            return Err(ConfigError::InvalidSetting {
                name: "review_threshold",
                reason: format!(
                    "{} exceeds accept_threshold {}",
                    self.review_threshold, self.accept_threshold
                ),
            });
        }
        if self.name_prefix_len == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "name_prefix_len",
                reason: "must be at least 1".into(),
            });
        }
        check_positive("temporal_tolerance_days", self.temporal_tolerance_days)?;
        check_positive("amount_tolerance", self.amount_tolerance)?;
        if self.max_bucket_size < 2 {
            return Err(ConfigError::InvalidSetting {
                name: "max_bucket_size",
                reason: "must allow at least one pair".into(),
            });
        }
        Ok(())
    }
}

// ── Metrics ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Allowed absolute gap between a decomposed total and its components.
    pub decomposition_tolerance: f64,
    /// Custom ontology JSON; the built-in revenue ontology when absent.
    pub ontology_path: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            decomposition_tolerance: 1e-6,
            ontology_path: None,
        }
    }
}

impl MetricsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.decomposition_tolerance >= 0.0) {
            return Err(ConfigError::InvalidSetting {
                name: "decomposition_tolerance",
                reason: format!("must be non-negative, got {}", self.decomposition_tolerance),
            });
        }
        Ok(())
    }
}

// ── Anomaly detection ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Trailing periods forming the z-score baseline.
    pub window: usize,
    /// |z| above this is anomalous.
    pub z_threshold: f64,
    /// |period-over-period change| above this fraction is anomalous.
    pub rate_threshold: f64,
    /// Earlier changes needed before rate of change is judged against the
    /// series' own history instead of `rate_threshold`.
    pub rate_history: usize,
    /// |z| of a change against earlier changes at or above this is anomalous.
    pub rate_z_threshold: f64,
    /// Also scan the component series of decomposition metrics.
    pub detect_components: bool,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window: 6,
            z_threshold: 2.0,
            rate_threshold: 0.15,
            rate_history: 7,
            rate_z_threshold: 2.0,
            detect_components: true,
        }
    }
}

impl AnomalyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window < 2 {
            return Err(ConfigError::InvalidSetting {
                name: "window",
                reason: format!("needs at least 2 periods, got {}", self.window),
            });
        }
        check_positive("z_threshold", self.z_threshold)?;
        check_positive("rate_threshold", self.rate_threshold)?;
        if self.rate_history < 2 {
            return Err(ConfigError::InvalidSetting {
                name: "rate_history",
                reason: format!("needs at least 2 earlier changes, got {}", self.rate_history),
            });
        }
        check_positive("rate_z_threshold", self.rate_z_threshold)?;
        Ok(())
    }
}

// ── Top level ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub resolution: ResolutionConfig,
    pub metrics:    MetricsConfig,
    pub anomaly:    AnomalyConfig,
}

impl PipelineConfig {
    /// Load and validate a JSON config file.
    /// In tests, use `PipelineConfig::default()`.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config = Self::from_json(&content)?;
        Ok(config)
    }

    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_json::from_str(input).map_err(|e| ConfigError::Parse {
            what: "pipeline config",
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resolution.validate()?;
        self.metrics.validate()?;
        self.anomaly.validate()?;
        Ok(())
    }
}

fn check_unit(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::ThresholdOutOfRange { name, value });
    }
    Ok(())
}

fn check_positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(value > 0.0 && value.is_finite()) {
        return Err(ConfigError::InvalidSetting {
            name,
            reason: format!("must be a positive number, got {value}"),
        });
    }
    Ok(())
}
