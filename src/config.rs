use serde::{Deserialize, Serialize};

use crate::error::{Cl2dError, Cl2dResult};

/// Similarity measure used to score an aligned image against a prototype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMode {
    /// Normalized correlation inside the circular mask.
    Correlation,
    /// Gaussian-kernel correntropy inside the circular mask. More robust to
    /// outlier pixels at low SNR.
    Correntropy,
}

/// Parameters of a classification run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Cl2dConfig {
    /// Maximum number of rounds per level (also caps split refinement).
    pub max_iterations: usize,

    /// Number of classes to start with when no prototypes are supplied.
    pub initial_classes: usize,

    /// Target number of classes; levels keep splitting until reached.
    pub final_classes: usize,

    /// Number of neighbour classes each image is compared against besides
    /// its previous class. `None` compares against every class.
    pub neighbours: Option<usize>,

    /// Minimum class size as a percentage of the mean class size.
    pub min_size_percent: f64,

    pub similarity: SimilarityMode,

    /// Rank by raw score instead of histogram likelihood.
    pub classical_multiref: bool,

    /// Maximum allowed shift in pixels.
    pub max_shift: f64,

    /// Assign every image to its best class even when no fit is positive.
    pub classify_all_images: bool,

    /// Numerator of the exploration probability, in images.
    pub exploration_images: f64,

    /// Per-member weight in the exploration probability denominator.
    pub exploration_class_factor: f64,

    /// Upper bound on split attempts before falling back to the first one.
    pub max_split_attempts: usize,

    /// Base seed; worker `r` uses `seed + r`.
    pub seed: u64,
}

impl Default for Cl2dConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            initial_classes: 2,
            final_classes: 16,
            neighbours: Some(4),
            min_size_percent: 20.0,
            similarity: SimilarityMode::Correntropy,
            classical_multiref: false,
            max_shift: 10.0,
            classify_all_images: false,
            exploration_images: 1000.0,
            exploration_class_factor: 3.0,
            max_split_attempts: 8,
            seed: 42,
        }
    }
}

impl Cl2dConfig {
    /// Validate configuration parameters.
    pub fn validate(&self) -> Cl2dResult<()> {
        if self.max_iterations < 1 {
            return Err(Cl2dError::Config(
                "max_iterations must be >= 1".to_string(),
            ));
        }
        if self.initial_classes < 1 {
            return Err(Cl2dError::Config(format!(
                "initial_classes must be >= 1, got {}",
                self.initial_classes
            )));
        }
        if self.final_classes < self.initial_classes {
            return Err(Cl2dError::Config(format!(
                "final_classes ({}) must be >= initial_classes ({})",
                self.final_classes, self.initial_classes
            )));
        }
        if !(0.0..=100.0).contains(&self.min_size_percent) {
            return Err(Cl2dError::Config(format!(
                "min_size_percent must be in [0, 100], got {}",
                self.min_size_percent
            )));
        }
        if !(self.max_shift > 0.0) {
            return Err(Cl2dError::Config(format!(
                "max_shift must be > 0, got {}",
                self.max_shift
            )));
        }
        if !(self.exploration_images > 0.0) || !(self.exploration_class_factor > 0.0) {
            return Err(Cl2dError::Config(format!(
                "exploration constants must be > 0, got {} and {}",
                self.exploration_images, self.exploration_class_factor
            )));
        }
        if self.max_split_attempts < 1 {
            return Err(Cl2dError::Config(
                "max_split_attempts must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Load from a JSON string. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Cl2dResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Cl2dError::Config(format!("JSON parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Probability of comparing an image against a class outside the
    /// neighbourhood of its previous class. Grows as that class shrinks.
    pub fn exploration_probability(&self, previous_class_size: usize) -> f64 {
        let denominator = self.exploration_class_factor * previous_class_size.max(1) as f64;
        (self.exploration_images / denominator).min(1.0)
    }

    /// Squared shift limit used by the alignment validity check.
    pub fn max_shift2(&self) -> f64 {
        self.max_shift * self.max_shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Cl2dConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.similarity, SimilarityMode::Correntropy);
        assert_eq!(config.neighbours, Some(4));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = Cl2dConfig::from_json(
            r#"{"final_classes": 8, "similarity": "correlation", "neighbours": null}"#,
        )
        .unwrap();
        assert_eq!(config.final_classes, 8);
        assert_eq!(config.similarity, SimilarityMode::Correlation);
        assert_eq!(config.neighbours, None);
        assert_eq!(config.max_iterations, 20);
    }

    #[test]
    fn rejects_shrinking_class_count() {
        let config = Cl2dConfig {
            initial_classes: 4,
            final_classes: 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Cl2dError::Config(_))));
    }

    #[test]
    fn rejects_bad_json() {
        assert!(Cl2dConfig::from_json("{not json").is_err());
        assert!(Cl2dConfig::from_json(r#"{"max_shift": -1.0}"#).is_err());
    }

    #[test]
    fn exploration_probability_grows_as_class_shrinks() {
        let config = Cl2dConfig {
            exploration_images: 100.0,
            ..Default::default()
        };
        let big = config.exploration_probability(1000);
        let small = config.exploration_probability(50);
        assert!(small > big);
        assert!((config.exploration_probability(0) - 1.0).abs() < 1e-12);
        assert!((big - 100.0 / 3000.0).abs() < 1e-12);
    }
}
