//! Deal stage classification.
//!
//! Every CRM deal stage falls into exactly one of three categories that
//! drive the reconciliation decision:
//!
//! - **Final**: the deal is closed (won or lost) and is never mutated again.
//! - **Protected**: a human moved the deal into a manually-curated stage;
//!   data fields may be refreshed but the stage itself must not be
//!   overwritten by automation.
//! - **Open**: normal, freely updatable.

use serde::Deserialize;

/// Classification of a deal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageClass {
    Open,
    Protected,
    Final,
}

impl std::fmt::Display for StageClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Protected => write!(f, "protected"),
            Self::Final => write!(f, "final"),
        }
    }
}

/// Configurable stage-id lists for classification.
///
/// The defaults mirror a stock pipeline: `WON`/`LOSE` are final, and the
/// three manually-curated stages are protected. Deployments with custom
/// pipelines override these lists in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StagePolicy {
    #[serde(default = "default_final_stages")]
    pub final_stages: Vec<String>,
    #[serde(default = "default_protected_stages")]
    pub protected_stages: Vec<String>,
}

fn default_final_stages() -> Vec<String> {
    vec!["WON".into(), "LOSE".into()]
}

fn default_protected_stages() -> Vec<String> {
    vec![
        "PLAN_PRESENTATION".into(),
        "PREPAYMENT_RECEIVED".into(),
        "WAITING_LIST".into(),
    ]
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            final_stages: default_final_stages(),
            protected_stages: default_protected_stages(),
        }
    }
}

impl StagePolicy {
    /// Classify a stage id. Unknown stages are open.
    #[must_use]
    pub fn classify(&self, stage_id: &str) -> StageClass {
        if self.final_stages.iter().any(|s| s == stage_id) {
            StageClass::Final
        } else if self.protected_stages.iter().any(|s| s == stage_id) {
            StageClass::Protected
        } else {
            StageClass::Open
        }
    }

    #[must_use]
    pub fn is_final(&self, stage_id: &str) -> bool {
        self.classify(stage_id) == StageClass::Final
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_final_stages() {
        let policy = StagePolicy::default();
        assert_eq!(policy.classify("WON"), StageClass::Final);
        assert_eq!(policy.classify("LOSE"), StageClass::Final);
    }

    #[test]
    fn test_default_protected_stages() {
        let policy = StagePolicy::default();
        assert_eq!(policy.classify("PLAN_PRESENTATION"), StageClass::Protected);
        assert_eq!(policy.classify("PREPAYMENT_RECEIVED"), StageClass::Protected);
        assert_eq!(policy.classify("WAITING_LIST"), StageClass::Protected);
    }

    #[test]
    fn test_unknown_stage_is_open() {
        let policy = StagePolicy::default();
        assert_eq!(policy.classify("NEW"), StageClass::Open);
        assert_eq!(policy.classify("TREATMENT"), StageClass::Open);
        assert_eq!(policy.classify(""), StageClass::Open);
    }

    #[test]
    fn test_custom_policy() {
        let policy = StagePolicy {
            final_stages: vec!["CLOSED".into()],
            protected_stages: vec!["MANUAL".into()],
        };
        assert_eq!(policy.classify("CLOSED"), StageClass::Final);
        assert_eq!(policy.classify("MANUAL"), StageClass::Protected);
        // Stock final stages are open under a custom policy
        assert_eq!(policy.classify("WON"), StageClass::Open);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let policy: StagePolicy = serde_json::from_str("{}").unwrap();
        assert!(policy.is_final("WON"));

        let policy: StagePolicy =
            serde_json::from_str(r#"{"final_stages": ["DONE"]}"#).unwrap();
        assert!(policy.is_final("DONE"));
        assert!(!policy.is_final("WON"));
        // Protected list keeps its default
        assert_eq!(policy.classify("WAITING_LIST"), StageClass::Protected);
    }
}
