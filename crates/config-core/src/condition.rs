//! Condition language: types, parsing/validation, and structural walkers.
//!
//! A condition is a recursive discriminated tree over a closed operator
//! set. Leaf operators test a `property` (a string key into the caller's
//! evaluation context) against a [`ConditionValue`]; composite operators
//! combine child conditions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::path::{parse_path, Path};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionValue {
    Literal {
        value: serde_json::Value,
    },
    Reference {
        project_id: Uuid,
        config_name: String,
        path: Path,
    },
    /// Sentinel produced by the reference resolver when a reference could
    /// not be resolved (missing config, missing path, cycle cut at depth,
    /// or deadline expiry). Never appears in stored/authored conditions —
    /// only in the rendered tree passed to the evaluator.
    Unresolved,
}

impl ConditionValue {
    pub fn literal(value: serde_json::Value) -> Self {
        Self::Literal { value }
    }

    pub fn reference(project_id: Uuid, config_name: impl Into<String>, path: Path) -> Self {
        Self::Reference {
            project_id,
            config_name: config_name.into(),
            path,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "operator", rename_all = "snake_case")]
pub enum Condition {
    Equals {
        property: String,
        value: ConditionValue,
    },
    In {
        property: String,
        value: ConditionValue,
    },
    NotIn {
        property: String,
        value: ConditionValue,
    },
    LessThan {
        property: String,
        value: ConditionValue,
    },
    LessThanOrEqual {
        property: String,
        value: ConditionValue,
    },
    GreaterThan {
        property: String,
        value: ConditionValue,
    },
    GreaterThanOrEqual {
        property: String,
        value: ConditionValue,
    },
    Segmentation {
        property: String,
        #[serde(rename = "fromPercentage")]
        from_percentage: f64,
        #[serde(rename = "toPercentage")]
        to_percentage: f64,
        seed: String,
    },
    And {
        conditions: Vec<Condition>,
    },
    Or {
        conditions: Vec<Condition>,
    },
    Not {
        condition: Box<Condition>,
    },
}

impl Condition {
    /// A convenience constructor used heavily in tests and by callers
    /// building conditions programmatically rather than from JSON.
    pub fn equals(property: impl Into<String>, value: serde_json::Value) -> Self {
        Self::Equals {
            property: property.into(),
            value: ConditionValue::literal(value),
        }
    }

    pub fn segmentation(
        property: impl Into<String>,
        from_percentage: f64,
        to_percentage: f64,
        seed: impl Into<String>,
    ) -> Self {
        Self::Segmentation {
            property: property.into(),
            from_percentage,
            to_percentage,
            seed: seed.into(),
        }
    }

    /// Validate structural rules that can't be expressed in the type alone
    /// (percentage bounds, non-empty seed, non-empty `not` — the latter is
    /// actually enforced by the type, since `Not` carries exactly one
    /// `Box<Condition>`).
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Condition::Segmentation {
                from_percentage,
                to_percentage,
                seed,
                ..
            } => {
                if !(0.0..=100.0).contains(from_percentage) || !(0.0..=100.0).contains(to_percentage)
                {
                    return Err(ConfigError::bad_request(
                        "segmentation fromPercentage/toPercentage must be in [0, 100]",
                    ));
                }
                if from_percentage > to_percentage {
                    return Err(ConfigError::bad_request(
                        "segmentation fromPercentage must be <= toPercentage",
                    ));
                }
                if seed.is_empty() {
                    return Err(ConfigError::bad_request("segmentation seed must be non-empty"));
                }
                Ok(())
            }
            Condition::In { value, .. } | Condition::NotIn { value, .. } => {
                if let ConditionValue::Literal { value } = value {
                    if !value.is_array() {
                        return Err(ConfigError::bad_request(
                            "in/not_in literal value must be an array",
                        ));
                    }
                }
                Ok(())
            }
            Condition::And { conditions } | Condition::Or { conditions } => {
                for c in conditions {
                    c.validate()?;
                }
                Ok(())
            }
            Condition::Not { condition } => condition.validate(),
            Condition::Equals { .. }
            | Condition::LessThan { .. }
            | Condition::LessThanOrEqual { .. }
            | Condition::GreaterThan { .. }
            | Condition::GreaterThanOrEqual { .. } => Ok(()),
        }
    }

    /// All leaf properties referenced anywhere in this tree, for context
    /// field extraction (e.g. to tell an SDK caller which context keys a
    /// config's overrides might read).
    pub fn properties(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_properties(&mut out);
        out
    }

    fn collect_properties<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Equals { property, .. }
            | Condition::In { property, .. }
            | Condition::NotIn { property, .. }
            | Condition::LessThan { property, .. }
            | Condition::LessThanOrEqual { property, .. }
            | Condition::GreaterThan { property, .. }
            | Condition::GreaterThanOrEqual { property, .. }
            | Condition::Segmentation { property, .. } => out.push(property),
            Condition::And { conditions } | Condition::Or { conditions } => {
                for c in conditions {
                    c.collect_properties(out);
                }
            }
            Condition::Not { condition } => condition.collect_properties(out),
        }
    }

    /// All `{projectId, configName, path}` references anywhere in this tree,
    /// used to enforce the same-project invariant and to drive reference
    /// resolution.
    pub fn references(&self) -> Vec<(&Uuid, &str, &Path)> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<(&'a Uuid, &'a str, &'a Path)>) {
        let leaf_value = match self {
            Condition::Equals { value, .. }
            | Condition::In { value, .. }
            | Condition::NotIn { value, .. }
            | Condition::LessThan { value, .. }
            | Condition::LessThanOrEqual { value, .. }
            | Condition::GreaterThan { value, .. }
            | Condition::GreaterThanOrEqual { value, .. } => Some(value),
            Condition::Segmentation { .. } => None,
            Condition::And { conditions } | Condition::Or { conditions } => {
                for c in conditions {
                    c.collect_references(out);
                }
                None
            }
            Condition::Not { condition } => {
                condition.collect_references(out);
                None
            }
        };
        if let Some(ConditionValue::Reference {
            project_id,
            config_name,
            path,
        }) = leaf_value
        {
            out.push((project_id, config_name, path));
        }
    }
}

/// Parse a raw path string embedded in a JSON reference (the wire format
/// carries `path` as a dotted/bracket string; storage carries the already
/// parsed [`Path`]). Exposed for adapters translating wire JSON.
pub fn parse_reference_path(raw: &str) -> Result<Path, ConfigError> {
    parse_path(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn segmentation_rejects_out_of_range_bounds() {
        let c = Condition::segmentation("userId", -1.0, 50.0, "seed");
        assert!(c.validate().is_err());
    }

    #[test]
    fn segmentation_rejects_from_greater_than_to() {
        let c = Condition::segmentation("userId", 60.0, 50.0, "seed");
        assert!(c.validate().is_err());
    }

    #[test]
    fn segmentation_rejects_empty_seed() {
        let c = Condition::segmentation("userId", 0.0, 50.0, "");
        assert!(c.validate().is_err());
    }

    #[test]
    fn in_requires_array_literal() {
        let c = Condition::In {
            property: "plan".into(),
            value: ConditionValue::literal(json!("not-an-array")),
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn in_accepts_array_literal() {
        let c = Condition::In {
            property: "plan".into(),
            value: ConditionValue::literal(json!(["a", "b"])),
        };
        assert!(c.validate().is_ok());
    }

    #[test]
    fn and_or_accept_empty_children() {
        assert!(Condition::And { conditions: vec![] }.validate().is_ok());
        assert!(Condition::Or { conditions: vec![] }.validate().is_ok());
    }

    #[test]
    fn properties_collects_nested_leaves() {
        let c = Condition::And {
            conditions: vec![
                Condition::equals("plan", json!("premium")),
                Condition::Not {
                    condition: Box::new(Condition::segmentation("userId", 0.0, 10.0, "s")),
                },
            ],
        };
        let mut props = c.properties();
        props.sort();
        assert_eq!(props, vec!["plan", "userId"]);
    }

    #[test]
    fn references_collects_nested_refs() {
        let project = Uuid::new_v4();
        let c = Condition::In {
            property: "user".into(),
            value: ConditionValue::reference(project, "vip-list", parse_path("users").unwrap()),
        };
        let refs = c.references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].1, "vip-list");
    }
}
