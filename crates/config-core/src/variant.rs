//! Per-environment variant selection and schema inheritance.

use crate::types::{Config, Override};

/// The effective (value, schema, overrides) triple for a given environment,
/// before any override evaluation or reference resolution runs. Schemas are
/// advisory at read time — they are enforced only on the write path.
pub struct EffectiveVariant<'a> {
    pub value: &'a serde_json::Value,
    pub schema: Option<&'a serde_json::Value>,
    pub overrides: &'a [Override],
}

/// Resolve the effective variant for `environment_id`. Falls back to the
/// base variant if no environment-specific variant exists, and falls back
/// to the base schema when the environment variant has `use_base_schema`.
pub fn resolve_effective_variant<'a>(config: &'a Config, environment_id: &str) -> EffectiveVariant<'a> {
    match config.variant_for(environment_id) {
        Some(variant) => {
            let schema = if variant.use_base_schema {
                config.base.schema.as_ref()
            } else {
                variant.body.schema.as_ref()
            };
            EffectiveVariant {
                value: &variant.body.value,
                schema,
                overrides: &variant.body.overrides,
            }
        }
        None => EffectiveVariant {
            value: &config.base.value,
            schema: config.base.schema.as_ref(),
            overrides: &config.base.overrides,
        },
    }
}
