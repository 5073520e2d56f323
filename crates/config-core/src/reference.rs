//! Expand `reference`-typed condition values into literals, given a
//! config-fetch callback. Called before evaluation.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::condition::{Condition, ConditionValue};
use crate::path::get_path;
use crate::types::Override;

/// Cut cyclic/self-referential resolution chains at this depth. Identity is
/// `(projectId, configName, path)`, which can legitimately recur at
/// different depths, so this is a counter, not a visited set.
///
/// The hop that matters for cycle detection isn't visible in this module:
/// a referenced config's "effective value" may itself have been produced by
/// resolving *its* reference-bearing overrides, and that resolution happens
/// behind [`ConfigValueFetcher::fetch_config_value`], inside whichever
/// adapter owns the store. So the counter is threaded through the fetcher
/// call, not just through `render_condition`/`render_value`: a fetcher that
/// recurses into a referenced config's own overrides must pass
/// `depth` through unchanged to that recursive resolution, incrementing it
/// itself (by calling back into [`render_value`]/[`render_overrides`] with
/// `depth + 1`) on each further hop. This file guarantees only one hop's
/// worth of incrementing; the fetcher is responsible for the rest.
pub const MAX_RESOLUTION_DEPTH: u32 = 8;

/// Fetches the effective value of another config for reference resolution.
/// Implemented by the adapter that owns the primary (or replica) store.
///
/// `depth` is the resolution depth so far, already incremented for this
/// hop. An implementation whose own resolution of `config_name` recurses
/// into further references (directly, or by calling back into
/// [`render_value`]) must check `depth >= MAX_RESOLUTION_DEPTH` itself and
/// return `None` rather than recursing further, and must pass `depth + 1`
/// into that recursive call — this is what makes the cap apply across
/// reference hops instead of just within a single condition tree.
#[async_trait]
pub trait ConfigValueFetcher: Send + Sync {
    async fn fetch_config_value(
        &self,
        project_id: Uuid,
        config_name: &str,
        environment_id: Option<&str>,
        depth: u32,
    ) -> Option<Value>;
}

/// Render every `reference` leaf in `overrides` into a literal (or the
/// `Unresolved` sentinel), preserving declaration order and tree shape.
pub async fn render_overrides(
    overrides: &[Override],
    environment_id: Option<&str>,
    fetcher: &dyn ConfigValueFetcher,
) -> Vec<Override> {
    render_overrides_at_depth(overrides, environment_id, fetcher, 0).await
}

/// Same as [`render_overrides`], but starting from a caller-supplied depth.
/// A [`ConfigValueFetcher`] that recurses into a referenced config's own
/// overrides calls this (not [`render_overrides`]) so the cycle cap
/// threads across the hop.
pub async fn render_overrides_at_depth(
    overrides: &[Override],
    environment_id: Option<&str>,
    fetcher: &dyn ConfigValueFetcher,
    depth: u32,
) -> Vec<Override> {
    let mut out = Vec::with_capacity(overrides.len());
    for ov in overrides {
        let mut conditions = Vec::with_capacity(ov.conditions.len());
        for c in &ov.conditions {
            conditions.push(render_condition(c, environment_id, fetcher, depth).await);
        }
        out.push(Override {
            name: ov.name.clone(),
            conditions,
            value: ov.value.clone(),
        });
    }
    out
}

fn render_condition<'a>(
    condition: &'a Condition,
    environment_id: Option<&'a str>,
    fetcher: &'a dyn ConfigValueFetcher,
    depth: u32,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Condition> + Send + 'a>> {
    Box::pin(async move {
        match condition {
            Condition::Equals { property, value } => Condition::Equals {
                property: property.clone(),
                value: render_value(value, environment_id, fetcher, depth).await,
            },
            Condition::In { property, value } => Condition::In {
                property: property.clone(),
                value: render_value(value, environment_id, fetcher, depth).await,
            },
            Condition::NotIn { property, value } => Condition::NotIn {
                property: property.clone(),
                value: render_value(value, environment_id, fetcher, depth).await,
            },
            Condition::LessThan { property, value } => Condition::LessThan {
                property: property.clone(),
                value: render_value(value, environment_id, fetcher, depth).await,
            },
            Condition::LessThanOrEqual { property, value } => Condition::LessThanOrEqual {
                property: property.clone(),
                value: render_value(value, environment_id, fetcher, depth).await,
            },
            Condition::GreaterThan { property, value } => Condition::GreaterThan {
                property: property.clone(),
                value: render_value(value, environment_id, fetcher, depth).await,
            },
            Condition::GreaterThanOrEqual { property, value } => Condition::GreaterThanOrEqual {
                property: property.clone(),
                value: render_value(value, environment_id, fetcher, depth).await,
            },
            Condition::Segmentation { .. } => condition.clone(),
            Condition::And { conditions } => {
                let mut rendered = Vec::with_capacity(conditions.len());
                for c in conditions {
                    rendered.push(render_condition(c, environment_id, fetcher, depth).await);
                }
                Condition::And { conditions: rendered }
            }
            Condition::Or { conditions } => {
                let mut rendered = Vec::with_capacity(conditions.len());
                for c in conditions {
                    rendered.push(render_condition(c, environment_id, fetcher, depth).await);
                }
                Condition::Or { conditions: rendered }
            }
            Condition::Not { condition } => Condition::Not {
                condition: Box::new(render_condition(condition, environment_id, fetcher, depth).await),
            },
        }
    })
}

async fn render_value(
    value: &ConditionValue,
    environment_id: Option<&str>,
    fetcher: &dyn ConfigValueFetcher,
    depth: u32,
) -> ConditionValue {
    let ConditionValue::Reference {
        project_id,
        config_name,
        path,
    } = value
    else {
        return value.clone();
    };

    if depth >= MAX_RESOLUTION_DEPTH {
        return ConditionValue::Unresolved;
    }

    let Some(config_value) = fetcher
        .fetch_config_value(*project_id, config_name, environment_id, depth + 1)
        .await
    else {
        return ConditionValue::Unresolved;
    };

    match get_path(&config_value, path) {
        Some(resolved) => ConditionValue::Literal {
            value: resolved.clone(),
        },
        None => ConditionValue::Unresolved,
    }
}
