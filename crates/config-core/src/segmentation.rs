//! Deterministic (property, seed) → bucket mapping.
//!
//! The hash is FNV-1a 64-bit, chosen because it is small, has no external
//! dependency, and is trivial to freeze: the exact byte sequence hashed is
//! `seed.as_bytes() ++ [0x00] ++ json_stringify(property_value).as_bytes()`.
//! This algorithm must never change — changing it reshuffles every
//! segmentation override silently. If it ever needs to change, ship it as a
//! new operator, not a patch to this one.

use serde_json::Value;

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Canonical JSON stringification used as hash input. `serde_json`'s default
/// `to_string` is stable for a given value shape, which is all the
/// determinism this needs (we never compare stringifications across
/// versions of this crate with differently-ordered object keys because
/// property values passed to segmentation are scalars in practice, and
/// object/array inputs still hash consistently within a single process).
fn stringify(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Compute the bucket in `[0, 100)` for a given seed and context property value.
pub fn bucket(seed: &str, property_value: &Value) -> u8 {
    let mut data = Vec::with_capacity(seed.len() + 1 + 16);
    data.extend_from_slice(seed.as_bytes());
    data.push(0u8);
    data.extend_from_slice(stringify(property_value).as_bytes());
    let hash = fnv1a64(&data);
    (hash % 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Golden vectors: frozen on first implementation. Any change here
    /// silently reshuffles every segmentation override in production and
    /// must never happen without a deliberate migration.
    #[test]
    fn golden_vectors() {
        let cases: &[(&str, Value, u8)] = &[
            ("exp-1", json!("u-001"), 45),
            ("exp-1", json!("u-042"), 86),
            ("seed", json!("alice"), 60),
            ("", json!("x"), 5),
            ("exp-1", json!(1), 85),
            ("exp-1", json!(true), 74),
        ];
        for (seed, value, expected) in cases {
            assert_eq!(
                bucket(seed, value),
                *expected,
                "seed={seed:?} value={value:?}"
            );
        }
    }

    #[test]
    fn bucket_is_always_in_range() {
        for i in 0..1000 {
            let v = json!(format!("user-{i}"));
            let b = bucket("some-seed", &v);
            assert!(b < 100);
        }
    }

    #[test]
    fn bucket_is_deterministic() {
        let v = json!("stable-user");
        let b1 = bucket("seed-a", &v);
        let b2 = bucket("seed-a", &v);
        assert_eq!(b1, b2);
    }

    #[test]
    fn different_seeds_can_diverge() {
        let v = json!("same-user");
        let b1 = bucket("seed-a", &v);
        let b2 = bucket("seed-b", &v);
        // Not a hard guarantee for every input, but true for these fixtures
        // and worth pinning so accidental seed-ignoring bugs get caught.
        assert_ne!(b1, b2);
    }
}
