//! Dotted/bracket path parsing and value extraction on JSON-shaped data.
//!
//! Syntax: `.key` for object keys, `[index]` for array indices, and
//! `["quoted key"]` for keys containing special characters. An empty
//! path string refers to the root value.

use serde_json::Value;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Path(pub Vec<PathSegment>);

impl Path {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Parse a path string into an ordered list of segments.
///
/// Grammar (informal): a leading key may omit its dot (`foo.bar`,
/// `foo[0].bar`, `["weird key"].bar`). Brackets may hold either an
/// unsigned integer index or a double-quoted key.
pub fn parse_path(input: &str) -> Result<Path, ConfigError> {
    let mut segments = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0usize;
    let mut first = true;

    while i < bytes.len() {
        match bytes[i] {
            b'.' => {
                i += 1;
                if i >= bytes.len() {
                    return Err(ConfigError::bad_request("path ends with trailing '.'"));
                }
                let (key, next) = read_bare_key(input, i)?;
                segments.push(PathSegment::Key(key));
                i = next;
            }
            b'[' => {
                let (seg, next) = read_bracket(input, i)?;
                segments.push(seg);
                i = next;
            }
            _ if first => {
                let (key, next) = read_bare_key(input, i)?;
                segments.push(PathSegment::Key(key));
                i = next;
            }
            _ => {
                return Err(ConfigError::bad_request(format!(
                    "unexpected character at offset {i} in path {input:?}"
                )));
            }
        }
        first = false;
    }

    Ok(Path(segments))
}

fn read_bare_key(input: &str, start: usize) -> Result<(String, usize), ConfigError> {
    let bytes = input.as_bytes();
    let mut i = start;
    while i < bytes.len() && bytes[i] != b'.' && bytes[i] != b'[' {
        i += 1;
    }
    if i == start {
        return Err(ConfigError::bad_request(format!(
            "empty key at offset {start} in path {input:?}"
        )));
    }
    Ok((input[start..i].to_string(), i))
}

fn read_bracket(input: &str, start: usize) -> Result<(PathSegment, usize), ConfigError> {
    let bytes = input.as_bytes();
    debug_assert_eq!(bytes[start], b'[');
    let close = input[start..]
        .find(']')
        .map(|p| p + start)
        .ok_or_else(|| ConfigError::bad_request(format!("unterminated '[' in path {input:?}")))?;
    let inner = &input[start + 1..close];
    let segment = if inner.starts_with('"') && inner.ends_with('"') && inner.len() >= 2 {
        PathSegment::Key(inner[1..inner.len() - 1].to_string())
    } else if let Ok(idx) = inner.parse::<usize>() {
        PathSegment::Index(idx)
    } else {
        return Err(ConfigError::bad_request(format!(
            "invalid bracket contents {inner:?} in path {input:?}"
        )));
    };
    Ok((segment, close + 1))
}

/// Extract the value at `path` within `root`, or `None` if any segment
/// fails to resolve (missing key, out-of-bounds index, or type mismatch).
pub fn get_path<'a>(root: &'a Value, path: &Path) -> Option<&'a Value> {
    let mut current = root;
    for segment in &path.0 {
        current = match (segment, current) {
            (PathSegment::Key(k), Value::Object(map)) => map.get(k)?,
            (PathSegment::Index(i), Value::Array(arr)) => arr.get(*i)?,
            _ => return None,
        };
    }
    Some(current)
}
