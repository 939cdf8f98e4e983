//! Flat-key configuration binding.
//!
//! Deployment configuration arrives as a flat mapping from dotted string
//! keys to string values, partitioned by convention into a `server.` group
//! (the embedded coordination server) and a `client.` group (the session
//! client). Binding is a pure mapping into the typed settings records:
//! each value is coerced by shape (integer, then boolean, then string) and
//! the result deserialized with serde. Unknown keys are ignored, missing
//! keys take the record's defaults.

use std::collections::HashMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use roost_coord::{ClientConfig, ServerConfig};

use crate::error::{ClusterError, ClusterResult};

/// Key prefix of the embedded-server settings group.
pub const SERVER_PREFIX: &str = "server.";
/// Key prefix of the client settings group.
pub const CLIENT_PREFIX: &str = "client.";
/// Default membership root path.
pub const DEFAULT_MEMBERSHIP_PATH: &str = "/roost/nodes";

/// Full configuration of one membership participant.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Root path under which one ephemeral sequential child per live
    /// process is created.
    pub membership_path: String,
    /// Embedded server settings; `None` means an external ensemble is
    /// expected and no server is started.
    pub server: Option<ServerConfig>,
    pub client: ClientConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            membership_path: DEFAULT_MEMBERSHIP_PATH.to_string(),
            server: None,
            client: ClientConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Bind a full configuration from a flat dotted-key map. An absent
    /// `server.` group means "no embedded server".
    pub fn from_properties(map: &HashMap<String, String>) -> ClusterResult<Self> {
        let server_keys = sub_map(map, SERVER_PREFIX);
        let server = if server_keys.is_empty() {
            None
        } else {
            Some(bind_settings::<ServerConfig>(&server_keys)?)
        };
        let client = bind_settings::<ClientConfig>(&sub_map(map, CLIENT_PREFIX))?;
        let membership_path = map
            .get("membership_path")
            .cloned()
            .unwrap_or_else(|| DEFAULT_MEMBERSHIP_PATH.to_string());
        Ok(Self {
            membership_path,
            server,
            client,
        })
    }
}

/// Entries of `map` whose key starts with `prefix`, with the prefix
/// stripped.
pub fn sub_map(map: &HashMap<String, String>, prefix: &str) -> HashMap<String, String> {
    map.iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(prefix)
                .map(|stripped| (stripped.to_string(), value.clone()))
        })
        .collect()
}

/// Populate a settings record from string key/value pairs.
///
/// Keys are normalized to field names (`-` and `.` become `_`); values are
/// coerced by shape. Unknown keys are ignored.
pub fn bind_settings<T: DeserializeOwned>(map: &HashMap<String, String>) -> ClusterResult<T> {
    let mut object = serde_json::Map::new();
    for (key, value) in map {
        let field = normalize_key(key);
        object.insert(field, coerce_value(value));
    }
    serde_json::from_value(Value::Object(object))
        .map_err(|e| ClusterError::Config(e.to_string()))
}

/// Coerce a string value: integer if it parses as one, boolean for
/// `true`/`false`, otherwise the string itself.
fn coerce_value(value: &str) -> Value {
    if let Ok(n) = value.parse::<i64>() {
        return Value::Number(n.into());
    }
    match value {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(value.to_string()),
    }
}

fn normalize_key(key: &str) -> String {
    key.replace(['-', '.'], "_")
}

/// Load a flat key/value map from a `.properties`-style file: one
/// `key=value` per line, `#` starts a comment.
pub fn load_properties(path: &Path) -> std::io::Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)?;
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            debug!(%line, "skipping malformed property line");
            continue;
        };
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(map)
}
