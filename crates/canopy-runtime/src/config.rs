//! Actor configuration.
//!
//! Optional JSON document, by default `actors.json` in the process working
//! directory, or a caller-supplied path/inline document. Keys are actor
//! names (or decapitalized names); values are option records merged under
//! the explicit `create_child` options, which win per field.

use crate::actor::{CreateOptions, OnCrash};
use crate::error::{ActorError, Result};
use canopy_protocol::Mode;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub(crate) const DEFAULT_PORT: u16 = 6161;
const DEFAULT_CONFIG_FILE: &str = "actors.json";

#[derive(Debug, Clone, Default)]
pub(crate) struct ActorConfig {
    doc: Map<String, Value>,
}

impl ActorConfig {
    /// Load configuration. An explicit path must exist and parse; the
    /// default location is optional. An inline document extends whatever
    /// the file provided.
    pub fn load(path: Option<&Path>, inline: Option<Map<String, Value>>) -> Result<Self> {
        let mut doc = match path {
            Some(path) => Self::parse_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::parse_file(default)?
                } else {
                    Map::new()
                }
            }
        };
        if let Some(inline) = inline {
            for (key, value) in inline {
                doc.insert(key, value);
            }
        }
        Ok(Self { doc })
    }

    pub fn from_doc(doc: Map<String, Value>) -> Self {
        Self { doc }
    }

    fn parse_file(path: &Path) -> Result<Map<String, Value>> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            ActorError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        let value: Value = serde_json::from_str(&contents).map_err(|err| {
            ActorError::Config(format!("cannot parse {}: {err}", path.display()))
        })?;
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(ActorError::Config(format!(
                "{} must contain a JSON object",
                path.display()
            ))),
        }
    }

    pub fn doc(&self) -> &Map<String, Value> {
        &self.doc
    }

    /// Option record for an actor, by exact or decapitalized name.
    fn record_for(&self, name: &str) -> Option<&Map<String, Value>> {
        if name.is_empty() {
            return None;
        }
        self.doc
            .get(name)
            .or_else(|| self.doc.get(&decapitalize(name)))
            .and_then(Value::as_object)
    }
}

fn decapitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Fully resolved creation options: explicit options over configuration
/// over defaults, with cluster endpoints expanded.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedOptions {
    pub name: String,
    pub mode: Mode,
    pub cluster_size: usize,
    pub endpoints: Vec<(String, u16)>,
    pub ping_timeout: Duration,
    pub on_crash: OnCrash,
    pub custom_parameters: Map<String, Value>,
    pub config_doc: Map<String, Value>,
}

impl ResolvedOptions {
    pub fn in_memory(name: String, custom_parameters: Map<String, Value>) -> Self {
        Self {
            name,
            mode: Mode::InMemory,
            cluster_size: 1,
            endpoints: Vec::new(),
            ping_timeout: Duration::from_secs(15),
            on_crash: OnCrash::Fail,
            custom_parameters,
            config_doc: Map::new(),
        }
    }
}

/// Parse `host[:port]`, defaulting to the standard listen port.
pub(crate) fn parse_endpoint(s: &str) -> Result<(String, u16)> {
    match s.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| ActorError::Config(format!("invalid endpoint \"{s}\"")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((s.to_string(), DEFAULT_PORT)),
    }
}

pub(crate) fn resolve(
    config: &ActorConfig,
    clusters: &HashMap<String, Vec<String>>,
    default_ping_timeout: Duration,
    options: &CreateOptions,
) -> Result<ResolvedOptions> {
    let name = options.name.clone().unwrap_or_default();
    let empty = Map::new();
    let record = config.record_for(&name).unwrap_or(&empty);

    let mode = match options.mode {
        Some(mode) => mode,
        None => match record.get("mode").and_then(Value::as_str) {
            Some(s) => s.parse::<Mode>().map_err(ActorError::Config)?,
            None => Mode::InMemory,
        },
    };

    let cluster = options
        .cluster
        .clone()
        .or_else(|| record.get("cluster").and_then(Value::as_str).map(String::from));

    let hosts: Vec<String> = if !options.hosts.is_empty() {
        options.hosts.clone()
    } else {
        match record.get("host") {
            Some(Value::String(host)) => vec![host.clone()],
            Some(Value::Array(hosts)) => hosts
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        }
    };

    let endpoints: Vec<(String, u16)> = match &cluster {
        Some(cluster_name) => clusters
            .get(cluster_name)
            .ok_or_else(|| ActorError::Config(format!("unknown cluster \"{cluster_name}\"")))?
            .iter()
            .map(|s| parse_endpoint(s))
            .collect::<Result<_>>()?,
        None => hosts
            .iter()
            .map(|s| parse_endpoint(s))
            .collect::<Result<_>>()?,
    };

    let cluster_size = match options.cluster_size {
        Some(size) => size,
        None => match record.get("clusterSize").and_then(Value::as_u64) {
            Some(size) => size as usize,
            None if endpoints.len() > 1 => endpoints.len(),
            None => 1,
        },
    };
    if cluster_size == 0 {
        return Err(ActorError::Config("clusterSize must be at least 1".to_string()));
    }

    if mode == Mode::Remote && endpoints.is_empty() {
        return Err(ActorError::Config(format!(
            "remote actor \"{name}\" requires a host or cluster"
        )));
    }

    let ping_timeout = match options.ping_timeout {
        Some(timeout) => timeout,
        None => record
            .get("pingTimeout")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(default_ping_timeout),
    };

    let on_crash = match options.on_crash {
        Some(on_crash) => on_crash,
        None => match record.get("onCrash").and_then(Value::as_str) {
            Some("respawn") => OnCrash::Respawn,
            Some("fail") | None => OnCrash::Fail,
            Some(other) => {
                return Err(ActorError::Config(format!(
                    "unknown onCrash value \"{other}\""
                )))
            }
        },
    };

    let mut custom_parameters = record
        .get("customParameters")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    for (key, value) in options.custom_parameters.clone() {
        custom_parameters.insert(key, value);
    }

    Ok(ResolvedOptions {
        name,
        mode,
        cluster_size,
        endpoints,
        ping_timeout,
        on_crash,
        custom_parameters,
        config_doc: config.doc().clone(),
    })
}
