use std::path::PathBuf;

use thiserror::Error;

/// A child could not be launched. Fatal for the run; never retried.
#[derive(Error, Debug)]
#[error("spawn {name} ({command}): {source}")]
pub struct SpawnError {
    pub name: String,
    pub command: String,
    #[source]
    pub source: std::io::Error,
}

/// One failed readiness attempt. Expected while the backend warms up.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("attempt timed out after {0}ms")]
    Timeout(u128),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("response body does not contain {0:?}")]
    Body(String),

    #[error("request failed: {0}")]
    Request(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing command for {role}")]
    MissingCommand { role: String },

    #[error("{role}: set either `command` or `program`, not both")]
    ConflictingCommand { role: String },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn error_chain_joins_causes() {
        let err = Err::<(), _>(std::io::Error::other("disk full"))
            .context("write record")
            .unwrap_err();
        assert_eq!(format_error_chain(&err), "write record: disk full");
    }

    #[test]
    fn spawn_error_names_the_process() {
        let err = SpawnError {
            name: "backend".to_string(),
            command: "ollama serve".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("spawn backend (ollama serve)"));
    }
}
