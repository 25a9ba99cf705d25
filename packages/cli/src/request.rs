// ABOUTME: Builds run requests from command-line options
// ABOUTME: Parses key=value params and name=path inputs

use anyhow::{bail, Context, Result};
use coderun_sandbox::RunRequest;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Split `key=value`, rejecting an empty key
pub fn split_pair(raw: &str) -> Result<(&str, &str)> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim(), value)),
        _ => bail!("Expected KEY=VALUE, got '{}'", raw),
    }
}

/// Param value as JSON when it parses, otherwise as a plain string
pub fn param_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Merge `--params` JSON object and `--param k=v` pairs, pairs win
pub fn parse_params(json: Option<&str>, pairs: &[String]) -> Result<Map<String, Value>> {
    let mut params = match json {
        Some(raw) => match serde_json::from_str::<Value>(raw).context("Invalid --params JSON")? {
            Value::Object(map) => map,
            other => bail!("--params must be a JSON object, got {}", other),
        },
        None => Map::new(),
    };

    for pair in pairs {
        let (key, value) = split_pair(pair)?;
        params.insert(key.to_string(), param_value(value));
    }
    Ok(params)
}

pub fn parse_inputs(pairs: &[String]) -> Result<Vec<(String, PathBuf)>> {
    pairs
        .iter()
        .map(|pair| {
            let (name, path) = split_pair(pair)?;
            Ok((name.to_string(), PathBuf::from(path)))
        })
        .collect()
}

/// Options of `coderun run`, independent of the argument parser
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub script: PathBuf,
    pub params_json: Option<String>,
    pub params: Vec<String>,
    pub dependencies: Vec<String>,
    pub inputs: Vec<String>,
    pub network: bool,
    pub run_id: Option<String>,
    pub code_version: Option<i64>,
}

impl RunOptions {
    pub fn into_request(self) -> Result<RunRequest> {
        let code = read_script(&self.script)?;
        let params = parse_params(self.params_json.as_deref(), &self.params)?;
        let run_id = self
            .run_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut request = RunRequest::new(code)
            .with_params(params)
            .with_dependencies(self.dependencies)
            .with_network(self.network)
            .with_run_id(run_id);
        if let Some(version) = self.code_version {
            request = request.with_code_version(version);
        }
        for (name, path) in parse_inputs(&self.inputs)? {
            request = request.with_input_file(name, path);
        }
        Ok(request)
    }
}

fn read_script(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script {}", path.display()))
}
