//! YAML loading with environment variable substitution.

use regex::{Captures, Regex};
use std::path::Path;
use std::sync::OnceLock;

use super::PipelineConfig;
use crate::errors::{ConfigurationError, MedallionError};

#[allow(clippy::expect_used)]
fn env_var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"))
}

/// Substitutes `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigurationError> {
    let mut missing: Vec<String> = Vec::new();
    let result = env_var_re().replace_all(input, |cap: &Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_else(|_| {
            if !missing.iter().any(|m| m == &cap[1]) {
                missing.push(cap[1].to_string());
            }
            String::new()
        })
    });

    if !missing.is_empty() {
        return Err(ConfigurationError::invalid(
            "CONFIG-MISSING-ENV",
            format!("Missing environment variable(s): {}", missing.join(", ")),
        ));
    }
    Ok(result.into_owned())
}

/// Parses a pipeline YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if substitution fails or the YAML does not match the model.
pub fn parse_config_str(yaml: &str) -> Result<PipelineConfig, ConfigurationError> {
    let substituted = substitute_env_vars(yaml)?;
    serde_yaml::from_str(&substituted).map_err(|e| {
        ConfigurationError::invalid("CONFIG-PARSE", format!("Failed to parse pipeline YAML: {e}"))
    })
}

/// Loads a pipeline file, resolving relative paths against its directory.
///
/// The stage graph is not built here; call [`PipelineConfig::build_graph`].
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<PipelineConfig, MedallionError> {
    let content = std::fs::read_to_string(path)?;
    let mut config = parse_config_str(&content)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    config.resolve_paths(base);
    tracing::debug!(path = %path.display(), pipeline = %config.name, "Configuration loaded");
    Ok(config)
}
