pub mod plan;
pub mod run;
pub mod serve;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use medallion::config::{load_config, PipelineConfig};
use medallion::executor::Runtime;
use medallion::stages::{register_commands, Registry};

/// Loads the config and wires its command-backed units into a runtime.
pub fn load_runtime(config_path: &Path) -> Result<(PipelineConfig, Arc<Runtime>)> {
    let config = load(config_path)?;

    let registry = Registry::new();
    register_commands(&registry, &config);
    let runtime = Runtime::from_config(&config, Arc::new(registry))
        .with_context(|| format!("Invalid pipeline: {}", config_path.display()))?;

    tracing::info!(
        pipeline = %config.name,
        stages = config.stages.len(),
        units = config.units.len(),
        checks = config.checks.len(),
        "Pipeline loaded"
    );
    Ok((config, Arc::new(runtime)))
}

/// Parses the pipeline YAML at `config_path`.
pub fn load(config_path: &Path) -> Result<PipelineConfig> {
    load_config(config_path)
        .with_context(|| format!("Failed to load pipeline: {}", config_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const PIPELINE: &str = r#"
name: orders
stages:
  - {name: orders_raw, layer: bronze, unit: extract}
  - {name: orders_clean, layer: silver, unit: clean, depends_on: [orders_raw]}
units:
  extract: {program: "true"}
  clean: {program: "true"}
storage:
  staging_dir: staging
  output_dir: output
"#;

    fn write(dir: &Path, yaml: &str) -> std::path::PathBuf {
        let path = dir.join("pipeline.yaml");
        fs::write(&path, yaml).unwrap();
        path
    }

    #[tokio::test]
    async fn test_load_runtime_registers_commands() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), PIPELINE);

        let (config, runtime) = load_runtime(&path).unwrap();

        assert_eq!(config.name, "orders");
        assert_eq!(runtime.registry.unit_names(), vec!["clean", "extract"]);
        assert_eq!(config.storage.staging_dir, dir.path().join("staging"));
    }

    #[tokio::test]
    async fn test_load_runtime_rejects_unknown_unit() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), &PIPELINE.replace("unit: clean", "unit: missing"));

        let err = load_runtime(&path).unwrap_err();

        assert!(format!("{err:#}").contains("missing"));
    }

    #[test]
    fn test_plan_unknown_start_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), PIPELINE);

        assert!(plan::execute(&path, Some("orders_clean")).is_ok());
        assert!(plan::execute(&path, Some("nope")).is_err());
    }
}
