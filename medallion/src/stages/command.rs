//! Units, checks and deduplicators backed by external programs.
//!
//! A program receives its invocation through `MEDALLION_*` environment
//! variables and reports a JSON summary on the last non-empty stdout line.

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

use super::{Deduplicator, QualityCheck, Registry, StageContext, UnitOfWork, WorkOutput};
use crate::config::{CommandSpec, PipelineConfig};
use crate::core::{DatasetRef, QualityGateResult, Severity};
use crate::errors::{DeduplicationError, MedallionError, QualityGateError};

#[derive(Debug)]
struct CommandOutput {
    code: i32,
    last_line: Option<String>,
    stderr_tail: Option<String>,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.code == 0
    }

    fn failure_detail(&self, program: &str) -> String {
        match &self.stderr_tail {
            Some(tail) => format!("'{program}' exited with code {}: {tail}", self.code),
            None => format!("'{program}' exited with code {}", self.code),
        }
    }
}

fn last_non_empty(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

fn base_env(ctx: &StageContext) -> Vec<(&'static str, String)> {
    vec![
        ("MEDALLION_RUN_ID", ctx.run_id.clone()),
        ("MEDALLION_STAGE", ctx.stage.name.clone()),
        ("MEDALLION_LAYER", ctx.stage.layer.to_string()),
        ("MEDALLION_ATTEMPT", ctx.attempt.to_string()),
    ]
}

/// Runs `spec` to completion. Spawn failures and timeouts are transient.
async fn execute(
    spec: &CommandSpec,
    stage: &str,
    vars: Vec<(&'static str, String)>,
) -> Result<CommandOutput, MedallionError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .envs(vars)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|err| {
        MedallionError::transient(stage, format!("failed to spawn '{}': {err}", spec.program))
    })?;

    let output = tokio::time::timeout(spec.timeout(), child.wait_with_output())
        .await
        .map_err(|_| {
            MedallionError::transient(
                stage,
                format!(
                    "'{}' timed out after {}s",
                    spec.program,
                    spec.timeout().as_secs()
                ),
            )
        })?
        .map_err(|err| {
            MedallionError::transient(stage, format!("waiting for '{}': {err}", spec.program))
        })?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    for line in stderr.lines() {
        debug!(stage = %stage, program = %spec.program, "stderr: {}", line);
    }

    let code = output.status.code().unwrap_or(-1);
    debug!(stage = %stage, program = %spec.program, exit_code = code, "Command exited");

    Ok(CommandOutput {
        code,
        last_line: last_non_empty(&String::from_utf8_lossy(&output.stdout)),
        stderr_tail: last_non_empty(&stderr),
    })
}

/// A unit of work that shells out.
///
/// Besides the common variables the program sees `MEDALLION_SINCE`
/// (bronze baseline, empty when absent), `MEDALLION_OUTPUT` (staging path),
/// `MEDALLION_INPUTS` (JSON map of upstream stage to committed output) and
/// `MEDALLION_OPTIONS` (the stage's options as JSON).
#[derive(Debug, Clone)]
pub struct CommandUnit {
    name: String,
    spec: CommandSpec,
}

impl CommandUnit {
    /// Creates a command unit registered under `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }
}

#[async_trait]
impl UnitOfWork for CommandUnit {
    async fn run(&self, ctx: &StageContext) -> Result<WorkOutput, MedallionError> {
        let inputs: serde_json::Map<String, serde_json::Value> = ctx
            .inputs
            .iter()
            .map(|(stage, dataset)| (stage.clone(), dataset.uri.clone().into()))
            .collect();

        let mut vars = base_env(ctx);
        vars.push((
            "MEDALLION_SINCE",
            ctx.since.as_ref().map(ToString::to_string).unwrap_or_default(),
        ));
        vars.push(("MEDALLION_OUTPUT", ctx.staging.uri.clone()));
        vars.push(("MEDALLION_INPUTS", serde_json::to_string(&inputs)?));
        vars.push(("MEDALLION_OPTIONS", serde_json::to_string(&ctx.stage.options)?));

        let output = execute(&self.spec, ctx.stage_name(), vars).await?;
        if !output.success() {
            return Err(MedallionError::transient(
                ctx.stage_name(),
                output.failure_detail(&self.spec.program),
            ));
        }

        let summary = match output.last_line {
            Some(line) => serde_json::from_str::<WorkOutput>(&line).map_err(|err| {
                MedallionError::Serialization(format!(
                    "unit '{}' printed an invalid summary '{line}': {err}",
                    self.name
                ))
            })?,
            None => WorkOutput::default(),
        };
        info!(
            stage = %ctx.stage_name(),
            unit = %self.name,
            rows = summary.rows,
            "Unit finished"
        );
        Ok(summary)
    }
}

#[derive(Debug, Deserialize)]
struct ReportedResult {
    #[serde(default, alias = "name")]
    check: Option<String>,
    passed: bool,
    #[serde(default)]
    severity: Option<Severity>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReportedResults {
    Many(Vec<ReportedResult>),
    One(ReportedResult),
}

/// A quality check that shells out.
///
/// The program sees `MEDALLION_INPUT`, the dataset under test. A result
/// without a severity takes the spec's default severity.
#[derive(Debug, Clone)]
pub struct CommandCheck {
    name: String,
    spec: CommandSpec,
}

impl CommandCheck {
    /// Creates a command check registered under `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }

    fn default_severity(&self) -> Severity {
        self.spec.severity.unwrap_or_default()
    }
}

#[async_trait]
impl QualityCheck for CommandCheck {
    async fn evaluate(
        &self,
        ctx: &StageContext,
        dataset: &DatasetRef,
    ) -> Result<Vec<QualityGateResult>, MedallionError> {
        let mut vars = base_env(ctx);
        vars.push(("MEDALLION_INPUT", dataset.uri.clone()));

        let output = execute(&self.spec, ctx.stage_name(), vars).await?;
        if !output.success() {
            // A crashed evaluator counts as a blocking result.
            return Err(QualityGateError {
                stage: ctx.stage.name.clone(),
                failures: vec![QualityGateResult::new(
                    &self.name,
                    false,
                    Severity::Error,
                    output.failure_detail(&self.spec.program),
                )],
            }
            .into());
        }

        let Some(line) = output.last_line else {
            return Ok(vec![QualityGateResult::new(
                &self.name,
                true,
                self.default_severity(),
                "",
            )]);
        };
        let reported: ReportedResults = serde_json::from_str(&line).map_err(|err| {
            MedallionError::Serialization(format!(
                "check '{}' printed an invalid verdict '{line}': {err}",
                self.name
            ))
        })?;
        let reported = match reported {
            ReportedResults::Many(results) => results,
            ReportedResults::One(result) => vec![result],
        };

        Ok(reported
            .into_iter()
            .map(|r| {
                QualityGateResult::new(
                    r.check.unwrap_or_else(|| self.name.clone()),
                    r.passed,
                    r.severity.unwrap_or_else(|| self.default_severity()),
                    r.message,
                )
            })
            .collect())
    }
}

/// A deduplicator that shells out.
///
/// The program sees `MEDALLION_INPUT` (the staged dataset to rewrite in
/// place) and `MEDALLION_DEDUP_SETTINGS` (JSON).
#[derive(Debug, Clone)]
pub struct CommandDeduplicator {
    method: String,
    spec: CommandSpec,
}

impl CommandDeduplicator {
    /// Creates a command deduplicator registered under `method`.
    #[must_use]
    pub fn new(method: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            method: method.into(),
            spec,
        }
    }
}

#[async_trait]
impl Deduplicator for CommandDeduplicator {
    async fn deduplicate(
        &self,
        ctx: &StageContext,
        dataset: &DatasetRef,
        settings: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), MedallionError> {
        let mut vars = base_env(ctx);
        vars.push(("MEDALLION_INPUT", dataset.uri.clone()));
        vars.push(("MEDALLION_DEDUP_SETTINGS", serde_json::to_string(settings)?));

        let output = execute(&self.spec, ctx.stage_name(), vars).await?;
        if output.success() {
            return Ok(());
        }
        Err(DeduplicationError {
            stage: ctx.stage.name.clone(),
            method: self.method.clone(),
            message: output.failure_detail(&self.spec.program),
        }
        .into())
    }
}

/// Registers every command declared in `config`.
pub fn register_commands(registry: &Registry, config: &PipelineConfig) {
    for (name, spec) in &config.units {
        registry.register_unit(name, Arc::new(CommandUnit::new(name, spec.clone())));
    }
    for (name, spec) in &config.checks {
        registry.register_check(name, Arc::new(CommandCheck::new(name, spec.clone())));
    }
    for (method, spec) in &config.deduplicators {
        registry.register_deduplicator(
            method,
            Arc::new(CommandDeduplicator::new(method, spec.clone())),
        );
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::checkpoint::Watermark;
    use crate::pipeline::StageDefinition;
    use pretty_assertions::assert_eq;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    fn ctx(stage: StageDefinition) -> StageContext {
        StageContext::new("r1", Arc::new(stage), 1, DatasetRef::new("/tmp/staged.part"))
    }

    #[tokio::test]
    async fn test_unit_parses_last_line_summary() {
        let unit = CommandUnit::new(
            "extract",
            sh(r#"echo "extracting since $MEDALLION_SINCE"; echo '{"rows": 3, "max_watermark": 105}'"#),
        );
        let ctx = ctx(StageDefinition::bronze("orders")).with_since(Some(Watermark::Integer(100)));

        let out = unit.run(&ctx).await.unwrap();
        assert_eq!(out, WorkOutput::rows(3).with_watermark(Watermark::Integer(105)));
    }

    #[tokio::test]
    async fn test_unit_sees_invocation_env() {
        let unit = CommandUnit::new(
            "extract",
            sh(r#"echo "{\"rows\": 1, \"max_watermark\": \"$MEDALLION_LAYER-$MEDALLION_STAGE\"}""#),
        );
        let out = unit.run(&ctx(StageDefinition::bronze("orders"))).await.unwrap();
        assert_eq!(out.max_watermark, Some(Watermark::Text("bronze-orders".into())));
    }

    #[tokio::test]
    async fn test_unit_nonzero_exit_is_transient() {
        let unit = CommandUnit::new("extract", sh("echo 'source down' >&2; exit 3"));
        let err = unit.run(&ctx(StageDefinition::bronze("orders"))).await.unwrap_err();

        assert!(err.is_transient());
        assert!(err.to_string().contains("source down"));
    }

    #[tokio::test]
    async fn test_unit_timeout_is_transient() {
        let unit = CommandUnit::new("slow", sh("sleep 5").with_timeout_secs(1));
        let err = unit.run(&ctx(StageDefinition::gold("daily"))).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_program_is_transient() {
        let unit = CommandUnit::new("ghost", CommandSpec::new("/nonexistent/medallion-unit"));
        let err = unit.run(&ctx(StageDefinition::gold("daily"))).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_check_applies_default_severity() {
        let mut spec = sh(
            r#"echo '[{"name": "no_duplicates", "passed": false, "message": "2 duplicate ids"}, {"name": "row_count", "passed": true, "severity": "error"}]'"#,
        );
        spec.severity = Some(Severity::Warning);
        let check = CommandCheck::new("orders_checks", spec);

        let ctx = ctx(StageDefinition::silver("orders"));
        let results = check.evaluate(&ctx, &ctx.staging).await.unwrap();

        assert_eq!(
            results,
            vec![
                QualityGateResult::new("no_duplicates", false, Severity::Warning, "2 duplicate ids"),
                QualityGateResult::new("row_count", true, Severity::Error, ""),
            ]
        );
    }

    #[tokio::test]
    async fn test_check_single_object_uses_key_as_name() {
        let check = CommandCheck::new(
            "contract:orders",
            sh(r#"echo '{"passed": false, "message": "schema drift"}'"#),
        );
        let ctx = ctx(StageDefinition::silver("orders"));
        let results = check.evaluate(&ctx, &ctx.staging).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].check, "contract:orders");
        assert!(results[0].is_blocking());
    }

    #[tokio::test]
    async fn test_check_crash_is_terminal() {
        let check = CommandCheck::new("no_duplicates", sh("exit 1"));
        let ctx = ctx(StageDefinition::silver("orders"));
        let err = check.evaluate(&ctx, &ctx.staging).await.unwrap_err();

        assert!(!err.is_transient());
        assert!(matches!(err, MedallionError::QualityGate(_)));
    }

    #[tokio::test]
    async fn test_dedup_failure_is_terminal() {
        let dedup = CommandDeduplicator::new("splink", sh("echo 'model missing' >&2; exit 2"));
        let ctx = ctx(StageDefinition::silver("customers"));
        let err = dedup
            .deduplicate(&ctx, &ctx.staging, &serde_json::Map::new())
            .await
            .unwrap_err();

        assert!(!err.is_transient());
        assert!(err.to_string().contains("splink"));
        assert!(err.to_string().contains("model missing"));
    }

    #[test]
    fn test_register_commands() {
        let mut config = PipelineConfig::new("p", vec![]);
        config.units.insert("extract".into(), sh("true"));
        config.checks.insert("contract:orders".into(), sh("true"));
        config.deduplicators.insert("splink".into(), sh("true"));

        let registry = Registry::new();
        register_commands(&registry, &config);

        assert!(registry.unit("extract").is_some());
        assert!(registry.check("contract:orders").is_some());
        assert!(registry.deduplicator("splink").is_some());
    }
}
