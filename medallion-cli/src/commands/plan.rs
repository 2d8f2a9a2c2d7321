use std::path::Path;

use anyhow::{Context, Result};

/// Execute the `plan` command: print the stage order without side effects.
pub fn execute(config_path: &Path, start: Option<&str>) -> Result<()> {
    let config = super::load(config_path)?;
    let graph = config.build_graph().context("Invalid stage graph")?;
    let start = start.unwrap_or(config.start_stage.as_str());
    let order = graph
        .topological_order(start)
        .with_context(|| format!("Cannot plan from '{start}'"))?;

    println!("Pipeline '{}' from '{}':", config.name, start);
    for (i, name) in order.iter().enumerate() {
        let Some(stage) = graph.stage(name) else {
            continue;
        };
        if stage.depends_on.is_empty() {
            println!("  {:>2}. {} [{}]", i + 1, name, stage.layer);
        } else {
            println!(
                "  {:>2}. {} [{}] <- {}",
                i + 1,
                name,
                stage.layer,
                stage.depends_on.join(", ")
            );
        }
    }
    Ok(())
}
