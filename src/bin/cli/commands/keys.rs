use anyhow::{Context, Result};

use super::{human_size, paint, Color};
use crate::app::App;
use crate::OutputFormat;

pub fn run(app: &App, pattern: Option<&str>, format: &OutputFormat, use_color: bool) -> Result<()> {
    let matcher = pattern
        .map(glob::Pattern::new)
        .transpose()
        .context("Invalid key pattern")?;

    let cache = app.engine.cache();
    let keys = cache.list_keys(|k| matcher.as_ref().map_or(true, |m| m.matches(k)));

    match format {
        OutputFormat::Json => {
            let output: Vec<serde_json::Value> = keys
                .iter()
                .map(|k| serde_json::json!({ "key": k, "size": cache.estimate_size(k) }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => {
            if keys.is_empty() {
                println!("No keys found.");
                return Ok(());
            }
            for key in &keys {
                println!(
                    "{:>10}  {}",
                    paint(&human_size(cache.estimate_size(key)), Color::DIM, use_color),
                    key
                );
            }
        }
    }
    Ok(())
}
