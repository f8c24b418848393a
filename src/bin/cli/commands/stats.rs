use anyhow::Result;

use super::{human_size, paint, Color};
use crate::app::App;
use crate::OutputFormat;

pub fn run(app: &App, format: &OutputFormat, use_color: bool) -> Result<()> {
    let stats = app.engine.cache().stats();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Plain => {
            println!(
                "{} keys, {}",
                paint(&stats.total_keys.to_string(), Color::BOLD, use_color),
                human_size(stats.total_bytes)
            );
            if stats.template_keys > 0 {
                println!(
                    "{}",
                    paint(
                        &format!("{} legacy template keys (run `cleanup`)", stats.template_keys),
                        Color::YELLOW,
                        use_color
                    )
                );
            }
            for (content_type, count) in &stats.by_type {
                println!("  {:<20} {}", content_type, count);
            }
        }
    }
    Ok(())
}
