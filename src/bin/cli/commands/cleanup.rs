use anyhow::Result;

use super::{paint, print_errors, Color};
use crate::app::App;
use crate::OutputFormat;

pub async fn run(app: &App, format: &OutputFormat, use_color: bool) -> Result<()> {
    let report = app.engine.cleanup().run_full_cleanup().await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Plain => {
            println!(
                "Local: {} migrated, {} merged, {} skipped",
                report.local.migrated,
                report.local.merged,
                report.local.skipped.len()
            );
            for key in &report.local.skipped {
                println!("  {}", paint(&format!("kept {}", key), Color::DIM, use_color));
            }
            println!("Purged {} stale sync keys", report.purged);
            match &report.cloud {
                Some(cloud) => {
                    println!(
                        "Cloud: {} books updated, {} groups consolidated",
                        cloud.books_updated, cloud.groups_consolidated
                    );
                    print_errors(&cloud.errors, use_color);
                }
                None => println!("{}", paint("Cloud: skipped (signed out)", Color::DIM, use_color)),
            }
            print_errors(&report.local.errors, use_color);
            if report.success {
                println!("{}", paint("Cleanup complete", Color::GREEN, use_color));
            }
        }
    }
    Ok(())
}
