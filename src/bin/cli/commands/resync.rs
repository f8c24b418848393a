use anyhow::Result;

use super::{paint, print_errors, Color};
use crate::app::App;
use crate::OutputFormat;

pub async fn run(app: &App, format: &OutputFormat, use_color: bool) -> Result<()> {
    let report = app.engine.force_complete_resync().await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Plain => {
            println!(
                "Pushed {} highlights, {} custom tabs, {} exam items ({} unchanged)",
                report.push.highlights,
                report.push.custom_tabs,
                report.push.exam_items,
                report.push.unchanged
            );
            println!(
                "Pulled {} books, {} highlight groups, {} evaluation groups",
                report.pull.books, report.pull.highlight_groups, report.pull.evaluation_groups
            );
            if report.pull.kept_local > 0 {
                println!("Kept {} newer local books", report.pull.kept_local);
            }
            print_errors(&report.errors, use_color);
            let (label, color) = if report.success {
                ("Resync complete", Color::GREEN)
            } else {
                ("Resync finished with errors", Color::RED)
            };
            println!("{}", paint(label, color, use_color));
        }
    }
    Ok(())
}

pub async fn run_push(app: &App, format: &OutputFormat, use_color: bool) -> Result<()> {
    let report = app.engine.force_sync().await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Plain => {
            println!(
                "{} of {} books pushed",
                paint(&report.succeeded.to_string(), Color::BOLD, use_color),
                report.total
            );
            print_errors(&report.errors, use_color);
        }
    }
    Ok(())
}
