use anyhow::{bail, Result};
use serde_json::Value;

use crate::app::App;
use crate::OutputFormat;

pub async fn run(
    app: &App,
    content_type: &str,
    book: &str,
    chapter: &str,
    tab: Option<&str>,
    format: &OutputFormat,
) -> Result<()> {
    let content_type = content_type.to_uppercase();
    let Some(value) = app
        .engine
        .get_content_with_cloud_fallback(book, chapter, &content_type, tab)
        .await
    else {
        bail!("No {} content for {} / {}", content_type, book, chapter);
    };

    match (format, &value) {
        (OutputFormat::Plain, Value::String(text)) => println!("{}", text),
        _ => println!("{}", serde_json::to_string_pretty(&value)?),
    }
    Ok(())
}
