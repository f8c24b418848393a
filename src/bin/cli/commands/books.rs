use anyhow::Result;

use studyshelf_sync::sync::BookSource;

use super::{paint, Color};
use crate::app::App;
use crate::OutputFormat;

pub async fn run(app: &App, remote: bool, format: &OutputFormat, use_color: bool) -> Result<()> {
    let (mut books, source, error) = if remote {
        let listing = app.engine.books().get_all_books().await;
        (listing.books, listing.source, listing.error)
    } else {
        (app.engine.books().registry().books(), BookSource::Local, None)
    };
    books.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    let registry = app.engine.books().registry();
    match format {
        OutputFormat::Json => {
            let output: Vec<serde_json::Value> = books
                .iter()
                .map(|b| {
                    serde_json::json!({
                        "id": b.id,
                        "name": b.name,
                        "chapters": registry.chapters(&b.id).len(),
                        "updatedAt": b.updated_at.to_rfc3339(),
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "source": source,
                    "error": error,
                    "books": output,
                }))?
            );
        }
        OutputFormat::Plain => {
            if let Some(error) = &error {
                eprintln!("{}", paint(&format!("Cloud unavailable: {}", error), Color::YELLOW, use_color));
            }
            if books.is_empty() {
                println!("No books found.");
                return Ok(());
            }

            let name_width = books.iter().map(|b| b.name.len()).max().unwrap_or(4).clamp(4, 40);
            println!(
                "{}",
                paint(
                    &format!("{:<name_width$} {:>8}  {}", "NAME", "CHAPTERS", "UPDATED"),
                    Color::BOLD,
                    use_color
                )
            );
            for book in &books {
                println!(
                    "{:<name_width$} {:>8}  {}",
                    book.name,
                    registry.chapters(&book.id).len(),
                    paint(&book.updated_at.format("%Y-%m-%d %H:%M").to_string(), Color::DIM, use_color),
                );
            }
            println!("\n{} book(s) from {:?}", books.len(), source);
        }
    }
    Ok(())
}
