use anyhow::Result;

use super::{paint, Color};
use crate::app::App;
use crate::OutputFormat;

pub async fn run(
    app: &App,
    book: &str,
    chapter: &str,
    refresh: bool,
    format: &OutputFormat,
    use_color: bool,
) -> Result<()> {
    let book = app.find_book(book).map(|b| b.name).unwrap_or_else(|_| book.to_string());

    let show_progress = matches!(format, OutputFormat::Plain);
    let subscription = app.engine.subscribe_to_loading_progress(move |p| {
        if show_progress {
            let line = format!("[{:>3}%] {:?}: {}", p.progress, p.phase, p.message);
            println!("{}", paint(&line, Color::CYAN, use_color));
        }
    });

    let loader = app.engine.loader();
    let result = if refresh {
        loader.force_refresh_chapter(&book, chapter).await
    } else {
        app.engine.load_chapter_data(&book, chapter).await
    };
    loader.wait_for_background().await;
    subscription.unsubscribe();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Plain => {
            if let Some(error) = &result.error {
                println!("{}", paint(&format!("Cloud: {}", error), Color::YELLOW, use_color));
            }
            println!(
                "{} highlights, {} templates, {} custom tabs, {} exam entries ({} KiB)",
                result.highlight_count,
                result.template_count,
                result.custom_tab_count,
                result.exam_data_count,
                result.total_size_kb
            );
        }
    }
    Ok(())
}
