pub mod books;
pub mod cleanup;
pub mod get;
pub mod keys;
pub mod load;
pub mod resync;
pub mod stats;

/// ANSI color codes
pub struct Color;

impl Color {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const RED: &str = "\x1b[31m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const CYAN: &str = "\x1b[36m";
}

/// Wrap `text` in `color` when colors are enabled.
pub fn paint(text: &str, color: &str, use_color: bool) -> String {
    if use_color {
        format!("{}{}{}", color, text, Color::RESET)
    } else {
        text.to_string()
    }
}

/// Print a list of errors under a heading, if any.
pub fn print_errors(errors: &[String], use_color: bool) {
    if errors.is_empty() {
        return;
    }
    println!("{}", paint(&format!("{} error(s):", errors.len()), Color::RED, use_color));
    for error in errors {
        println!("  - {}", error);
    }
}

fn human_size(bytes: usize) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
