use std::sync::OnceLock;

use regex::Regex;

use super::scheme::{content_types, SEPARATOR};

fn repeated_separators() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_{2,}").expect("static pattern"))
}

// Older editors appended `_template_<type>[_<id>]` to the key, always in
// lower case. Chapter names may legitimately contain "Template".
fn template_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"_template_(?:flashcards?|mcqs?|qa|notes?|mindmaps?|videos?)(?:_[a-z0-9]+)?$",
        )
        .expect("static pattern")
    })
}

/// Map a (possibly drifted) content type prefix to its canonical spelling.
fn canonical_type(segment: &str) -> Option<&'static str> {
    match segment.to_ascii_lowercase().as_str() {
        "flashcard" | "flashcards" => Some(content_types::FLASHCARD),
        "mcq" | "mcqs" => Some(content_types::MCQ),
        "qa" => Some(content_types::QA),
        "note" | "notes" => Some(content_types::NOTES),
        "mindmap" | "mindmaps" => Some(content_types::MINDMAP),
        "video" | "videos" => Some(content_types::VIDEOS),
        _ => None,
    }
}

/// The canonical content type of a template key, if it is one.
pub fn template_type_of(key: &str) -> Option<&'static str> {
    let first = key.trim_start().split(SEPARATOR).next()?;
    canonical_type(first)
}

/// Whether `key` stores template content (flashcards, notes, ...).
pub fn is_template_key(key: &str) -> bool {
    template_type_of(key).is_some()
}

/// Rewrite a drifted key into its canonical form.
///
/// Whitespace becomes `_`, repeated separators collapse, legacy template
/// suffixes are dropped and the type prefix is upper-cased. Tab suffixes
/// survive. Applying it twice yields the same key.
pub fn canonical_key(key: &str) -> String {
    let spaced = key.split_whitespace().collect::<Vec<_>>().join("_");
    let mut out = repeated_separators()
        .replace_all(&spaced, "_")
        .trim_matches(SEPARATOR)
        .to_string();

    loop {
        let stripped = template_suffix().replace(&out, "").into_owned();
        if stripped == out {
            break;
        }
        out = stripped;
    }

    if let Some(canonical) = template_type_of(&out) {
        let rest = out.find(SEPARATOR).map(|i| &out[i..]).unwrap_or("");
        out = format!("{}{}", canonical, rest);
    }

    out.trim_end_matches(SEPARATOR).to_string()
}
