//! Title/tag/content-preview extraction from a document's text projection.
//!
//! These are pure functions over `&str`: extraction happens both on local
//! writes and on ActivitySync-driven reloads (`activity.rs`), so external
//! edits update the tag index the same way local ones do.

use std::collections::BTreeSet;

use std::sync::LazyLock;

use regex::Regex;

/// First non-whitespace line of `text`, or `"Untitled"` if the document is
/// all whitespace. Truncation for display (with an ellipsis) is a
/// presentation-layer concern, out of scope here.
pub fn extract_title(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "Untitled".to_string())
}

/// Skip the title line and any further empty lines, then take the first
/// 200 characters of what remains.
pub fn extract_preview(text: &str) -> String {
    let mut lines = text.lines();
    // Consume lines up to and including the title line.
    for line in lines.by_ref() {
        if !line.trim().is_empty() {
            break;
        }
    }
    let rest: String = lines
        .skip_while(|l| l.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    rest.chars().take(200).collect()
}

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#[A-Za-z][A-Za-z0-9_]{0,49}").unwrap());

/// Every `#tag` occurrence in `text`, deduplicated and lowercased.
pub fn extract_tags(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    for m in TAG_RE.find_iter(text) {
        // Strip the leading `#` and normalize case.
        seen.insert(m.as_str()[1..].to_lowercase());
    }
    seen.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_is_first_nonblank_line() {
        assert_eq!(extract_title("\n\n  hello world\nmore text"), "hello world");
    }

    #[test]
    fn title_of_all_whitespace_is_untitled() {
        assert_eq!(extract_title("   \n\n  \n"), "Untitled");
        assert_eq!(extract_title(""), "Untitled");
    }

    #[test]
    fn preview_skips_title_and_blank_lines() {
        let text = "Title\n\n\nBody line one\nBody line two";
        assert_eq!(extract_preview(text), "Body line one\nBody line two");
    }

    #[test]
    fn preview_truncates_to_200_chars() {
        let body = "x".repeat(500);
        let text = format!("Title\n{body}");
        assert_eq!(extract_preview(&text).len(), 200);
    }

    #[test]
    fn tags_are_deduped_and_lowercased() {
        let text = "Notes about #Rust and #rust and #RUST123 and #a_b";
        let tags = extract_tags(text);
        assert_eq!(tags, vec!["a_b", "rust", "rust123"]);
    }

    #[test]
    fn tag_must_start_with_a_letter() {
        let text = "#1notatag #_alsonot #ok";
        assert_eq!(extract_tags(text), vec!["ok"]);
    }

    #[test]
    fn tag_length_capped_at_fifty_chars_after_first() {
        let long = "a".repeat(60);
        let text = format!("#{long}");
        let tags = extract_tags(&text);
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].len(), 51); // first letter + 50 more
    }
}
