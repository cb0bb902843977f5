// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Markdown normalisation for Telegram delivery.
//!
//! Telegram MarkdownV2 is not the same as common Markdown. A few safe,
//! minimal conversions make typical LLM output render instead of constantly
//! triggering a parse error and falling back to plain text.

/// Telegram's hard message size limit.
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Converts common Markdown constructs to their MarkdownV2 equivalents.
pub fn normalize_markdown_v2(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let text = text.replace("\r\n", "\n");
    // CommonMark/GFM -> Telegram MarkdownV2.
    let text = text.replace("~~", "~");
    let text = text.replace("**", "*");

    let lines: Vec<String> = text.lines().map(normalize_line).collect();
    lines.join("\n")
}

fn normalize_line(line: &str) -> String {
    let trimmed = line.trim_start_matches([' ', '\t']);
    let prefix = &line[..line.len() - trimmed.len()];

    // Headings are not supported and '#' is reserved.
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if (1..=6).contains(&hashes) && trimmed[hashes..].starts_with(' ') {
        return format!("{prefix}{}", trimmed[hashes..].trim());
    }

    // Blockquotes: avoid the reserved '>' and render a plain quote marker.
    if let Some(rest) = trimmed.strip_prefix("> ") {
        return format!("{prefix}│ {}", rest.trim());
    }

    // Bullet lists: '-' is reserved, use a bullet character.
    if let Some(rest) = trimmed.strip_prefix("- ").or_else(|| trimmed.strip_prefix("* ")) {
        return format!("{prefix}• {}", rest.trim());
    }

    // Ordered list "1. item" -> "1) item" ('.' can break MarkdownV2).
    let digits = trimmed.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 && trimmed[digits..].starts_with(". ") {
        return format!(
            "{prefix}{}) {}",
            &trimmed[..digits],
            trimmed[digits + 2..].trim()
        );
    }

    line.to_string()
}

/// Splits a message into chunks Telegram accepts, verbatim.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }
    let mut parts = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut cut = max_len.min(rest.len());
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        parts.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    parts
}

/// Minimal HTML escaping for the streaming preview's HTML parse mode.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bold_and_strike_are_converted() {
        assert_eq!(normalize_markdown_v2("**bold** ~~gone~~"), "*bold* ~gone~");
    }

    #[test]
    fn headings_are_stripped() {
        assert_eq!(normalize_markdown_v2("## Title"), "Title");
        assert_eq!(normalize_markdown_v2("####### not a heading"), "####### not a heading");
    }

    #[test]
    fn list_bullets_are_rewritten() {
        assert_eq!(normalize_markdown_v2("- item\n* other"), "• item\n• other");
        assert_eq!(normalize_markdown_v2("1. first\n12. twelfth"), "1) first\n12) twelfth");
    }

    #[test]
    fn blockquotes_use_plain_marker() {
        assert_eq!(normalize_markdown_v2("> quoted"), "│ quoted");
    }

    #[test]
    fn indentation_is_preserved() {
        assert_eq!(normalize_markdown_v2("  - nested"), "  • nested");
    }

    #[test]
    fn split_message_respects_limit() {
        let text = "a".repeat(10_000);
        let parts = split_message(&text, MAX_MESSAGE_LEN);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.len() <= MAX_MESSAGE_LEN));
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn escape_html_covers_reserved_chars() {
        assert_eq!(escape_html("a < b & c > d"), "a &lt; b &amp; c &gt; d");
    }
}
