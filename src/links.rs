//! Link extraction from canonical markdown.
//!
//! Recognizes two syntaxes:
//!
//! - Wiki links: `[[target]]`, `[[target|display]]`, with an optional
//!   `collection:` prefix and `#anchor` suffix on the target.
//! - Standard markdown links: `[text](target)`. Image syntax (`![…](…)`)
//!   is not a link.
//!
//! Lines inside code fences are skipped. Positions are 1-based character
//! coordinates covering the whole link syntax, brackets included. Links do
//! not span lines.

use crate::models::{validate_collection_name, Link, LinkSource, LinkType};

/// Case-fold, collapse whitespace, strip any `#anchor`.
pub fn normalize_ref(target: &str) -> String {
    let without_anchor = target.split('#').next().unwrap_or("");
    without_anchor
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn fence_marker(line: &str) -> Option<(char, usize, bool)> {
    let trimmed = line.trim_start();
    for marker in ['`', '~'] {
        let count = trimmed.chars().take_while(|&c| c == marker).count();
        if count >= 3 {
            let bare = trimmed[count..].trim().is_empty();
            return Some((marker, count, bare));
        }
    }
    None
}

/// Extract all links, in document order.
pub fn extract_links(canonical: &str) -> Vec<Link> {
    let mut links = Vec::new();
    let mut fence: Option<(char, usize)> = None;

    for (idx, line) in canonical.split('\n').enumerate() {
        let line_no = (idx + 1) as i64;
        match (fence, fence_marker(line)) {
            (None, Some((marker, width, _))) => {
                fence = Some((marker, width));
                continue;
            }
            (Some((marker, width)), Some((m, w, bare))) if m == marker && w >= width && bare => {
                fence = None;
                continue;
            }
            (Some(_), _) => continue,
            (None, None) => {}
        }
        scan_line(line, line_no, &mut links);
    }
    links
}

fn scan_line(line: &str, line_no: i64, links: &mut Vec<Link>) {
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '[' {
            i += 1;
            continue;
        }

        // Wiki link: [[ ... ]]
        if i + 1 < chars.len() && chars[i + 1] == '[' {
            if let Some(close) = find_seq(&chars, i + 2, "]]") {
                let inner: String = chars[i + 2..close].iter().collect();
                if let Some(link) = parse_wiki_inner(&inner, line_no, i, close) {
                    links.push(link);
                }
                i = close + 2;
                continue;
            }
        }

        // Markdown link: [text](target), not preceded by '!'.
        let is_image = i > 0 && chars[i - 1] == '!';
        if !is_image {
            if let Some(link) = parse_markdown_at(&chars, i, line_no, links) {
                i = link;
                continue;
            }
        }
        i += 1;
    }
}

fn find_seq(chars: &[char], from: usize, needle: &str) -> Option<usize> {
    let n: Vec<char> = needle.chars().collect();
    let mut i = from;
    while i + n.len() <= chars.len() {
        if chars[i..i + n.len()] == n[..] {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Parse the inside of a `[[…]]`. `open` is the index of the first `[`,
/// `close` the index of the first `]` of the closing pair.
fn parse_wiki_inner(inner: &str, line_no: i64, open: usize, close: usize) -> Option<Link> {
    let (target_part, display) = match inner.split_once('|') {
        Some((t, d)) => (t.trim(), Some(d.trim().to_string())),
        None => (inner.trim(), None),
    };
    if target_part.is_empty() {
        return None;
    }

    let (target_collection, rest) = match target_part.split_once(':') {
        Some((pre, rest))
            if !rest.is_empty() && validate_collection_name(pre).is_ok() =>
        {
            (Some(pre.to_string()), rest)
        }
        _ => (None, target_part),
    };
    let target_anchor = rest
        .split_once('#')
        .map(|(_, a)| a.trim().to_string())
        .filter(|a| !a.is_empty());
    let norm = normalize_ref(rest);
    if norm.is_empty() {
        return None;
    }

    Some(Link {
        target_ref: target_part.to_string(),
        target_ref_norm: norm,
        target_anchor,
        target_collection,
        link_type: LinkType::Wiki,
        link_text: display.filter(|d| !d.is_empty()),
        start_line: line_no,
        start_col: (open + 1) as i64,
        end_line: line_no,
        end_col: (close + 2) as i64,
        source: LinkSource::Parsed,
    })
}

/// Try to parse `[text](target)` with the opening `[` at `open`.
/// On success pushes the link and returns the index just past `)`.
fn parse_markdown_at(
    chars: &[char],
    open: usize,
    line_no: i64,
    links: &mut Vec<Link>,
) -> Option<usize> {
    let close_text = find_seq(chars, open + 1, "]")?;
    if close_text + 1 >= chars.len() || chars[close_text + 1] != '(' {
        return None;
    }
    let close_target = find_seq(chars, close_text + 2, ")")?;

    let text: String = chars[open + 1..close_text].iter().collect();
    let target: String = chars[close_text + 2..close_target].iter().collect();
    let target = target.trim().to_string();
    if target.is_empty() {
        return None;
    }

    let target_anchor = target
        .split_once('#')
        .map(|(_, a)| a.trim().to_string())
        .filter(|a| !a.is_empty());
    let norm = normalize_ref(&target);
    if norm.is_empty() {
        return None;
    }

    links.push(Link {
        target_ref: target,
        target_ref_norm: norm,
        target_anchor,
        target_collection: None,
        link_type: LinkType::Markdown,
        link_text: Some(text.trim().to_string()).filter(|t| !t.is_empty()),
        start_line: line_no,
        start_col: (open + 1) as i64,
        end_line: line_no,
        end_col: (close_target + 1) as i64,
        source: LinkSource::Parsed,
    });
    Some(close_target + 1)
}
