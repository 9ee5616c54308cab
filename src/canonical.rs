//! Text canonicalization and content hashing.
//!
//! Every converted document passes through [`canonicalize`] exactly once
//! before hashing, so that the same logical text always produces the same
//! `mirror_hash` regardless of source platform or converter. The rules are
//! a compatibility contract: changing them invalidates every stored hash.
//!
//! Rules, applied in order:
//!
//! 1. Normalize line endings (`\r\n` and lone `\r` become `\n`).
//! 2. Unicode NFC normalization.
//! 3. Strip control characters U+0000–U+001F and U+007F, keeping tab and
//!    newline.
//! 4. Trim trailing whitespace on every line.
//! 5. Whitespace-only lines become blank.
//! 6. Collapse runs of two or more blank lines into one.
//! 7. Exactly one trailing newline.
//!
//! Empty input canonicalizes to a single newline.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Apply the canonicalization rules. Idempotent and deterministic.
pub fn canonicalize(input: &str) -> String {
    // Rules 1-3 operate on the whole text.
    let unified = input.replace("\r\n", "\n").replace('\r', "\n");
    let normalized: String = unified.nfc().collect();
    let cleaned: String = normalized
        .chars()
        .filter(|&c| c == '\t' || c == '\n' || !(c <= '\u{001f}' || c == '\u{007f}'))
        .collect();

    // Rules 4-6 operate line by line. Trailing whitespace is trimmed, which
    // also turns whitespace-only lines into blank lines; blank runs then
    // collapse to a single blank line.
    let mut lines: Vec<&str> = Vec::new();
    let mut prev_blank = false;
    for line in cleaned.split('\n') {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            if !prev_blank {
                lines.push("");
            }
            prev_blank = true;
        } else {
            lines.push(trimmed);
            prev_blank = false;
        }
    }

    // Rule 7: drop trailing blanks, then terminate with a single newline.
    while lines.last() == Some(&"") {
        lines.pop();
    }
    if lines.is_empty() {
        return "\n".to_string();
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// SHA-256 of the given bytes as lowercase 64-hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Content hash of already-canonical markdown.
pub fn mirror_hash(canonical_markdown: &str) -> String {
    sha256_hex(canonical_markdown.as_bytes())
}

/// Canonicalize and hash in one step.
pub fn canonicalize_and_hash(input: &str) -> (String, String) {
    let canonical = canonicalize(input);
    let hash = mirror_hash(&canonical);
    (canonical, hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crlf_trailing_ws_and_blank_runs() {
        let input = "# T\r\n\r\nA  \r\n\r\n\r\nB\r\n\r\n";
        let out = canonicalize(input);
        assert_eq!(out, "# T\n\nA\n\nB\n");
        assert_eq!(mirror_hash(&out), sha256_hex("# T\n\nA\n\nB\n".as_bytes()));
    }

    #[test]
    fn known_hash_for_hello() {
        let (canonical, hash) = canonicalize_and_hash("hello");
        assert_eq!(canonical, "hello\n");
        assert_eq!(
            hash,
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
    }

    #[test]
    fn empty_input_is_single_newline() {
        assert_eq!(canonicalize(""), "\n");
    }

    #[test]
    fn whitespace_only_lines_are_single_newline() {
        assert_eq!(canonicalize("   \n\t\n  \n"), "\n");
    }

    #[test]
    fn idempotent() {
        let samples = [
            "# T\r\n\r\nA  \r\n\r\n\r\nB\r\n\r\n",
            "",
            "one\ntwo\n\n\n\nthree",
            "tab\there\n",
            "  leading kept\n",
        ];
        for s in samples {
            let once = canonicalize(s);
            assert_eq!(canonicalize(&once), once, "not idempotent for {:?}", s);
        }
    }

    #[test]
    fn strips_control_chars_keeps_tab() {
        let out = canonicalize("a\u{0000}b\u{0007}c\td\u{007f}e\n");
        assert_eq!(out, "abc\tde\n");
    }

    #[test]
    fn lone_cr_becomes_newline() {
        assert_eq!(canonicalize("a\rb"), "a\nb\n");
    }

    #[test]
    fn single_blank_line_is_preserved() {
        assert_eq!(canonicalize("a\n\nb\n"), "a\n\nb\n");
    }

    #[test]
    fn leading_indentation_survives() {
        assert_eq!(canonicalize("    code\n"), "    code\n");
    }

    #[test]
    fn canonical_bytes_invariants() {
        let out = canonicalize("x\r\ny\u{0008}z   \n\n\n\nw\n\n\n");
        assert!(!out.contains('\r'));
        assert!(out
            .chars()
            .all(|c| c == '\n' || c == '\t' || !(c <= '\u{001f}' || c == '\u{007f}')));
        assert!(out.ends_with('\n'));
        assert!(!out.ends_with("\n\n"));
    }

    #[test]
    fn nfc_normalization_applied() {
        // e + combining acute accent composes to a single code point.
        let decomposed = "cafe\u{0301}";
        let out = canonicalize(decomposed);
        assert_eq!(out, "caf\u{00e9}\n");
    }
}
