//! Byte-level lexical helpers shared by the scanner and the repair engine.
//!
//! Every syntactically meaningful LaTeX character is ASCII, so all helpers
//! work on `&[u8]` and return byte offsets that always fall on UTF-8 character
//! boundaries of the source text.

/// Whether the byte at `pos` is preceded by an odd run of backslashes.
pub(crate) fn is_escaped(bytes: &[u8], pos: usize) -> bool {
    let run = bytes[..pos.min(bytes.len())]
        .iter()
        .rev()
        .take_while(|&&b| b == b'\\')
        .count();
    run % 2 == 1
}

/// Offset of the first byte of the line containing `pos`.
pub(crate) fn line_start(bytes: &[u8], pos: usize) -> usize {
    bytes[..pos.min(bytes.len())]
        .iter()
        .rposition(|&b| b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0)
}

/// Offset of the newline ending the line containing `pos`, or the text length.
pub(crate) fn line_end(bytes: &[u8], pos: usize) -> usize {
    bytes[pos.min(bytes.len())..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|i| pos + i)
        .unwrap_or(bytes.len())
}

/// First unescaped `%` in `[from, to)`.
pub(crate) fn comment_start(bytes: &[u8], from: usize, to: usize) -> Option<usize> {
    (from..to.min(bytes.len())).find(|&i| bytes[i] == b'%' && !is_escaped(bytes, i))
}

/// Whether the line after the newline at `newline` is blank, which makes the
/// newline a paragraph break.
pub(crate) fn starts_blank_line(bytes: &[u8], newline: usize) -> bool {
    let mut i = newline + 1;
    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' | b'\r' => i += 1,
            b'\n' => return true,
            _ => return false,
        }
    }
    false
}

fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

/// Offset just past the last significant byte in `[lower, upper)`.
///
/// Comments and trailing whitespace do not count as significant. Returns
/// `lower` when the range holds nothing significant.
pub(crate) fn content_end(bytes: &[u8], lower: usize, upper: usize) -> usize {
    let upper = upper.min(bytes.len());
    let mut end = upper;
    loop {
        let start = line_start(bytes, end).max(lower);
        let mut code_end = comment_start(bytes, start, end).unwrap_or(end);
        while code_end > start && is_space(bytes[code_end - 1]) {
            code_end -= 1;
        }
        if code_end > start {
            return code_end;
        }
        if start <= lower {
            return lower;
        }
        // `start - 1` is the newline that ended the previous line.
        end = start - 1;
    }
}

/// Whether `pos` directly follows a control word such as `\verb` or `\verb*`.
pub(crate) fn follows_control_word(bytes: &[u8], pos: usize) -> bool {
    let mut i = pos.min(bytes.len());
    if i > 0 && bytes[i - 1] == b'*' {
        i -= 1;
    }
    let letters = bytes[..i]
        .iter()
        .rev()
        .take_while(|b| b.is_ascii_alphabetic())
        .count();
    let backslash = i - letters;
    letters > 0
        && backslash > 0
        && bytes[backslash - 1] == b'\\'
        && !is_escaped(bytes, backslash - 1)
}

fn is_verb_delimiter(b: u8) -> bool {
    b.is_ascii() && !b.is_ascii_alphabetic() && !b.is_ascii_whitespace()
}

/// Whether a `\verb` earlier on the line of `pos` opened its delimiter before
/// `pos` without closing it. Text inserted at `pos` would become verbatim.
pub(crate) fn open_verb_before(bytes: &[u8], pos: usize) -> bool {
    let pos = pos.min(bytes.len());
    let mut i = line_start(bytes, pos);
    while i < pos {
        if bytes[i] != b'\\' {
            i += 1;
            continue;
        }
        let letters = bytes[i + 1..]
            .iter()
            .take_while(|b| b.is_ascii_alphabetic())
            .count();
        if letters == 0 {
            i += 2;
            continue;
        }
        let name_end = i + 1 + letters;
        if &bytes[i + 1..name_end] != b"verb" {
            i = name_end;
            continue;
        }
        let mut delim = name_end;
        if bytes.get(delim) == Some(&b'*') {
            delim += 1;
        }
        if delim >= pos || !is_verb_delimiter(bytes[delim]) {
            i = name_end;
            continue;
        }
        match bytes[delim + 1..pos].iter().position(|&b| b == bytes[delim]) {
            Some(rel) => i = delim + rel + 2,
            None => return true,
        }
    }
    false
}

/// Whether the last line of the text carries a comment.
pub(crate) fn last_line_has_comment(bytes: &[u8]) -> bool {
    let start = line_start(bytes, bytes.len());
    comment_start(bytes, start, bytes.len()).is_some()
}

/// Length in bytes of the UTF-8 character starting with `lead`.
pub(crate) fn char_len(lead: u8) -> usize {
    match lead {
        0x00..=0x7f => 1,
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        _ => 4,
    }
}

/// 1-based line and column (in characters) of a byte offset.
pub fn locate(text: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(text.len());
    let before = &text.as_bytes()[..offset];
    let line = before.iter().filter(|&&b| b == b'\n').count() + 1;
    let start = line_start(text.as_bytes(), offset);
    let column = text
        .get(start..offset)
        .map(|s| s.chars().count())
        .unwrap_or(offset - start)
        + 1;
    (line, column)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_parity() {
        let text = br"a\$ b\\$ c\\\$";
        assert!(is_escaped(text, 2));
        assert!(!is_escaped(text, 7));
        assert!(is_escaped(text, 13));
    }

    #[test]
    fn test_comment_start_skips_escaped_percent() {
        let text = br"50\% off % note";
        assert_eq!(comment_start(text, 0, text.len()), Some(9));
        assert_eq!(comment_start(br"100\%", 0, 5), None);
    }

    #[test]
    fn test_follows_control_word() {
        assert!(follows_control_word(br"$$\verb", 7));
        assert!(follows_control_word(br"\verb*", 6));
        assert!(!follows_control_word(br"\\verb", 6));
        assert!(!follows_control_word(br"word", 4));
        assert!(!follows_control_word(br"\$", 2));
    }

    #[test]
    fn test_open_verb_before() {
        assert!(open_verb_before(br"$$\verb$", 8));
        assert!(!open_verb_before(br"$$\verb$", 7));
        assert!(open_verb_before(b"a\n\\verb|x", 9));
        assert!(!open_verb_before(br"\verb|x| y", 10));
        assert!(!open_verb_before(br"\verb", 5));
        assert!(!open_verb_before(br"\\verb|x", 8));
        assert!(!open_verb_before(b"\\verb|x\nnext", 13));
    }

    #[test]
    fn test_blank_line_detection() {
        let text = b"one\n  \ntwo\nthree";
        assert!(starts_blank_line(text, 3));
        assert!(!starts_blank_line(text, 10));
    }

    #[test]
    fn test_content_end_ignores_comments_and_whitespace() {
        let text = b"$x + y  % trailing\n% only a comment\n   \n";
        assert_eq!(content_end(text, 1, text.len()), 6);
    }

    #[test]
    fn test_content_end_empty_range() {
        let text = b"{   % nothing\n";
        assert_eq!(content_end(text, 1, 13), 1);
    }

    #[test]
    fn test_locate_counts_characters() {
        let text = "first\nsé$x";
        assert_eq!(locate(text, 0), (1, 1));
        assert_eq!(locate(text, text.find('$').unwrap()), (2, 3));
    }
}
