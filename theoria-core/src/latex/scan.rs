//! Single-pass structure scanner.
//!
//! Walks the text once, left to right, maintaining a block stack, the inline
//! math state, and a brace stack. Malformed structure is recorded in the
//! model; the only failure is exceeding the nesting ceiling.

use tracing::{debug, trace};

use super::lexis::{self, char_len};
use super::model::{
    BlockClose, BlockFrame, BraceEvent, InlineDelimiter, InlineSpan, OpenArgument, ReferenceSite,
    StrayClose, StructuralModel, UnmatchedBrace,
};
use crate::error::{Error, Result};

/// Default ceiling for both the block stack and the brace stack.
pub const DEFAULT_MAX_DEPTH: usize = 256;

/// Environments whose body is not scanned.
pub const RAW_ENVIRONMENTS: &[&str] = &["verbatim", "Verbatim", "lstlisting", "minted", "comment"];

/// Commands whose first mandatory argument is a key list.
pub const REFERENCE_COMMANDS: &[&str] = &[
    "cite",
    "citep",
    "citet",
    "citeauthor",
    "citeyear",
    "parencite",
    "textcite",
    "autocite",
    "nocite",
    "ref",
    "eqref",
    "pageref",
    "autoref",
    "cref",
    "Cref",
    "vref",
    "nameref",
];

pub fn is_reference_command(name: &str) -> bool {
    REFERENCE_COMMANDS.contains(&name)
}

fn is_env_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'*' | b'-' | b'_' | b':' | b'@' | b'.')
}

#[derive(Debug)]
struct PendingBrace {
    offset: usize,
    /// Set once the brace's line has been fully seen
    anchor: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct OpenInline {
    delimiter: InlineDelimiter,
    start: usize,
}

/// Scanner state for one document.
pub struct StructureScanner<'a> {
    text: &'a str,
    bytes: &'a [u8],
    max_depth: usize,
    pos: usize,
    /// Indices into `model.blocks` of frames still open
    block_stack: Vec<usize>,
    braces: Vec<PendingBrace>,
    inline: Option<OpenInline>,
    model: StructuralModel,
}

impl<'a> StructureScanner<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            max_depth: DEFAULT_MAX_DEPTH,
            pos: 0,
            block_stack: Vec::new(),
            braces: Vec::new(),
            inline: None,
            model: StructuralModel::default(),
        }
    }

    /// Set the nesting ceiling.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Scan the whole text and return the structural model.
    pub fn scan(mut self) -> Result<StructuralModel> {
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'\\' => self.control_sequence()?,
                b'%' => self.pos = lexis::line_end(self.bytes, self.pos),
                b'\n' => self.newline(),
                b'{' => self.open_brace()?,
                b'}' => self.close_brace(),
                b'$' => self.dollar(),
                _ => self.pos += 1,
            }
        }
        Ok(self.finish())
    }

    fn control_sequence(&mut self) -> Result<()> {
        let start = self.pos;
        let Some(&next) = self.bytes.get(start + 1) else {
            self.pos += 1;
            return Ok(());
        };

        // A backslash before a newline is a control space; the newline still
        // counts for paragraph and line tracking.
        if next == b'\n' {
            self.pos += 1;
            return Ok(());
        }
        if !next.is_ascii_alphabetic() {
            self.pos = (start + 1 + char_len(next)).min(self.bytes.len());
            return Ok(());
        }

        let name_end = start
            + 1
            + self.bytes[start + 1..]
                .iter()
                .take_while(|b| b.is_ascii_alphabetic())
                .count();
        let text = self.text;
        let name = &text[start + 1..name_end];

        let takes_argument = matches!(name, "begin" | "end") || is_reference_command(name);
        if takes_argument && self.unterminated_argument(name, start, name_end) {
            return Ok(());
        }

        match name {
            "begin" => self.begin(start, name_end)?,
            "end" => self.end(start, name_end),
            "verb" => self.verb(name_end),
            _ => {
                if is_reference_command(name) {
                    if let Some(site) = self.reference(name, start, name_end) {
                        trace!(command = %site.command, offset = site.offset, "reference site");
                        self.model.references.push(site);
                    }
                }
                self.pos = name_end;
            }
        }
        Ok(())
    }

    /// Offset of the `{` opening a command's mandatory argument.
    ///
    /// Reference commands may carry a `*` and `[...]` options first.
    fn argument_brace(&self, name_end: usize, options: bool) -> Option<usize> {
        let bytes = self.bytes;
        let mut i = name_end;
        if options && bytes.get(i) == Some(&b'*') {
            i += 1;
        }
        loop {
            while i < bytes.len() && matches!(bytes[i], b' ' | b'\t') {
                i += 1;
            }
            if !options || bytes.get(i) != Some(&b'[') {
                break;
            }
            let eol = lexis::line_end(bytes, i);
            let close = bytes[i..eol].iter().position(|&b| b == b']')?;
            i += close + 1;
        }
        (bytes.get(i) == Some(&b'{')).then_some(i)
    }

    /// Offset of the `}` closing the argument opened at `brace`, searched
    /// within the paragraph and outside comments.
    fn argument_close(&self, brace: usize) -> Option<usize> {
        let bytes = self.bytes;
        let mut depth = 0usize;
        let mut j = brace + 1;
        while j < bytes.len() {
            match bytes[j] {
                b'\\' => {
                    j += 2;
                    continue;
                }
                b'%' => {
                    j = lexis::line_end(bytes, j);
                    continue;
                }
                b'{' => depth += 1,
                b'}' if depth == 0 => return Some(j),
                b'}' => depth -= 1,
                b'\n' if lexis::starts_blank_line(bytes, j) => return None,
                _ => {}
            }
            j += 1;
        }
        None
    }

    /// Record a command whose argument brace never closes and step past that
    /// brace. Closing it later would turn the fragment into a different
    /// construct, so the brace stays out of brace matching.
    fn unterminated_argument(&mut self, name: &str, start: usize, name_end: usize) -> bool {
        let Some(brace) = self.argument_brace(name_end, is_reference_command(name)) else {
            return false;
        };
        if self.argument_close(brace).is_some() {
            return false;
        }
        debug!(command = name, offset = start, "unterminated argument");
        self.model.open_arguments.push(OpenArgument {
            command: name.to_string(),
            offset: start,
            brace,
        });
        self.pos = brace + 1;
        true
    }

    /// Parse `{name}` after `\begin` or `\end`.
    fn environment_argument(&self, from: usize) -> Option<(&'a str, usize)> {
        let bytes = self.bytes;
        let mut i = from;
        while i < bytes.len() && matches!(bytes[i], b' ' | b'\t') {
            i += 1;
        }
        if bytes.get(i) != Some(&b'{') {
            return None;
        }
        let name_start = i + 1;
        let mut j = name_start;
        while j < bytes.len() && is_env_name_byte(bytes[j]) {
            j += 1;
        }
        if j == name_start || bytes.get(j) != Some(&b'}') {
            return None;
        }
        let text = self.text;
        Some((&text[name_start..j], j + 1))
    }

    fn begin(&mut self, start: usize, name_end: usize) -> Result<()> {
        let Some((name, token_end)) = self.environment_argument(name_end) else {
            self.pos = name_end;
            return Ok(());
        };
        if self.block_stack.len() >= self.max_depth {
            return Err(Error::parse_limit(self.max_depth, start));
        }

        self.block_stack.push(self.model.blocks.len());
        self.model.blocks.push(BlockFrame {
            name: name.to_string(),
            open: start,
            open_end: token_end,
            close: BlockClose::Open,
        });

        if RAW_ENVIRONMENTS.contains(&name) {
            self.skip_raw(name, start, token_end);
        } else {
            self.pos = token_end;
        }
        Ok(())
    }

    fn end(&mut self, start: usize, name_end: usize) {
        let Some((name, token_end)) = self.environment_argument(name_end) else {
            self.pos = name_end;
            return;
        };
        self.pos = token_end;

        let blocks = &self.model.blocks;
        let Some(depth) = self.block_stack.iter().rposition(|&i| blocks[i].name == name) else {
            debug!(name, offset = start, "stray block close");
            self.model.stray_closes.push(StrayClose {
                name: name.to_string(),
                offset: start,
            });
            return;
        };

        let popped: Vec<usize> = self.block_stack.drain(depth..).collect();
        self.model.blocks[popped[0]].close = BlockClose::Matched { at: start };
        for &index in &popped[1..] {
            debug!(
                name = %self.model.blocks[index].name,
                closed_by = name,
                offset = start,
                "block implicitly closed"
            );
            self.model.blocks[index].close = BlockClose::Implicit { at: start };
        }
    }

    /// Jump over the body of a raw environment to its own end token.
    fn skip_raw(&mut self, name: &str, begin: usize, body: usize) {
        // Nothing inside the raw body can close constructs opened before it.
        self.settle_line_braces(begin);
        if self.inline.is_some() {
            self.break_inline(begin);
        }

        let closing = format!("\\end{{{name}}}");
        match self.text[body..].find(&closing) {
            Some(rel) => {
                let at = body + rel;
                if let Some(index) = self.block_stack.pop() {
                    self.model.blocks[index].close = BlockClose::Matched { at };
                }
                self.pos = at + closing.len();
            }
            None => self.pos = self.bytes.len(),
        }
    }

    /// `\verb<d>...<d>` on a single line.
    fn verb(&mut self, name_end: usize) {
        let bytes = self.bytes;
        let mut i = name_end;
        if bytes.get(i) == Some(&b'*') {
            i += 1;
        }
        if let Some(&delim) = bytes.get(i) {
            if delim.is_ascii() && !delim.is_ascii_alphabetic() && !delim.is_ascii_whitespace() {
                let body = i + 1;
                let eol = lexis::line_end(bytes, body);
                if let Some(rel) = bytes[body..eol].iter().position(|&b| b == delim) {
                    self.pos = body + rel + 1;
                    return;
                }
            }
        }
        self.pos = name_end;
    }

    /// Look ahead for `*`, optional `[...]` arguments and the `{...}` key list.
    ///
    /// The braces are not consumed; the main loop still counts them.
    fn reference(&self, name: &str, start: usize, name_end: usize) -> Option<ReferenceSite> {
        let brace = self.argument_brace(name_end, true)?;
        let close = self.argument_close(brace)?;
        Some(ReferenceSite {
            command: name.to_string(),
            argument: self.text[brace + 1..close].to_string(),
            offset: start,
            argument_span: (brace + 1, close),
        })
    }

    fn newline(&mut self) {
        let at = self.pos;
        self.settle_line_braces(at);
        if self.inline.is_some() && lexis::starts_blank_line(self.bytes, at) {
            self.break_inline(at);
        }
        self.pos += 1;
    }

    /// Give every brace opened on the current line its anchor.
    fn settle_line_braces(&mut self, boundary: usize) {
        for brace in self.braces.iter_mut().rev() {
            if brace.anchor.is_some() {
                break;
            }
            brace.anchor = Some(lexis::content_end(self.bytes, brace.offset + 1, boundary));
        }
    }

    fn open_brace(&mut self) -> Result<()> {
        if self.braces.len() >= self.max_depth {
            return Err(Error::parse_limit(self.max_depth, self.pos));
        }
        self.braces.push(PendingBrace {
            offset: self.pos,
            anchor: None,
        });
        self.model.brace_trace.push(BraceEvent {
            offset: self.pos,
            depth: self.braces.len(),
        });
        self.pos += 1;
        Ok(())
    }

    fn close_brace(&mut self) {
        if self.braces.pop().is_none() {
            trace!(offset = self.pos, "unmatched close brace");
            self.model.unmatched_closes.push(self.pos);
        }
        self.model.brace_trace.push(BraceEvent {
            offset: self.pos,
            depth: self.braces.len(),
        });
        self.pos += 1;
    }

    fn dollar(&mut self) {
        let at = self.pos;
        let double = self.bytes.get(at + 1) == Some(&b'$');

        match self.inline.take() {
            None => {
                let delimiter = if double {
                    InlineDelimiter::DoubleDollar
                } else {
                    InlineDelimiter::Dollar
                };
                self.inline = Some(OpenInline {
                    delimiter,
                    start: at,
                });
                self.pos += delimiter.len();
            }
            Some(open) => match (open.delimiter, double) {
                // `$a$$b$` closes at the first dollar; the second opens anew.
                (InlineDelimiter::Dollar, _) => {
                    self.close_inline(open, at + 1);
                    self.pos += 1;
                }
                (InlineDelimiter::DoubleDollar, true) => {
                    self.close_inline(open, at + 2);
                    self.pos += 2;
                }
                (InlineDelimiter::DoubleDollar, false) => {
                    self.inline = Some(open);
                    self.pos += 1;
                }
            },
        }
    }

    fn close_inline(&mut self, open: OpenInline, end: usize) {
        self.model.inline_spans.push(InlineSpan {
            delimiter: open.delimiter,
            start: open.start,
            end: Some(end),
            content_end: end - open.delimiter.len(),
        });
    }

    /// End the open inline region without a closing delimiter.
    fn break_inline(&mut self, boundary: usize) {
        if let Some(open) = self.inline.take() {
            let lower = open.start + open.delimiter.len();
            let content_end = lexis::content_end(self.bytes, lower, boundary);
            debug!(
                start = open.start,
                content_end,
                delimiter = open.delimiter.as_str(),
                "unterminated inline region"
            );
            self.model.inline_spans.push(InlineSpan {
                delimiter: open.delimiter,
                start: open.start,
                end: None,
                content_end,
            });
        }
    }

    fn finish(mut self) -> StructuralModel {
        let len = self.bytes.len();
        self.settle_line_braces(len);
        self.break_inline(len);

        self.model.unmatched_opens = self
            .braces
            .iter()
            .map(|b| UnmatchedBrace {
                offset: b.offset,
                anchor: b.anchor.unwrap_or(b.offset + 1),
            })
            .collect();
        self.model.len = len;

        debug!(
            len,
            blocks = self.model.blocks.len(),
            open_blocks = self.block_stack.len(),
            inline_spans = self.model.inline_spans.len(),
            references = self.model.references.len(),
            "scan complete"
        );
        self.model
    }
}

/// Scan `text` with the given nesting ceiling.
pub fn scan(text: &str, max_depth: usize) -> Result<StructuralModel> {
    StructureScanner::new(text).with_max_depth(max_depth).scan()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn model(text: &str) -> StructuralModel {
        scan(text, DEFAULT_MAX_DEPTH).unwrap()
    }

    #[test]
    fn test_nested_blocks_matched() {
        let m = model("\\begin{figure}\\begin{center}x\\end{center}\\end{figure}");
        assert_eq!(m.blocks.len(), 2);
        assert!(m.blocks.iter().all(|b| b.is_matched()));
        assert_eq!(m.blocks[1].open, 14);
        assert!(m.is_closed());
    }

    #[test]
    fn test_mismatched_close_implicitly_closes_inner() {
        let text = "\\begin{quote}\\begin{itemize}\\item a\\end{quote}";
        let m = model(text);
        let end_at = text.find("\\end{quote}").unwrap();

        assert_eq!(m.blocks[0].close, BlockClose::Matched { at: end_at });
        assert_eq!(m.blocks[1].close, BlockClose::Implicit { at: end_at });
        assert!(m.is_closed());
        assert_eq!(m.unclosed_blocks().count(), 1);
    }

    #[test]
    fn test_stray_close_is_ignored() {
        let m = model("text\\end{center} more");
        assert_eq!(
            m.stray_closes,
            vec![StrayClose {
                name: "center".into(),
                offset: 4
            }]
        );
        assert!(m.blocks.is_empty());
    }

    #[test]
    fn test_unclosed_block_stays_open() {
        let m = model("\\begin{quote}text");
        assert_eq!(m.open_blocks().count(), 1);
        assert!(!m.is_closed());
    }

    #[test]
    fn test_inline_spans() {
        let m = model("a $x$ b $$y$$ c");
        assert_eq!(m.inline_spans.len(), 2);
        assert_eq!(m.inline_spans[0].end, Some(5));
        assert_eq!(m.inline_spans[1].delimiter, InlineDelimiter::DoubleDollar);
        assert_eq!(m.inline_spans[1].end, Some(13));
    }

    #[test]
    fn test_adjacent_inline_regions() {
        let m = model("$a$$b$");
        assert_eq!(m.inline_spans.len(), 2);
        assert!(m.inline_spans.iter().all(|s| s.is_terminated()));
        assert_eq!(m.inline_spans[1].start, 3);
    }

    #[test]
    fn test_inline_region_stops_at_paragraph_break() {
        let text = "cost is $5 and rises  % note\n\nNext $ok$ paragraph.";
        let m = model(text);
        let open: Vec<_> = m.unterminated_spans().collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].start, 8);
        assert_eq!(open[0].content_end, "cost is $5 and rises".len());
        assert_eq!(m.inline_spans.len(), 2);
    }

    #[test]
    fn test_escapes_are_not_structure() {
        let m = model(r"costs \$5, braces \{ \} and 50\% of \\");
        assert!(m.inline_spans.is_empty());
        assert!(m.brace_trace.is_empty());
        assert!(m.is_well_formed());
    }

    #[test]
    fn test_double_backslash_does_not_escape_dollar() {
        let m = model(r"line\\$x$");
        assert_eq!(m.inline_spans.len(), 1);
        assert_eq!(m.inline_spans[0].start, 6);
    }

    #[test]
    fn test_comments_hide_structure() {
        let m = model("text % \\begin{quote} { $\nmore");
        assert!(m.blocks.is_empty());
        assert!(m.brace_trace.is_empty());
        assert!(m.inline_spans.is_empty());
    }

    #[test]
    fn test_verbatim_body_is_raw() {
        let text = "\\begin{verbatim}\n$ { \\begin{quote}\n\\end{verbatim} $x$";
        let m = model(text);
        assert_eq!(m.blocks.len(), 1);
        assert!(m.blocks[0].is_matched());
        assert!(m.brace_trace.is_empty());
        assert_eq!(m.inline_spans.len(), 1);
        assert!(m.inline_spans[0].is_terminated());
    }

    #[test]
    fn test_unclosed_verbatim_runs_to_end() {
        let m = model("\\begin{verbatim} { $");
        assert_eq!(m.open_blocks().count(), 1);
        assert!(m.brace_trace.is_empty());
        assert!(m.inline_spans.is_empty());
    }

    #[test]
    fn test_verb_is_raw() {
        let m = model(r"use \verb|{$| here and \verb+}+ there");
        assert!(m.brace_trace.is_empty());
        assert!(m.inline_spans.is_empty());
    }

    #[test]
    fn test_brace_trace_and_clamping() {
        let m = model("} {a{b}");
        assert_eq!(m.unmatched_closes, vec![0]);
        let depths: Vec<_> = m.brace_trace.iter().map(|e| e.depth).collect();
        assert_eq!(depths, vec![0, 1, 2, 1]);
        assert_eq!(m.final_brace_depth(), 1);
        assert_eq!(
            m.unmatched_opens,
            vec![UnmatchedBrace {
                offset: 2,
                anchor: 7
            }]
        );
    }

    #[test]
    fn test_brace_anchor_is_line_content_end() {
        let text = "\\textbf{bold  % }\nnext line";
        let m = model(text);
        assert_eq!(m.unmatched_opens.len(), 1);
        assert_eq!(m.unmatched_opens[0].anchor, "\\textbf{bold".len());
    }

    #[test]
    fn test_reference_sites() {
        let text = r"\cite[p.~4]{knuth84} \ref{} \eqref{ } \citep*{a,b} \label{x}";
        let m = model(text);
        let commands: Vec<_> = m.references.iter().map(|r| r.command.as_str()).collect();
        assert_eq!(commands, vec!["cite", "ref", "eqref", "citep"]);
        assert_eq!(m.references[0].argument, "knuth84");
        assert_eq!(m.empty_references().count(), 2);
        assert!(m.brace_trace.iter().all(|e| e.depth <= 1));
        assert_eq!(m.final_brace_depth(), 0);
    }

    #[test]
    fn test_reference_without_argument_is_not_a_site() {
        let m = model("\\cite alone");
        assert!(m.references.is_empty());
    }

    #[test]
    fn test_block_depth_limit() {
        let text = "\\begin{a}".repeat(5);
        let err = scan(&text, 4).unwrap_err();
        assert!(matches!(
            err,
            Error::ParseLimitExceeded {
                limit: 4,
                offset: 36
            }
        ));
        assert!(scan(&text, 5).is_ok());
    }

    #[test]
    fn test_brace_depth_limit() {
        let err = scan("{{{", 2).unwrap_err();
        assert!(matches!(err, Error::ParseLimitExceeded { offset: 2, .. }));
    }

    #[test]
    fn test_offsets_monotonic() {
        let m = model("{a} $b$ {c} \\begin{x}\\end{x} $d$ \\cite{e}");
        assert!(m.brace_trace.windows(2).all(|w| w[0].offset <= w[1].offset));
        assert!(m.inline_spans.windows(2).all(|w| w[0].start <= w[1].start));
        assert!(m.blocks.windows(2).all(|w| w[0].open <= w[1].open));
    }

    #[test]
    fn test_non_ascii_text() {
        let m = model("Théorème: $x ≤ y$ et \\é {données}");
        assert_eq!(m.inline_spans.len(), 1);
        assert_eq!(m.final_brace_depth(), 0);
    }
}
