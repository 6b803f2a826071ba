//! Pull a LaTeX document out of a model reply.

/// Body of the first fenced block tagged `latex`, then `tex`, then untagged.
///
/// Falls back to the whole reply, trimmed, when there is no usable fence.
pub fn extract_fenced_document(reply: &str) -> String {
    for tag in ["latex", "tex", ""] {
        if let Some(body) = fenced_body(reply, tag) {
            return body.to_string();
        }
    }
    reply.trim().to_string()
}

fn fenced_body<'a>(reply: &'a str, tag: &str) -> Option<&'a str> {
    let opener = format!("```{tag}\n");
    let mut search = 0;
    while let Some(rel) = reply[search..].find(&opener) {
        let body_start = search + rel + opener.len();
        // An untagged search must not pick up the tag line of a tagged fence.
        let at_line_start = search + rel == 0 || reply.as_bytes()[search + rel - 1] == b'\n';
        if at_line_start {
            if let Some(end) = reply[body_start..].find("\n```") {
                return Some(&reply[body_start..body_start + end]);
            }
            // Empty body: the closing fence directly follows the opener.
            if reply[body_start..].starts_with("```") {
                return Some("");
            }
        }
        search = body_start;
    }
    None
}
