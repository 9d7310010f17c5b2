//! Display-only text cleanup. None of this affects parsing correctness;
//! it keeps transient markup artifacts from flashing on screen.

/// Remove a reasoning delimiter pair the model may wrap its prelude in.
pub fn strip_reasoning_tags(text: &str) -> String {
    text.replace("<thinking>", "").replace("</thinking>", "")
}

/// If the tail of the text looks like the start of an unterminated markup
/// tag (`<` or `</` followed only by letters/underscores, no closing `>`),
/// trim it. The next chunk will complete the tag and re-derive the text.
pub fn trim_partial_tag_tail(text: &str) -> String {
    let Some(open_at) = text.rfind('<') else {
        return text.to_string();
    };

    let tail = &text[open_at + 1..];
    let tail = tail.strip_prefix('/').unwrap_or(tail);
    let looks_like_tag_start = tail
        .chars()
        .all(|c| c.is_ascii_alphabetic() || c == '_');

    if looks_like_tag_start {
        text[..open_at].trim_end().to_string()
    } else {
        text.to_string()
    }
}

/// Some models erroneously close their final answer with a dangling code
/// fence. Only applied once a block is final.
pub fn strip_trailing_code_fence(text: &str) -> String {
    let trimmed = text.trim_end();
    if let Some(stripped) = trimmed.strip_suffix("```") {
        stripped.trim_end().to_string()
    } else {
        text.to_string()
    }
}

/// The full presentation pipeline for a text block.
pub fn present_text(content: &str, partial: bool) -> String {
    let cleaned = strip_reasoning_tags(content);
    if partial {
        trim_partial_tag_tail(&cleaned)
    } else {
        strip_trailing_code_fence(&cleaned)
    }
}
