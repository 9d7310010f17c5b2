pub mod cleanup;

use aho_corasick::AhoCorasick;
use std::collections::BTreeMap;

/// Parameters whose value may itself contain markup (full file bodies,
/// diff payloads). Their value runs to the LAST closing tag inside the
/// tool block instead of the first.
const GREEDY_VALUE_PARAMS: [&str; 2] = ["content", "diff"];

/// A parsed unit of one streamed assistant turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text(TextBlock),
    ToolUse(ToolUseBlock),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextBlock {
    pub content: String,
    pub partial: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolUseBlock {
    pub name: String,
    pub params: BTreeMap<String, String>,
    pub partial: bool,
}

impl ToolUseBlock {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

impl ContentBlock {
    pub fn is_partial(&self) -> bool {
        match self {
            ContentBlock::Text(block) => block.partial,
            ContentBlock::ToolUse(block) => block.partial,
        }
    }

    pub fn finalized(self) -> ContentBlock {
        match self {
            ContentBlock::Text(mut block) => {
                block.partial = false;
                ContentBlock::Text(block)
            }
            ContentBlock::ToolUse(mut block) => {
                block.partial = false;
                ContentBlock::ToolUse(block)
            }
        }
    }
}

/// The markup vocabulary the parser recognizes: tool tag names plus the
/// global parameter tag list. Built once from the tool registry.
pub struct ToolVocabulary {
    tool_names: Vec<String>,
    param_names: Vec<String>,
    opener_automaton: AhoCorasick,
}

impl ToolVocabulary {
    pub fn new(tool_names: Vec<String>, param_names: Vec<String>) -> Self {
        let openers: Vec<String> = tool_names.iter().map(|name| format!("<{name}>")).collect();
        let opener_automaton =
            AhoCorasick::new(&openers).expect("tool-name openers form a valid automaton");
        Self {
            tool_names,
            param_names,
            opener_automaton,
        }
    }

    pub fn tool_names(&self) -> &[String] {
        &self.tool_names
    }
}

/// Re-derives the full ordered block list from the cumulative streamed text.
///
/// The policy is to re-parse from scratch on every chunk rather than patch
/// the previous result incrementally; chunks are small and a pure function
/// of the accumulated text cannot drift out of sync with it.
pub struct StreamingParser {
    vocab: ToolVocabulary,
}

impl StreamingParser {
    pub fn new(vocab: ToolVocabulary) -> Self {
        Self { vocab }
    }

    pub fn parse(&self, text: &str) -> Vec<ContentBlock> {
        let mut blocks = Vec::new();
        let mut cursor = 0usize;

        while cursor < text.len() {
            let Some(found) = self.vocab.opener_automaton.find(&text[cursor..]) else {
                let rest = text[cursor..].to_string();
                if !rest.trim().is_empty() {
                    blocks.push(ContentBlock::Text(TextBlock {
                        content: rest.trim().to_string(),
                        partial: true,
                    }));
                }
                return blocks;
            };

            let opener_start = cursor + found.start();
            let opener_end = cursor + found.end();
            let tool_name = self.vocab.tool_names[found.pattern().as_usize()].clone();

            let leading = &text[cursor..opener_start];
            if !leading.trim().is_empty() {
                blocks.push(ContentBlock::Text(TextBlock {
                    content: leading.trim().to_string(),
                    partial: false,
                }));
            }

            let close_tag = format!("</{tool_name}>");
            let (body_end, partial, next_cursor) = match text[opener_end..].find(&close_tag) {
                Some(rel) => {
                    let close_at = opener_end + rel;
                    (close_at, false, close_at + close_tag.len())
                }
                None => (text.len(), true, text.len()),
            };

            let params = self.parse_params(&text[opener_end..body_end]);
            blocks.push(ContentBlock::ToolUse(ToolUseBlock {
                name: tool_name,
                params,
                partial,
            }));

            cursor = next_cursor;
        }

        blocks
    }

    fn parse_params(&self, body: &str) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        let mut cursor = 0usize;

        while let Some((param_start, name)) = self.find_param_opener(body, cursor) {
            let opener = format!("<{name}>");
            let value_start = param_start + opener.len();
            let close_tag = format!("</{name}>");

            let close_at = if GREEDY_VALUE_PARAMS.contains(&name.as_str()) {
                body[value_start..].rfind(&close_tag)
            } else {
                body[value_start..].find(&close_tag)
            };

            match close_at {
                Some(rel) => {
                    let value_end = value_start + rel;
                    params.insert(
                        name,
                        normalize_param_value(&body[value_start..value_end]),
                    );
                    cursor = value_end + close_tag.len();
                }
                None => {
                    // Unterminated parameter: everything to the end of the
                    // (necessarily partial) tool block is its value so far.
                    params.insert(name, normalize_param_value(&body[value_start..]));
                    return params;
                }
            }
        }

        params
    }

    fn find_param_opener(&self, body: &str, cursor: usize) -> Option<(usize, String)> {
        let mut earliest: Option<(usize, String)> = None;
        for name in &self.vocab.param_names {
            let opener = format!("<{name}>");
            if let Some(rel) = body[cursor..].find(&opener) {
                let at = cursor + rel;
                let replace = match &earliest {
                    Some((best, _)) => at < *best,
                    None => true,
                };
                if replace {
                    earliest = Some((at, name.clone()));
                }
            }
        }
        earliest
    }
}

/// Drop one leading and one trailing newline so tag layout does not leak
/// into values, and normalize CRLF.
fn normalize_param_value(raw: &str) -> String {
    let mut value = raw.replace("\r\n", "\n");
    if value.starts_with('\n') {
        value.remove(0);
    }
    if value.ends_with('\n') {
        value.pop();
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_parser() -> StreamingParser {
        StreamingParser::new(ToolVocabulary::new(
            vec![
                "read_file".to_string(),
                "write_to_file".to_string(),
                "attempt_completion".to_string(),
            ],
            vec![
                "path".to_string(),
                "content".to_string(),
                "result".to_string(),
            ],
        ))
    }

    #[test]
    fn test_plain_text_is_one_partial_block() {
        let parser = test_parser();
        let blocks = parser.parse("I will inspect the project first.");
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            ContentBlock::Text(text) => {
                assert_eq!(text.content, "I will inspect the project first.");
                assert!(text.partial);
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn test_text_then_complete_tool_block() {
        let parser = test_parser();
        let blocks =
            parser.parse("Let me check.\n<read_file>\n<path>src/main.rs</path>\n</read_file>");
        assert_eq!(blocks.len(), 2);
        match &blocks[0] {
            ContentBlock::Text(text) => {
                assert_eq!(text.content, "Let me check.");
                assert!(!text.partial);
            }
            other => panic!("unexpected block: {other:?}"),
        }
        match &blocks[1] {
            ContentBlock::ToolUse(tool) => {
                assert_eq!(tool.name, "read_file");
                assert_eq!(tool.param("path"), Some("src/main.rs"));
                assert!(!tool.partial);
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn test_unterminated_tool_block_is_partial() {
        let parser = test_parser();
        let blocks = parser.parse("<read_file>\n<path>src/ma");
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            ContentBlock::ToolUse(tool) => {
                assert!(tool.partial);
                assert_eq!(tool.param("path"), Some("src/ma"));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn test_content_param_swallows_embedded_markup() {
        let parser = test_parser();
        let text = "<write_to_file>\n<path>notes.md</path>\n<content>\nuse <path>tags</path> carefully\n</content>\n</write_to_file>";
        let blocks = parser.parse(text);
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            ContentBlock::ToolUse(tool) => {
                assert_eq!(
                    tool.param("content"),
                    Some("use <path>tags</path> carefully")
                );
                assert!(!tool.partial);
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn test_incomplete_opener_stays_text() {
        let parser = test_parser();
        let blocks = parser.parse("On it.\n<read_fi");
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            ContentBlock::Text(text) => {
                assert!(text.partial);
                assert!(text.content.ends_with("<read_fi"));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn test_incremental_equals_full_parse() {
        let parser = test_parser();
        let full = "Thinking it over.\n<write_to_file>\n<path>a.txt</path>\n<content>\nline one\nline two\n</content>\n</write_to_file>\nDone with the write.";

        let expected = parser.parse(full);
        for chunk_size in [1usize, 2, 3, 5, 11, 64] {
            let mut accumulated = String::new();
            let mut last = Vec::new();
            let chars: Vec<char> = full.chars().collect();
            for chunk in chars.chunks(chunk_size) {
                accumulated.extend(chunk.iter());
                last = parser.parse(&accumulated);
            }
            assert_eq!(last, expected, "chunk size {chunk_size} diverged");
        }
    }
}
