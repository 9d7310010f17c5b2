use super::workspace::WorkspaceOps;
use super::{Tool, ToolContext};
use crate::approval::ToolCategory;
use crate::parser::ToolUseBlock;
use crate::util::text_stats;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task;

fn required<'a>(call: &'a ToolUseBlock, key: &str) -> Result<&'a str> {
    match call.param(key) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => bail!("missing required parameter '{key}'"),
    }
}

pub struct ReadFileTool {
    workspace: Arc<WorkspaceOps>,
}

impl ReadFileTool {
    pub fn new(workspace: Arc<WorkspaceOps>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &'static str {
        "Read the contents of a file at the given path."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["path"]
    }

    fn preview(&self, call: &ToolUseBlock) -> String {
        format!("read file: {}", call.param("path").unwrap_or("<missing>"))
    }

    async fn execute(&self, _ctx: &ToolContext, call: &ToolUseBlock) -> Result<String> {
        let resolved = self.workspace.resolve(required(call, "path")?)?;
        let workspace = self.workspace.clone();
        task::spawn_blocking(move || workspace.read_file(&resolved))
            .await
            .context("read task failed")?
    }
}

pub struct WriteToFileTool {
    workspace: Arc<WorkspaceOps>,
}

impl WriteToFileTool {
    pub fn new(workspace: Arc<WorkspaceOps>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for WriteToFileTool {
    fn name(&self) -> &'static str {
        "write_to_file"
    }

    fn description(&self) -> &'static str {
        "Write complete content to a file, creating it (and parent directories) if needed."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Write
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["path", "content"]
    }

    fn streams_last_param(&self) -> bool {
        true
    }

    fn preview(&self, call: &ToolUseBlock) -> String {
        let path = call.param("path").unwrap_or("<missing>");
        let (chars, lines) = text_stats(call.param("content").unwrap_or(""));
        format!("write file: {path} ({chars} chars, {lines} lines)")
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolUseBlock) -> Result<String> {
        let path = required(call, "path")?;
        let content = required(call, "content")?.to_string();
        let resolved = self.workspace.resolve(path)?;

        let staged = ctx.editor.stage(&resolved.absolute, content).await?;
        ctx.set_active_edit(Some(staged.clone()));
        let saved = ctx.editor.save(&staged).await;
        ctx.set_active_edit(None);
        let saved = saved?;

        let (chars, lines) = text_stats(&saved.final_content);
        let mut summary = format!("Wrote {path} ({chars} chars, {lines} lines).");
        if saved.user_edits {
            summary.push_str(" Note: the user edited this file while the change was pending.");
        }
        Ok(summary)
    }
}

pub struct ReplaceInFileTool {
    workspace: Arc<WorkspaceOps>,
}

impl ReplaceInFileTool {
    pub fn new(workspace: Arc<WorkspaceOps>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ReplaceInFileTool {
    fn name(&self) -> &'static str {
        "replace_in_file"
    }

    fn description(&self) -> &'static str {
        "Apply targeted SEARCH/REPLACE edits to an existing file. Each block replaces the first exact occurrence of its SEARCH text."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Write
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["path", "diff"]
    }

    fn streams_last_param(&self) -> bool {
        true
    }

    fn preview(&self, call: &ToolUseBlock) -> String {
        let path = call.param("path").unwrap_or("<missing>");
        let blocks = call
            .param("diff")
            .map(|d| d.matches(SEARCH_MARKER).count())
            .unwrap_or(0);
        format!("edit file: {path} ({blocks} replacement(s))")
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolUseBlock) -> Result<String> {
        let path = required(call, "path")?;
        let diff = required(call, "diff")?;
        let resolved = self.workspace.resolve(path)?;

        let workspace = self.workspace.clone();
        let read_target = resolved.clone();
        let before = task::spawn_blocking(move || workspace.read_file(&read_target))
            .await
            .context("read task failed")??;

        let after = apply_search_replace(&before, diff)?;

        let staged = ctx.editor.stage(&resolved.absolute, after).await?;
        ctx.set_active_edit(Some(staged.clone()));
        let saved = ctx.editor.save(&staged).await;
        ctx.set_active_edit(None);
        let saved = saved?;

        let (before_chars, before_lines) = text_stats(&before);
        let (after_chars, after_lines) = text_stats(&saved.final_content);
        let mut summary = format!(
            "Updated {path} ({before_chars} chars/{before_lines} lines -> {after_chars} chars/{after_lines} lines)."
        );
        if saved.user_edits {
            summary.push_str(" Note: the user edited this file while the change was pending.");
        }
        Ok(summary)
    }
}

const SEARCH_MARKER: &str = "<<<<<<< SEARCH";
const DIVIDER_MARKER: &str = "=======";
const REPLACE_MARKER: &str = ">>>>>>> REPLACE";

/// Apply SEARCH/REPLACE blocks in order. Each SEARCH text must occur in
/// the current content; the first occurrence is replaced.
pub fn apply_search_replace(content: &str, diff: &str) -> Result<String> {
    let mut out = content.to_string();
    let mut applied = 0usize;
    let mut cursor = 0usize;

    while let Some(rel) = diff[cursor..].find(SEARCH_MARKER) {
        let search_start = cursor + rel + SEARCH_MARKER.len();
        let Some(divider_rel) = diff[search_start..].find(DIVIDER_MARKER) else {
            bail!("malformed diff: SEARCH block without '{DIVIDER_MARKER}'");
        };
        let divider_at = search_start + divider_rel;
        let replace_start = divider_at + DIVIDER_MARKER.len();
        let Some(end_rel) = diff[replace_start..].find(REPLACE_MARKER) else {
            bail!("malformed diff: SEARCH block without '{REPLACE_MARKER}'");
        };
        let end_at = replace_start + end_rel;

        let search = trim_block(&diff[search_start..divider_at]);
        let replace = trim_block(&diff[replace_start..end_at]);

        if search.is_empty() {
            bail!("malformed diff: empty SEARCH text");
        }
        if !out.contains(&search) {
            bail!("SEARCH text not found in file:\n{search}");
        }
        out = out.replacen(&search, &replace, 1);
        applied += 1;
        cursor = end_at + REPLACE_MARKER.len();
    }

    if applied == 0 {
        bail!("diff contained no SEARCH/REPLACE blocks");
    }
    Ok(out)
}

/// Block bodies are newline-delimited from their markers.
fn trim_block(raw: &str) -> String {
    let mut value = raw.replace("\r\n", "\n");
    if value.starts_with('\n') {
        value.remove(0);
    }
    if value.ends_with('\n') {
        value.pop();
    }
    value
}

pub struct ListFilesTool {
    workspace: Arc<WorkspaceOps>,
}

impl ListFilesTool {
    pub fn new(workspace: Arc<WorkspaceOps>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &'static str {
        "list_files"
    }

    fn description(&self) -> &'static str {
        "List files and directories under a path. Set <recursive>true</recursive> to walk the whole tree."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["path"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["recursive"]
    }

    fn preview(&self, call: &ToolUseBlock) -> String {
        format!("list files: {}", call.param("path").unwrap_or("<missing>"))
    }

    async fn execute(&self, _ctx: &ToolContext, call: &ToolUseBlock) -> Result<String> {
        let resolved = self.workspace.resolve(required(call, "path")?)?;
        let recursive = call
            .param("recursive")
            .and_then(|v| crate::util::parse_bool_str(v))
            .unwrap_or(false);
        let workspace = self.workspace.clone();
        task::spawn_blocking(move || workspace.list_files(&resolved, recursive, 500))
            .await
            .context("list task failed")?
    }
}

pub struct SearchFilesTool {
    workspace: Arc<WorkspaceOps>,
}

impl SearchFilesTool {
    pub fn new(workspace: Arc<WorkspaceOps>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &'static str {
        "search_files"
    }

    fn description(&self) -> &'static str {
        "Search file contents under a path and return matching lines with locations."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["path", "regex"]
    }

    fn preview(&self, call: &ToolUseBlock) -> String {
        format!(
            "search '{}' in {}",
            call.param("regex").unwrap_or("<missing>"),
            call.param("path").unwrap_or("<missing>")
        )
    }

    async fn execute(&self, _ctx: &ToolContext, call: &ToolUseBlock) -> Result<String> {
        let resolved = self.workspace.resolve(required(call, "path")?)?;
        let pattern = required(call, "regex")?.to_string();
        let workspace = self.workspace.clone();
        task::spawn_blocking(move || workspace.search_files(&resolved, &pattern, 50))
            .await
            .context("search task failed")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_search_replace_single_block() {
        let content = "fn main() {\n    println!(\"old\");\n}\n";
        let diff = "<<<<<<< SEARCH\n    println!(\"old\");\n=======\n    println!(\"new\");\n>>>>>>> REPLACE";
        let out = apply_search_replace(content, diff).expect("apply");
        assert_eq!(out, "fn main() {\n    println!(\"new\");\n}\n");
    }

    #[test]
    fn test_apply_search_replace_multiple_blocks_in_order() {
        let content = "a\nb\nc\n";
        let diff = concat!(
            "<<<<<<< SEARCH\na\n=======\nA\n>>>>>>> REPLACE\n",
            "<<<<<<< SEARCH\nc\n=======\nC\n>>>>>>> REPLACE",
        );
        let out = apply_search_replace(content, diff).expect("apply");
        assert_eq!(out, "A\nb\nC\n");
    }

    #[test]
    fn test_apply_search_replace_missing_text_fails() {
        let result = apply_search_replace(
            "hello",
            "<<<<<<< SEARCH\nabsent\n=======\nx\n>>>>>>> REPLACE",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_apply_search_replace_requires_blocks() {
        assert!(apply_search_replace("hello", "no markers here").is_err());
    }

    #[test]
    fn test_apply_search_replace_deletion_block() {
        let content = "keep\nremove me\nkeep too\n";
        let diff = "<<<<<<< SEARCH\nremove me\n=======\n>>>>>>> REPLACE";
        let out = apply_search_replace(content, diff).expect("apply");
        assert_eq!(out, "keep\n\nkeep too\n");
    }
}
