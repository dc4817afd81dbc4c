//! Per-file token progress on the client. Numbers are estimates for display
//! and may be recomputed at any time.

use std::collections::BTreeMap;
use std::sync::Arc;

use drafter_core::{ApproxTokenCounter, TokenCounter};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileProgress {
    pub path: String,
    pub streamed_tokens: usize,
    /// Size of the content the edit starts from
    pub base_tokens: usize,
    /// Tokens the reply suggests this file will add
    pub estimated_tokens: usize,
    pub done: bool,
}

impl FileProgress {
    fn expected_tokens(&self) -> usize {
        self.estimated_tokens.max(self.base_tokens)
    }

    /// Completion ratio in `0.0..=1.0`, unknown when nothing is expected.
    pub fn fraction(&self) -> Option<f64> {
        if self.done {
            return Some(1.0);
        }
        match self.expected_tokens() {
            0 => None,
            expected => Some((self.streamed_tokens as f64 / expected as f64).min(1.0)),
        }
    }
}

pub struct ProgressTracker {
    counter: Arc<dyn TokenCounter>,
    files: BTreeMap<String, FileProgress>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(Arc::new(ApproxTokenCounter::default()))
    }
}

impl ProgressTracker {
    pub fn new(counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            counter,
            files: BTreeMap::new(),
        }
    }

    fn entry(&mut self, path: &str) -> &mut FileProgress {
        self.files
            .entry(path.to_string())
            .or_insert_with(|| FileProgress {
                path: path.to_string(),
                ..Default::default()
            })
    }

    pub fn set_base(&mut self, path: &str, content: &str) {
        let tokens = self.counter.count(content);
        self.entry(path).base_tokens = tokens;
    }

    /// Seed per-file estimates from code blocks in the reply that follow a
    /// mention of the file's path.
    pub fn estimate_from_reply(&mut self, reply: &str, files: &[String]) {
        for (path, block) in code_blocks_by_file(reply, files) {
            let tokens = self.counter.count(&block);
            self.entry(&path).estimated_tokens += tokens;
        }
        for path in files {
            self.entry(path);
        }
    }

    pub fn record(&mut self, path: &str, delta: &str) -> FileProgress {
        let tokens = self.counter.count(delta);
        let progress = self.entry(path);
        progress.streamed_tokens += tokens;
        progress.clone()
    }

    pub fn mark_done(&mut self, path: &str) -> FileProgress {
        let progress = self.entry(path);
        progress.done = true;
        progress.clone()
    }

    pub fn get(&self, path: &str) -> Option<&FileProgress> {
        self.files.get(path)
    }

    pub fn all(&self) -> impl Iterator<Item = &FileProgress> {
        self.files.values()
    }

    pub fn total_streamed(&self) -> usize {
        self.files.values().map(|p| p.streamed_tokens).sum()
    }
}

/// Fenced code blocks of `reply`, attributed to the most recently mentioned
/// planned path. Blocks before any mention are ignored.
fn code_blocks_by_file(reply: &str, files: &[String]) -> Vec<(String, String)> {
    let mut blocks = Vec::new();
    let mut current: Option<&String> = None;
    let mut block: Option<String> = None;

    for line in reply.lines() {
        let fence = line.trim_start().starts_with("```");
        match block.as_mut() {
            Some(body) if fence => {
                if let Some(path) = current {
                    blocks.push((path.clone(), std::mem::take(body)));
                }
                block = None;
            }
            Some(body) => {
                body.push_str(line);
                body.push('\n');
            }
            None if fence => block = Some(String::new()),
            None => {
                if let Some(path) = files.iter().find(|f| line.contains(f.as_str())) {
                    current = Some(path);
                }
            }
        }
    }
    blocks
}
