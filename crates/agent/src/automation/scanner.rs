//! Compiled auto-response rules and the per-stream match windows.

use regex::bytes::Regex;
use relay_core::task::AutoResponseRule;
use thiserror::Error;

/// Bytes kept per stream for trigger matching.
const WINDOW_LIMIT: usize = 64 * 1024;

#[derive(Debug, Error)]
#[error("auto-response rule {index} has an invalid trigger {pattern:?}: {source}")]
pub struct CompileError {
    pub index: usize,
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

/// How a rule becomes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arming {
    /// Timer measured from process start.
    Immediate,
    /// Timer measured from the moment the rule is armed.
    Delayed,
    /// Waits for its pattern, then its delay.
    Triggered,
}

#[derive(Debug)]
pub struct CompiledRule {
    pub rule: AutoResponseRule,
    pub pattern: Option<Regex>,
}

impl CompiledRule {
    pub fn arming(&self) -> Arming {
        if self.rule.immediate {
            Arming::Immediate
        } else if self.pattern.is_some() {
            Arming::Triggered
        } else {
            Arming::Delayed
        }
    }
}

/// Compile every trigger up front. One bad pattern fails the whole set.
pub fn compile(rules: &[AutoResponseRule]) -> Result<Vec<CompiledRule>, CompileError> {
    rules
        .iter()
        .enumerate()
        .map(|(index, rule)| {
            let pattern = match rule.trigger.as_deref() {
                Some(p) if !rule.is_untriggered() => Some(Regex::new(p).map_err(|source| CompileError {
                    index,
                    pattern: p.to_string(),
                    source,
                })?),
                _ => None,
            };
            Ok(CompiledRule {
                rule: rule.clone(),
                pattern,
            })
        })
        .collect()
}

/// Append-only tail of one output stream.
///
/// Matching starts at `scan_from`, just past the previous rule's match, so a
/// prompt that arrives in the same chunk as the one before it is still seen.
#[derive(Debug, Default)]
pub struct Window {
    bytes: Vec<u8>,
    scan_from: usize,
}

impl Window {
    pub fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        if self.bytes.len() > WINDOW_LIMIT {
            let excess = self.bytes.len() - WINDOW_LIMIT;
            self.bytes.drain(..excess);
            self.scan_from = self.scan_from.saturating_sub(excess);
        }
    }

    /// End offset of the first match in the unconsumed part.
    pub fn find(&self, pattern: &Regex) -> Option<usize> {
        pattern
            .find(&self.bytes[self.scan_from..])
            .map(|m| self.scan_from + m.end())
    }

    /// Later rules only see output after `end`.
    pub fn consume_to(&mut self, end: usize) {
        self.scan_from = end.min(self.bytes.len());
    }

    pub fn consume_all(&mut self) {
        self.scan_from = self.bytes.len();
    }
}
