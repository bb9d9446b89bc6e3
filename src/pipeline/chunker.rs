//! Splits accumulating LLM text into synthesizable units.
//!
//! The chunker keeps a buffer of not-yet-emitted text. Each push appends
//! and extracts every unit that is complete under the configured
//! strategy; the trailing incomplete fragment stays buffered until
//! [`UnitChunker::flush`]. Units shorter than the minimum length are not
//! emitted on their own; they merge into the following unit.

use crate::config::{ChunkingStrategy, PipelineConfig};

/// Sentence terminators.
const SENTENCE_PUNCT: &[char] = &['.', '?', '!'];
/// Sentence plus clause punctuation, for the lower-latency strategy.
const CLAUSE_PUNCT: &[char] = &['.', '?', '!', ',', ';', ':'];
/// A paragraph candidate longer than this splits at sentence boundaries.
const PARAGRAPH_CEILING_CHARS: usize = 400;

pub struct UnitChunker {
    strategy: ChunkingStrategy,
    min_len: usize,
    fixed_len: usize,
    buf: String,
}

impl UnitChunker {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            strategy: config.chunking_strategy,
            min_len: config.min_chunk_length,
            fixed_len: config.fixed_chunk_chars.max(1),
            buf: String::new(),
        }
    }

    /// Append streamed text and extract complete units, in order.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buf.push_str(chunk);
        match self.strategy {
            ChunkingStrategy::Sentence => self.extract_punct(SENTENCE_PUNCT),
            ChunkingStrategy::Clause => self.extract_punct(CLAUSE_PUNCT),
            ChunkingStrategy::Paragraph => self.extract_paragraph(),
            ChunkingStrategy::Word => self.extract_words(),
            ChunkingStrategy::Fixed => self.extract_fixed(),
        }
    }

    /// Emit the trailing fragment, if any, as the final unit. The minimum
    /// length does not apply: a short tail is still spoken.
    pub fn flush(&mut self) -> Option<String> {
        let tail = self.buf.trim().to_owned();
        self.buf.clear();
        (!tail.is_empty()).then_some(tail)
    }

    /// Characters currently buffered (trailing fragment).
    pub fn buffered_len(&self) -> usize {
        self.buf.chars().count()
    }

    /// Extract units ending at a terminator run followed by whitespace.
    fn extract_punct(&mut self, terminators: &[char]) -> Vec<String> {
        let chars: Vec<(usize, char)> = self.buf.char_indices().collect();
        let mut units = Vec::new();
        let mut start = 0usize;
        let mut i = 0usize;
        while i < chars.len() {
            if terminators.contains(&chars[i].1) {
                let mut j = i + 1;
                while j < chars.len() && terminators.contains(&chars[j].1) {
                    j += 1;
                }
                // Require following whitespace so decimals ("3.5") and
                // mid-token punctuation never split.
                if j < chars.len() && chars[j].1.is_whitespace() {
                    let end = chars[j].0;
                    let unit = self.buf[start..end].trim();
                    if unit.chars().count() >= self.min_len {
                        units.push(unit.to_owned());
                        start = end;
                    }
                    i = j;
                    continue;
                }
            }
            i += 1;
        }
        if start > 0 {
            self.buf.drain(..start);
        }
        units
    }

    /// Units end at newline runs; an oversized candidate additionally
    /// splits at sentence boundaries so one giant paragraph cannot stall
    /// synthesis.
    fn extract_paragraph(&mut self) -> Vec<String> {
        let mut units = Vec::new();
        loop {
            let Some(nl) = self.buf.find('\n') else { break };
            let candidate = self.buf[..nl].trim().to_owned();
            // Consume the newline run along with the candidate.
            let after = self.buf[nl..]
                .char_indices()
                .find(|(_, c)| *c != '\n')
                .map_or(self.buf.len(), |(off, _)| nl + off);
            if candidate.chars().count() >= self.min_len {
                units.push(candidate);
                self.buf.drain(..after);
            } else if candidate.is_empty() {
                self.buf.drain(..after);
            } else {
                // Too short to stand alone: merge with the next paragraph
                // by replacing the newline run with one space.
                self.buf.replace_range(nl..after, " ");
            }
        }
        if self.buf.chars().count() > PARAGRAPH_CEILING_CHARS {
            units.extend(self.extract_punct(SENTENCE_PUNCT));
        }
        units
    }

    fn extract_words(&mut self) -> Vec<String> {
        let chars: Vec<(usize, char)> = self.buf.char_indices().collect();
        let mut units = Vec::new();
        let mut start = 0usize;
        for window in chars.windows(2) {
            let (_, c) = window[0];
            let (end, next) = window[1];
            if !c.is_whitespace() && next.is_whitespace() {
                let unit = self.buf[start..end].trim();
                if unit.chars().count() >= self.min_len {
                    units.push(unit.to_owned());
                    start = end;
                }
            }
        }
        if start > 0 {
            self.buf.drain(..start);
        }
        units
    }

    fn extract_fixed(&mut self) -> Vec<String> {
        let mut units = Vec::new();
        loop {
            let lead_ws = self.buf.len() - self.buf.trim_start().len();
            if lead_ws > 0 {
                self.buf.drain(..lead_ws);
            }
            let mut indices = self.buf.char_indices();
            match indices.nth(self.fixed_len) {
                Some((end, _)) => {
                    let unit: String = self.buf.drain(..end).collect();
                    let unit = unit.trim().to_owned();
                    if !unit.is_empty() {
                        units.push(unit);
                    }
                }
                None => break,
            }
        }
        units
    }
}
