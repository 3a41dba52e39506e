//! Content filters applied when materializing file content.
//!
//! A filter stack is looked up per *target* path (the path the content will
//! occupy in the working tree after the transform), never per trans-id. When
//! content is written out, the stack is applied in reverse order so that the
//! first filter in the stack is the outermost one.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::model::types::FileId;

/// What a filter knows about the content it is transforming.
#[derive(Clone, Copy, Debug)]
pub struct FilterContext<'a> {
    pub path: &'a str,
    pub file_id: Option<&'a FileId>,
}

/// A reversible byte-stream transform (e.g. end-of-line conversion).
pub trait ContentFilter: fmt::Debug + Send + Sync {
    /// Convert canonical content into its working-tree form.
    fn write(&self, chunks: Vec<Vec<u8>>, ctx: &FilterContext<'_>) -> Vec<Vec<u8>>;

    /// Convert working-tree content back into canonical form.
    fn read(&self, chunks: Vec<Vec<u8>>, _ctx: &FilterContext<'_>) -> Vec<Vec<u8>> {
        chunks
    }
}

pub type FilterStack = Vec<Arc<dyn ContentFilter>>;

/// Source of filter stacks for working-tree paths.
pub trait FilterProvider: fmt::Debug {
    fn filter_stack(&self, path: &str) -> FilterStack;
}

/// Apply a filter stack in output direction.
#[must_use]
pub fn filtered_output_bytes(
    chunks: Vec<Vec<u8>>,
    stack: &[Arc<dyn ContentFilter>],
    ctx: &FilterContext<'_>,
) -> Vec<Vec<u8>> {
    stack
        .iter()
        .rev()
        .fold(chunks, |acc, filter| filter.write(acc, ctx))
}

// ---------------------------------------------------------------------------
// Built-in filters
// ---------------------------------------------------------------------------

/// Converts `\n` to `\r\n` on output, and back on input.
#[derive(Clone, Copy, Debug, Default)]
pub struct CrlfFilter;

impl ContentFilter for CrlfFilter {
    fn write(&self, chunks: Vec<Vec<u8>>, _ctx: &FilterContext<'_>) -> Vec<Vec<u8>> {
        let joined = chunks.concat();
        let mut out = Vec::with_capacity(joined.len());
        let mut prev = 0u8;
        for byte in joined {
            if byte == b'\n' && prev != b'\r' {
                out.push(b'\r');
            }
            out.push(byte);
            prev = byte;
        }
        vec![out]
    }

    fn read(&self, chunks: Vec<Vec<u8>>, _ctx: &FilterContext<'_>) -> Vec<Vec<u8>> {
        let joined = chunks.concat();
        let mut out = Vec::with_capacity(joined.len());
        let mut iter = joined.iter().peekable();
        while let Some(&byte) = iter.next() {
            if byte == b'\r' && iter.peek() == Some(&&b'\n') {
                continue;
            }
            out.push(byte);
        }
        vec![out]
    }
}

/// Filter stacks selected by file-name suffix (e.g. `".txt"`).
#[derive(Clone, Debug, Default)]
pub struct SuffixFilters {
    by_suffix: BTreeMap<String, FilterStack>,
}

impl SuffixFilters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `stack` for paths ending in `suffix`.
    #[must_use]
    pub fn with(mut self, suffix: &str, stack: FilterStack) -> Self {
        self.by_suffix.insert(suffix.to_owned(), stack);
        self
    }
}

impl FilterProvider for SuffixFilters {
    fn filter_stack(&self, path: &str) -> FilterStack {
        self.by_suffix
            .iter()
            .filter(|(suffix, _)| path.ends_with(suffix.as_str()))
            .max_by_key(|(suffix, _)| suffix.len())
            .map(|(_, stack)| stack.clone())
            .unwrap_or_default()
    }
}
