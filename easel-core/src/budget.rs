//! Prompt length budgeting.
//!
//! The downstream CLIP text encoder accepts a fixed number of tokens; prompts
//! composed from a style fragment plus caller text routinely overflow it.
//! Rather than depending on the tokenizer here, length is approximated by a
//! pluggable unit estimator (whitespace words by default) and the prompt is
//! compressed so that style vocabulary survives intact while as much caller
//! content as fits is kept.

/// Approximates how many encoder units a piece of text will occupy.
/// Substitute a precise tokenizer-backed implementation without touching the
/// compression algorithm.
pub trait LengthEstimator: Send + Sync {
    fn units(&self, text: &str) -> usize;
}

/// Default estimator: one unit per whitespace-delimited word.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceEstimator;

impl LengthEstimator for WhitespaceEstimator {
    fn units(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

/// Unit budget matching the CLIP encoder input window, minus special tokens.
pub const DEFAULT_PROMPT_BUDGET: usize = 75;

/// Comma segments containing any of these are style vocabulary and are kept
/// ahead of caller content, never truncated mid-segment.
const PRIORITY_KEYWORDS: &[&str] = &[
    "style",
    "art",
    "illustration",
    "cartoon",
    "anime",
    "manga",
    "storybook",
    "watercolor",
    "photorealistic",
    "realistic",
    "cinematic",
    "lighting",
    "character",
    "fantasy",
    "whimsical",
    "shaded",
    "colors",
    "detailed",
    "quality",
];

/// At most this many style segments are preserved verbatim.
const MAX_STYLE_SEGMENTS: usize = 5;

/// A truncated content segment is only worth appending if this many units of
/// budget remain.
const MIN_TAIL_UNITS: usize = 3;

pub struct PromptBudgeter {
    estimator: Box<dyn LengthEstimator>,
    max_units: usize,
}

impl PromptBudgeter {
    pub fn new(max_units: usize) -> Self {
        Self::with_estimator(max_units, Box::new(WhitespaceEstimator))
    }

    pub fn with_estimator(max_units: usize, estimator: Box<dyn LengthEstimator>) -> Self {
        Self {
            estimator,
            max_units,
        }
    }

    pub fn max_units(&self) -> usize {
        self.max_units
    }

    /// Fit `prompt` into the unit budget.
    ///
    /// Prompts already inside the budget come back unchanged. Overlong
    /// prompts are split on commas; up to [`MAX_STYLE_SEGMENTS`] segments
    /// carrying style vocabulary are kept first and whole, then content
    /// segments are appended in original order while they fit entirely. The
    /// first content segment that does not fit is word-truncated into the
    /// remaining budget (if enough budget is left to be useful) and ends the
    /// composition. Should the style segments alone exhaust the budget, the
    /// whole prompt is word-truncated instead.
    pub fn budget(&self, prompt: &str) -> (String, bool) {
        if self.estimator.units(prompt) <= self.max_units {
            return (prompt.to_string(), false);
        }

        let mut style_segments = Vec::new();
        let mut content_segments = Vec::new();
        for segment in prompt.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if is_style_segment(segment) && style_segments.len() < MAX_STYLE_SEGMENTS {
                style_segments.push(segment);
            } else if !is_style_segment(segment) {
                content_segments.push(segment);
            }
        }

        let style_units: usize = style_segments
            .iter()
            .map(|segment| self.estimator.units(segment))
            .sum();
        if style_units > self.max_units {
            return (self.truncate_to_units(prompt, self.max_units), true);
        }

        let mut kept: Vec<String> = style_segments.iter().map(|s| s.to_string()).collect();
        let mut remaining = self.max_units - style_units;
        for segment in content_segments {
            let units = self.estimator.units(segment);
            if units <= remaining {
                remaining -= units;
                kept.push(segment.to_string());
            } else {
                if remaining > MIN_TAIL_UNITS {
                    let tail = self.truncate_to_units(segment, remaining);
                    if !tail.is_empty() {
                        kept.push(tail);
                    }
                }
                break;
            }
        }

        (kept.join(", "), true)
    }

    /// Longest word prefix of `text` whose estimate fits in `budget` units.
    fn truncate_to_units(&self, text: &str, budget: usize) -> String {
        let mut truncated = String::new();
        for word in text.split_whitespace() {
            let candidate = if truncated.is_empty() {
                word.to_string()
            } else {
                format!("{truncated} {word}")
            };
            if self.estimator.units(&candidate) > budget {
                break;
            }
            truncated = candidate;
        }
        truncated
    }
}

fn is_style_segment(segment: &str) -> bool {
    let lowered = segment.to_lowercase();
    PRIORITY_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}
