use crate::classifier::MarkerSet;
use crate::config::{MarkerConfig, ValidationConfig};
use crate::llm::Summarize;
use crate::prompt::CONTENT_PLACEHOLDER;
use crate::SummarizationError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, instrument};

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid tag pattern"));

/// Characters a finished sentence may end with.
const TERMINAL_CHARS: &[char] = &['.', '!', '?', '。', '！', '？', '」', '』', ')', '）', '"', '”', '*', ']'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Fail,
}

/// Quality assessment of one generated summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub verdict: Verdict,
    /// 0.0 (unusable) to 1.0.
    pub score: f32,
    pub issues: Vec<String>,
    /// Why the summary failed; `None` on a pass.
    pub reason: Option<String>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}

/// Second-pass check on a row whose extraction looked fine: summarizes the text,
/// then looks at the summary for signs that the source was an error page after all.
pub struct SummaryValidator<L> {
    summarizer: L,
    prompt_template: String,
    refusals: MarkerSet,
    unavailable: MarkerSet,
    config: ValidationConfig,
}

impl<L: Summarize> SummaryValidator<L> {
    pub fn new(
        summarizer: L,
        prompt_template: impl Into<String>,
        markers: &MarkerConfig,
        config: ValidationConfig,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            summarizer,
            prompt_template: prompt_template.into(),
            refusals: MarkerSet::new(&markers.refusal)?,
            unavailable: MarkerSet::new(&markers.soft_failure)?,
            config,
        })
    }

    /// Runs the summarization call once with the configured prompt template.
    #[instrument(skip(self, text), fields(text_length = text.len()))]
    pub async fn summarize(&self, text: &str) -> Result<String, SummarizationError> {
        self.summarizer.summarize(text, &self.prompt_template).await
    }

    /// Scores `summary` against the text it was generated from.
    pub fn validate(&self, source_text: &str, summary: &str) -> ValidationReport {
        let summary = summary.trim();
        if summary.is_empty() {
            return ValidationReport {
                verdict: Verdict::Fail,
                score: 0.0,
                issues: vec!["empty summary".to_string()],
                reason: Some("empty summary".to_string()),
            };
        }

        let mut issues = Vec::new();
        let mut critical = Vec::new();
        let mut factors: Vec<f32> = Vec::new();

        if let Some(marker) = self.refusals.find(summary) {
            critical.push(format!("refusal phrase [{}] '{}'", marker.locale, marker.pattern));
            factors.push(-0.8);
        }

        if let Some(marker) = self.unavailable.find(summary) {
            critical.push(format!(
                "summary describes an unavailable page [{}] '{}'",
                marker.locale, marker.pattern
            ));
            factors.push(-0.8);
        }

        if self.has_prompt_artifact(summary) {
            critical.push("prompt text leaked into summary".to_string());
            factors.push(-0.5);
        }

        let summary_len = summary.chars().count();
        let source_len = source_text.trim().chars().count();
        if summary_len < self.config.min_summary_chars {
            critical.push(format!("summary truncated ({} chars)", summary_len));
            factors.push(-0.6);
        } else if source_len >= 200 && summary_len as f32 >= source_len as f32 * self.config.echo_ratio {
            critical.push("summary echoes the source".to_string());
            factors.push(-0.4);
        } else {
            factors.push(0.2);
        }

        if !summary.ends_with(TERMINAL_CHARS) {
            issues.push("summary may be cut off".to_string());
            factors.push(-0.1);
        }

        if HTML_TAG.find_iter(summary).count() > 10 {
            issues.push("too many HTML tags".to_string());
            factors.push(-0.2);
        }

        if has_repeated_run(summary, 11) {
            issues.push("repeated character patterns".to_string());
            factors.push(-0.3);
        }

        if summary.chars().any(|c| c == '\u{FFFD}' || (c.is_control() && !c.is_whitespace())) {
            issues.push("encoding issues detected".to_string());
            factors.push(-0.2);
        }

        let score = (0.5 + factors.iter().sum::<f32>()).clamp(0.0, 1.0);
        let passed = critical.is_empty()
            && score >= self.config.min_score
            && issues.len() <= self.config.max_issues;

        let all_issues: Vec<String> = critical.into_iter().chain(issues).collect();
        let reason = (!passed).then(|| {
            if all_issues.is_empty() {
                format!("quality score {:.2} below threshold", score)
            } else {
                all_issues.join("; ")
            }
        });

        debug!(score, passed, issues = all_issues.len(), "Summary validated");

        ValidationReport {
            verdict: if passed { Verdict::Pass } else { Verdict::Fail },
            score,
            issues: all_issues,
            reason,
        }
    }

    /// The placeholder or the template's instruction line showing up in the output.
    fn has_prompt_artifact(&self, summary: &str) -> bool {
        if summary.contains(CONTENT_PLACEHOLDER) {
            return true;
        }
        self.prompt_template
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .filter(|line| line.chars().count() >= 10)
            .is_some_and(|line| summary.contains(line))
    }
}

/// Whether some character repeats at least `run` times in a row.
fn has_repeated_run(text: &str, run: usize) -> bool {
    let mut last = None;
    let mut count = 0;
    for c in text.chars() {
        if Some(c) == last {
            count += 1;
        } else {
            last = Some(c);
            count = 1;
        }
        if count >= run && !c.is_whitespace() {
            return true;
        }
    }
    false
}
