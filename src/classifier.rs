use crate::types::Extraction;
use crate::FetchError;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// One localized marker pattern.
#[derive(Debug, Clone)]
pub struct Marker {
    pub locale: String,
    pub pattern: String,
    regex: Regex,
}

/// A set of localized phrases, matched case-insensitively anywhere in a text.
///
/// Built from configuration so locales and phrases can be added without code changes.
#[derive(Debug, Clone, Default)]
pub struct MarkerSet {
    markers: Vec<Marker>,
}

impl MarkerSet {
    pub fn new(locales: &BTreeMap<String, Vec<String>>) -> Result<Self, regex::Error> {
        let mut markers = Vec::new();
        for (locale, patterns) in locales {
            for pattern in patterns {
                let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
                markers.push(Marker {
                    locale: locale.clone(),
                    pattern: pattern.clone(),
                    regex,
                });
            }
        }
        Ok(Self { markers })
    }

    /// The first marker found in `text`, in locale order.
    pub fn find(&self, text: &str) -> Option<&Marker> {
        self.markers.iter().find(|m| m.regex.is_match(text))
    }

    /// Every marker found in `text`.
    pub fn find_all<'a>(&'a self, text: &'a str) -> impl Iterator<Item = &'a Marker> + 'a {
        self.markers.iter().filter(move |m| m.regex.is_match(text))
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

/// Verdict on one extraction attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    /// Content was fetched but is not a usable article.
    SoftFail(String),
    /// Nothing usable could be fetched.
    HardFail(String),
}

/// Decides whether extracted text is an article, a disguised failure page, or nothing.
pub struct FailureClassifier {
    markers: MarkerSet,
    min_content_length: usize,
}

impl FailureClassifier {
    pub fn new(markers: MarkerSet, min_content_length: usize) -> Self {
        Self {
            markers,
            min_content_length,
        }
    }

    /// Classifies the final extraction result of a row, after any retry.
    ///
    /// Short text alone is not a failure: its body must also lack paragraph structure,
    /// so a legitimately brief article still gets through. Composed `Title:` and
    /// `Description:` lines are not body.
    pub fn classify(&self, result: &Result<Extraction, FetchError>) -> Outcome {
        let extraction = match result {
            Ok(extraction) => extraction,
            Err(e) => return Outcome::HardFail(e.to_string()),
        };

        if let Some(reason) = &extraction.soft_failure {
            return Outcome::SoftFail(reason.clone());
        }

        let text = extraction.text.trim();
        if text.is_empty() {
            return Outcome::HardFail("no content extracted".to_string());
        }

        if let Some(marker) = self.markers.find(text) {
            debug!(locale = %marker.locale, pattern = %marker.pattern, "Marker phrase matched");
            return Outcome::SoftFail(format!(
                "unavailable-page marker [{}] '{}'",
                marker.locale, marker.pattern
            ));
        }

        let length = text.chars().count();
        if length < self.min_content_length && extraction.body_paragraphs < 2 {
            return Outcome::SoftFail(format!(
                "content too short ({} chars, minimum {})",
                length, self.min_content_length
            ));
        }

        Outcome::Success
    }
}
