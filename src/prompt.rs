/// Placeholder the template must contain; replaced with the article text.
pub const CONTENT_PLACEHOLDER: &str = "{content}";

/// The `PromptBuilder` struct is responsible for constructing the summarization prompt.
/// The template is used verbatim apart from the placeholder, so the model's output
/// format stays the one downstream sheets expect.
pub struct PromptBuilder<'a> {
    /// The prompt template with a `{content}` placeholder.
    template: &'a str,
    /// The article text to be included in the prompt.
    content: String,
}

impl<'a> PromptBuilder<'a> {
    /// Creates a new `PromptBuilder` with the given template.
    ///
    /// # Arguments
    ///
    /// * `template` - The prompt template.
    ///
    /// # Returns
    ///
    /// A new instance of `PromptBuilder`.
    pub fn new(template: &'a str) -> Self {
        Self {
            template,
            content: String::new(),
        }
    }

    /// Sets the article text for the prompt.
    pub fn with_content(mut self, content: &str) -> Self {
        self.content = Self::clean_text(content);
        self
    }

    /// Builds the prompt string. A template without the placeholder gets the content appended.
    pub fn build(&self) -> String {
        if self.template.contains(CONTENT_PLACEHOLDER) {
            self.template.replace(CONTENT_PLACEHOLDER, &self.content)
        } else {
            format!("{}\n\n{}", self.template, self.content)
        }
    }

    /// Cleans the given text by removing blank lines and normalizing whitespace.
    ///
    /// # Arguments
    ///
    /// * `text` - The text to be cleaned.
    ///
    /// # Returns
    ///
    /// The cleaned text.
    fn clean_text(text: &str) -> String {
        text.lines()
            .filter(|line| !line.trim().is_empty())       // Remove blank lines
            .map(|line| {
                line.split_whitespace()                   // Split by whitespace
                    .collect::<Vec<&str>>()
                    .join(" ")                            // Join with single space
            })
            .collect::<Vec<String>>()
            .join("\n")                                   // Join lines with newline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PROMPT_TEMPLATE;

    /// Tests the `PromptBuilder` functionality.
    #[test]
    fn test_prompt_builder() {
        let prompt = PromptBuilder::new(DEFAULT_PROMPT_TEMPLATE)
            .with_content("Title: Test\n\n\nAbstract:   Test   content")
            .build();

        assert!(prompt.starts_with("以下の記事の内容を"));
        assert!(prompt.ends_with("記事:\nTitle: Test\nAbstract: Test content"));
        assert!(!prompt.contains(CONTENT_PLACEHOLDER));
    }

    #[test]
    fn test_template_without_placeholder() {
        let prompt = PromptBuilder::new("Summarize:").with_content("body").build();
        assert_eq!(prompt, "Summarize:\n\nbody");
    }
}
