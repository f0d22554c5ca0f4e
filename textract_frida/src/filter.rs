//! The noise filter deciding which decoded strings are worth keeping.

use regex::Regex;
use textract_bolts::Error;

use crate::decoder::{is_sentinel, DecodedString};

/// Decides whether a decoded string is noise.
///
/// Filtering is pure: the same text always gets the same verdict and nothing is recorded.
#[derive(Clone, Debug, Default)]
pub struct TextFilter {
    deny: Vec<Regex>,
}

impl TextFilter {
    /// A filter with only the built-in rules
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A filter that additionally rejects every text matching one of `patterns`
    pub fn with_patterns<I, S>(patterns: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let deny = patterns
            .into_iter()
            .map(|pattern| Regex::new(pattern.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { deny })
    }

    /// `true` if `text` must not be persisted.
    ///
    /// Rejected are empty or whitespace-only text, decoder sentinels, text without a single
    /// alphanumeric character and anything matching a configured deny pattern.
    #[must_use]
    pub fn should_filter(&self, text: &str) -> bool {
        if text.trim().is_empty() || is_sentinel(text) {
            return true;
        }
        if !text.chars().any(char::is_alphanumeric) {
            return true;
        }
        self.deny.iter().any(|re| re.is_match(text))
    }

    /// Attach the filter verdict to `text`
    #[must_use]
    pub fn judge(&self, text: String) -> DecodedString {
        let accepted = !self.should_filter(&text);
        DecodedString { text, accepted }
    }
}

#[cfg(test)]
mod tests {
    use super::TextFilter;
    use crate::decoder::{length_placeholder, NULL_SENTINEL};

    #[test]
    fn test_builtin_rules() {
        let filter = TextFilter::new();
        assert!(filter.should_filter(""));
        assert!(filter.should_filter(" \t\n"));
        assert!(filter.should_filter(NULL_SENTINEL));
        assert!(filter.should_filter(&length_placeholder(-3)));
        assert!(filter.should_filter("???"));
        assert!(filter.should_filter("-- : --"));

        assert!(!filter.should_filter("Hook Test"));
        assert!(!filter.should_filter("42"));
        assert!(!filter.should_filter("Lv.?"));
    }

    #[test]
    fn test_deny_patterns() {
        let filter = TextFilter::with_patterns(["^\\d+$", "(?i)loading"]).unwrap();
        assert!(filter.should_filter("12345"));
        assert!(filter.should_filter("Now LOADING..."));
        assert!(!filter.should_filter("Start Game"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(TextFilter::with_patterns(["("]).is_err());
    }

    #[test]
    fn test_is_pure() {
        let filter = TextFilter::new();
        for _ in 0..3 {
            assert!(filter.should_filter(NULL_SENTINEL));
            assert!(!filter.should_filter("Hook Test"));
        }
        let judged = filter.judge("Hook Test".to_string());
        assert!(judged.accepted);
        assert_eq!(judged.text, "Hook Test");
        assert!(!filter.judge(String::new()).accepted);
    }
}
