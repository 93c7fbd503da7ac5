//! Senders whose mail is never unsubscribed from

/// Case-insensitive substring allow-list matched against the From header
#[derive(Debug, Clone, Default)]
pub struct SafeSenders {
    patterns: Vec<String>,
}

impl SafeSenders {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// The first pattern contained in `from`, if any
    pub fn matching(&self, from: &str) -> Option<&str> {
        let from = from.to_lowercase();
        self.patterns
            .iter()
            .find(|pattern| from.contains(pattern.as_str()))
            .map(String::as_str)
    }

    pub fn is_safe(&self, from: &str) -> bool {
        self.matching(from).is_some()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substring_match_ignores_case() {
        let safe = SafeSenders::new(["@MyBank.example", "boss@work.example"]);
        assert!(safe.is_safe("Alerts <alerts@mybank.example>"));
        assert!(safe.is_safe("BOSS@WORK.EXAMPLE"));
        assert_eq!(
            safe.matching("Statements <no-reply@mybank.example>"),
            Some("@mybank.example")
        );
        assert!(!safe.is_safe("news@shop.example"));
    }

    #[test]
    fn test_empty_patterns_are_dropped() {
        let safe = SafeSenders::new(["", "  ", "a@b.c"]);
        assert_eq!(safe.len(), 1);
        assert!(!safe.is_safe("someone@else.example"));
    }

    #[test]
    fn test_empty_list_matches_nothing() {
        let safe = SafeSenders::default();
        assert!(safe.is_empty());
        assert!(!safe.is_safe(""));
        assert!(!safe.is_safe("anyone@example.com"));
    }
}
