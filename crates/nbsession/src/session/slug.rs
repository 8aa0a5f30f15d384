//! Container names derived from user identifiers.

use deunicode::deunicode;
use regex::Regex;
use std::sync::LazyLock;

static SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("Invalid regex pattern for slug separators"));

/// Turn a user identifier into a lowercase, dash-separated container name.
///
/// Non-ASCII text is transliterated first (`zoë` becomes `zoe`). Apostrophes
/// and double quotes are dropped, every other run of characters
/// outside `[a-z0-9]` collapses to a single `-`, and leading or trailing
/// dashes are trimmed. Returns an empty string when nothing survives.
pub fn slugify(user_id: &str) -> String {
    let lowered: String = deunicode(user_id)
        .to_lowercase()
        .chars()
        .filter(|c| *c != '\'' && *c != '"')
        .collect();
    SEPARATORS
        .replace_all(&lowered, "-")
        .trim_matches('-')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_addresses() {
        assert_eq!(slugify("alice@example.com"), "alice-example-com");
        assert_eq!(slugify("Bob.Smith+test@Example.COM"), "bob-smith-test-example-com");
    }

    #[test]
    fn plain_names_are_unchanged() {
        assert_eq!(slugify("alice"), "alice");
        assert_eq!(slugify("admin"), "admin");
        assert_eq!(slugify("user42"), "user42");
    }

    #[test]
    fn quotes_are_dropped_not_separated() {
        assert_eq!(slugify("o'brien"), "obrien");
        assert_eq!(slugify("say \"hi\""), "say-hi");
    }

    #[test]
    fn separators_collapse_and_trim() {
        assert_eq!(slugify("  --Jane   Doe__ "), "jane-doe");
        assert_eq!(slugify("a///b"), "a-b");
    }

    #[test]
    fn non_ascii_is_transliterated() {
        assert_eq!(slugify("zoë"), "zoe");
        assert_eq!(slugify("José.Núñez@example.com"), "jose-nunez-example-com");
        assert_eq!(slugify("名前"), "ming-qian");
    }

    #[test]
    fn deterministic() {
        let input = "Carol.Example@Corp.io";
        assert_eq!(slugify(input), slugify(input));
        assert_eq!(slugify(input), "carol-example-corp-io");
    }
}
