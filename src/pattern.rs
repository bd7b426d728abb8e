//! Wildcard filters and placeholder expansion for path parameters

use crate::parameters::{ParameterSet, Value};
use regex::{Captures, Regex};
use std::sync::LazyLock;

/// Windows-style file filter: `*` matches any run, `?` one character.
///
/// Several alternatives may be separated by `;` (e.g. `*.csv;*.txt`).
/// Matching ignores ASCII case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WildcardPattern {
    alternatives: Vec<Vec<char>>,
}

impl WildcardPattern {
    pub fn new(pattern: &str) -> Self {
        let mut alternatives: Vec<Vec<char>> = pattern
            .split(';')
            .map(str::trim)
            .filter(|alt| !alt.is_empty())
            .map(|alt| alt.chars().map(|c| c.to_ascii_lowercase()).collect())
            .collect();
        if alternatives.is_empty() {
            alternatives.push(vec!['*']);
        }
        Self { alternatives }
    }

    /// Pattern matching every name
    pub fn any() -> Self {
        Self::new("*")
    }

    pub fn matches(&self, name: &str) -> bool {
        let name: Vec<char> = name.chars().map(|c| c.to_ascii_lowercase()).collect();
        self.alternatives
            .iter()
            .any(|pattern| wildcard_match(pattern, &name))
    }
}

impl Default for WildcardPattern {
    fn default() -> Self {
        Self::any()
    }
}

/// Iterative glob match with single-star backtracking
fn wildcard_match(pattern: &[char], name: &[char]) -> bool {
    let (mut p, mut n) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, n));
            p += 1;
        } else if let Some((star_p, star_n)) = star {
            p = star_p + 1;
            n = star_n + 1;
            star = Some((star_p, star_n + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

static ENV_VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"%([A-Za-z_][A-Za-z0-9_]*)%|\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex")
});

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}]+)\}").expect("valid token regex"));

/// Expand environment placeholders: `%NAME%` and `${NAME}`.
///
/// Unknown variables are left as written.
pub fn expand_env(text: &str) -> String {
    expand_with(text, |name| std::env::var(name).ok())
}

/// Expand `{Name}` tokens from the parameter set.
///
/// Unknown names are left as written; non-string values use their JSON text.
pub fn expand_tokens(text: &str, set: &ParameterSet) -> String {
    TOKEN_RE
        .replace_all(text, |caps: &Captures| match set.get(&caps[1]) {
            Some(Value::String(value)) => value.clone(),
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

fn expand_with<F>(text: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    ENV_VAR_RE
        .replace_all(text, |caps: &Captures| {
            let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            lookup(name).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_matches() {
        let csv = WildcardPattern::new("*.csv");
        assert!(csv.matches("orders.csv"));
        assert!(csv.matches("ORDERS.CSV"));
        assert!(!csv.matches("orders.csv.bak"));
        assert!(!csv.matches("orders.txt"));

        let single = WildcardPattern::new("day_??.log");
        assert!(single.matches("day_01.log"));
        assert!(!single.matches("day_1.log"));

        assert!(WildcardPattern::any().matches("anything"));
        assert!(WildcardPattern::new("").matches("x"));
    }

    #[test]
    fn test_wildcard_alternatives() {
        let pattern = WildcardPattern::new("*.csv; *.txt");
        assert!(pattern.matches("a.txt"));
        assert!(pattern.matches("b.csv"));
        assert!(!pattern.matches("c.xml"));
    }

    #[test]
    fn test_wildcard_backtracking() {
        let pattern = WildcardPattern::new("a*b*c");
        assert!(pattern.matches("axxbyyc"));
        assert!(pattern.matches("abbbc"));
        assert!(!pattern.matches("axxbyy"));
    }

    #[test]
    fn test_expand_placeholders() {
        let lookup = |name: &str| match name {
            "ROOT" => Some("/data".to_string()),
            _ => None,
        };
        assert_eq!(expand_with("%ROOT%/in", lookup), "/data/in");
        assert_eq!(expand_with("${ROOT}/in", lookup), "/data/in");
        assert_eq!(expand_with("%MISSING%/in", lookup), "%MISSING%/in");
        assert_eq!(expand_with("100%", lookup), "100%");
        assert_eq!(expand_with("%ROOT%%ROOT%", lookup), "/data/data");
        assert_eq!(expand_with("${ROOT}-${MISSING}", lookup), "/data-${MISSING}");
    }

    #[test]
    fn test_expand_tokens() {
        let set = ParameterSet::new().with("Name", "a.csv").with("Count", 2);
        assert_eq!(expand_tokens("/out/{Name}", &set), "/out/a.csv");
        assert_eq!(expand_tokens("{Count} rows", &set), "2 rows");
        assert_eq!(expand_tokens("{Other}/{", &set), "{Other}/{");
        assert_eq!(expand_tokens("{Name}.{Name}", &set), "a.csv.a.csv");
    }
}
