//! Free-text curriculum titles to a `domain > category > specific_type` taxonomy.

use serde::Serialize;

pub const FALLBACK_DOMAIN: &str = "unknown";
pub const FALLBACK_CATEGORY: &str = "general";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedTitle {
    pub domain: String,
    pub category: String,
    pub specific_type: String,
    pub canonical_path: String,
    pub subtype: Option<String>,
}

const CONTENT_FAMILIES: &[(&str, &[&str])] = &[
    ("diagnostic", &["diagnostic", "placement"]),
    ("full_length", &["full-length", "full length", "full-test", "full test"]),
    ("assessment", &["assessment", "exam"]),
    ("guidance", &["guidance", "lesson", "lecture", "strategy"]),
    ("practice", &["practice", "drill", "problem-set", "problem set"]),
    ("review", &["review", "recap"]),
];

const DIFFICULTY_FAMILIES: &[(&str, &[&str])] = &[
    ("easy", &["easy", "beginner", "basic", "introductory"]),
    ("medium", &["medium", "intermediate", "moderate"]),
    ("hard", &["hard", "advanced", "difficult", "challenging"]),
];

/// Classify a curriculum title. Returns `None` when no segment survives normalization.
pub fn parse_title(title: &str) -> Option<ParsedTitle> {
    let segments: Vec<String> = title
        .split('>')
        .map(normalize_segment)
        .filter(|segment| !segment.is_empty())
        .collect();

    let specific_type = segments.last()?.clone();
    let (domain, category) = match segments.len() {
        1 => (FALLBACK_DOMAIN.to_string(), FALLBACK_CATEGORY.to_string()),
        2 => (segments[0].clone(), FALLBACK_CATEGORY.to_string()),
        _ => (segments[0].clone(), segments[1].clone()),
    };
    let canonical_path = format!("{domain} > {category} > {specific_type}");

    Some(ParsedTitle {
        domain,
        category,
        specific_type,
        canonical_path,
        subtype: infer_subtype(title),
    })
}

fn normalize_segment(raw: &str) -> String {
    let mut segment = raw.trim();
    if segment.len() >= 2 && segment.starts_with('[') && segment.ends_with(']') {
        segment = &segment[1..segment.len() - 1];
    }

    let dashed: String = segment
        .chars()
        .map(|c| match c {
            '\u{2013}' | '\u{2014}' => '-',
            other => other,
        })
        .collect();
    let without_asides = strip_parentheticals(&dashed);
    let head = match without_asides.find(" - ") {
        Some(index) => &without_asides[..index],
        None => without_asides.as_str(),
    };

    collapse_whitespace(head).to_lowercase()
}

fn strip_parentheticals(value: &str) -> String {
    let mut depth = 0usize;
    let mut output = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => output.push(c),
            _ => {}
        }
    }
    output
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Keywords are matched on whole words of the full title, so "hard" never hits "hardware".
fn infer_subtype(title: &str) -> Option<String> {
    let haystack = format!(" {} ", word_normalize(title));

    match (
        match_family(&haystack, CONTENT_FAMILIES),
        match_family(&haystack, DIFFICULTY_FAMILIES),
    ) {
        (Some(content), Some(difficulty)) => Some(format!("{content}_{difficulty}")),
        (Some(content), None) => Some(content.to_string()),
        (None, Some(difficulty)) => Some(difficulty.to_string()),
        (None, None) => None,
    }
}

fn match_family(haystack: &str, families: &[(&'static str, &[&str])]) -> Option<&'static str> {
    families.iter().find_map(|(label, keywords)| {
        keywords
            .iter()
            .any(|keyword| haystack.contains(&format!(" {} ", word_normalize(keyword))))
            .then_some(*label)
    })
}

fn word_normalize(value: &str) -> String {
    let spaced: String = value
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    collapse_whitespace(&spaced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bracketed_two_segment_title() {
        let parsed = parse_title("[Information & Ideas] > Inferences - Practice (Medium)").unwrap();
        assert_eq!(parsed.domain, "information & ideas");
        assert_eq!(parsed.category, "general");
        assert_eq!(parsed.specific_type, "inferences");
        assert_eq!(parsed.canonical_path, "information & ideas > general > inferences");
        assert_eq!(parsed.subtype.as_deref(), Some("practice_medium"));
    }

    #[test]
    fn parsing_is_deterministic() {
        let title = "[Information & Ideas] > Inferences - Practice (Medium)";
        assert_eq!(parse_title(title), parse_title(title));
    }

    #[test]
    fn three_segments_fill_every_level() {
        let parsed = parse_title("Math > Algebra > Linear Equations \u{2014} Drill (Hard)").unwrap();
        assert_eq!(parsed.canonical_path, "math > algebra > linear equations");
        assert_eq!(parsed.subtype.as_deref(), Some("practice_hard"));
    }

    #[test]
    fn deeper_paths_keep_first_two_and_last_segments() {
        let parsed = parse_title("Reading > Craft > Structure > Text Structure").unwrap();
        assert_eq!(parsed.domain, "reading");
        assert_eq!(parsed.category, "craft");
        assert_eq!(parsed.specific_type, "text structure");
    }

    #[test]
    fn single_segment_falls_back_to_unknown_domain() {
        let parsed = parse_title("Boundaries").unwrap();
        assert_eq!(parsed.canonical_path, "unknown > general > boundaries");
        assert_eq!(parsed.subtype, None);
    }

    #[test]
    fn unparseable_titles_return_none() {
        assert!(parse_title("").is_none());
        assert!(parse_title("  >  > []").is_none());
        assert!(parse_title("(Medium)").is_none());
    }

    #[test]
    fn en_dash_separator_is_treated_as_hyphen() {
        let parsed = parse_title("Craft & Structure > Words in Context \u{2013} Review").unwrap();
        assert_eq!(parsed.specific_type, "words in context");
        assert_eq!(parsed.subtype.as_deref(), Some("review"));
    }

    #[test]
    fn subtype_uses_first_matching_content_family() {
        let parsed = parse_title("Full-Length Practice Test 3").unwrap();
        assert_eq!(parsed.subtype.as_deref(), Some("full_length"));

        let parsed = parse_title("Placement Diagnostic").unwrap();
        assert_eq!(parsed.subtype.as_deref(), Some("diagnostic"));
    }

    #[test]
    fn difficulty_alone_is_reported() {
        let parsed = parse_title("Geometry > Circles (Advanced)").unwrap();
        assert_eq!(parsed.subtype.as_deref(), Some("hard"));
    }

    #[test]
    fn keywords_match_whole_words_only() {
        let parsed = parse_title("Hardware > Reviewer Notes").unwrap();
        assert_eq!(parsed.subtype, None);
    }
}
