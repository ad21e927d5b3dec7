//! Job identifiers: `job-{keyword}-{YYYYMMDD-HHMMSS}[-{suffix}]`.
//!
//! The keyword is a short word picked from the request so identifiers stay
//! readable in logs and artifact paths. The optional four-hex-digit suffix
//! disambiguates jobs created for the same keyword within the same second.

use pipeline::{JobId, Timestamp};

const MAX_KEYWORD_LEN: usize = 20;
const MIN_KEYWORD_LEN: usize = 3;
const FALLBACK_KEYWORD: &str = "agent";
pub const SUFFIX_LEN: usize = 4;

const SKIP_WORDS: &[&str] = &[
    "i", "want", "need", "would", "like", "create", "build", "make", "generate", "develop",
    "design", "implement", "a", "an", "the", "to", "for", "with", "that", "can", "could",
    "should", "will", "agent", "system", "application", "app", "service", "tool",
];

/// Picks the first meaningful word of `request`.
///
/// Words are maximal runs of ASCII letters, lowercased. The first one that is
/// at least three letters long and not a filler word wins; otherwise the first
/// word at all; otherwise `"agent"`.
pub fn extract_keyword(request: &str) -> String {
    let lowered = request.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|w| !w.is_empty())
        .collect();

    let chosen = words
        .iter()
        .find(|w| w.len() >= MIN_KEYWORD_LEN && !SKIP_WORDS.contains(w))
        .or_else(|| words.first())
        .copied()
        .unwrap_or(FALLBACK_KEYWORD);
    chosen.chars().take(MAX_KEYWORD_LEN).collect()
}

/// Reduces `keyword` to lowercase `[a-z0-9-]`, single hyphens, at most 20 chars.
pub fn normalize_keyword(keyword: &str) -> String {
    let mut out = String::with_capacity(keyword.len());
    for c in keyword.to_lowercase().chars() {
        if c.is_whitespace() || c == '_' || c == '-' {
            if !out.is_empty() && !out.ends_with('-') {
                out.push('-');
            }
        } else if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        }
    }
    let mut out: String = out.trim_matches('-').chars().take(MAX_KEYWORD_LEN).collect();
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        FALLBACK_KEYWORD.to_string()
    } else {
        out
    }
}

/// Builds a job id for `request` created at `at`.
///
/// An explicit `keyword` takes precedence over one extracted from the request.
pub fn generate(request: &str, keyword: Option<&str>, at: Timestamp) -> JobId {
    let keyword = match keyword {
        Some(explicit) if !explicit.trim().is_empty() => normalize_keyword(explicit),
        _ => normalize_keyword(&extract_keyword(request)),
    };
    let stamp = at.as_datetime().format("%Y%m%d-%H%M%S").to_string();
    JobId::compose(&keyword, &stamp)
}

/// Components of a well-formed job id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedJobId {
    pub keyword: String,
    /// `YYYYMMDD`.
    pub date: String,
    /// `HHMMSS`.
    pub time: String,
    pub suffix: Option<String>,
}

impl ParsedJobId {
    /// `YYYYMMDD-HHMMSS`.
    pub fn timestamp(&self) -> String {
        format!("{}-{}", self.date, self.time)
    }
}

fn all_digits(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_suffix(s: &str) -> bool {
    s.len() == SUFFIX_LEN && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn is_keyword(s: &str) -> bool {
    !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Splits a job id into its components; `None` if it is not well formed.
pub fn parse_job_id(id: &str) -> Option<ParsedJobId> {
    let rest = id.strip_prefix("job-")?;
    let (rest, suffix) = match rest.rsplit_once('-') {
        Some((head, tail))
            if is_suffix(tail)
                && head
                    .rsplit_once('-')
                    .is_some_and(|(_, time)| all_digits(time, 6)) =>
        {
            (head, Some(tail))
        }
        _ => (rest, None),
    };
    let (rest, time) = rest.rsplit_once('-')?;
    let (keyword, date) = rest.rsplit_once('-')?;

    (all_digits(time, 6) && all_digits(date, 8) && is_keyword(keyword)).then(|| ParsedJobId {
        keyword: keyword.to_string(),
        date: date.to_string(),
        time: time.to_string(),
        suffix: suffix.map(str::to_string),
    })
}

pub fn is_valid_job_id(id: &str) -> bool {
    parse_job_id(id).is_some()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> Timestamp {
        Timestamp::from_utc(Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap())
    }

    #[test]
    fn keyword_skips_filler_and_short_words() {
        assert_eq!(extract_keyword("I would like to build a friend agent"), "friend");
        assert_eq!(extract_keyword("Create an app for my cat"), "cat");
        assert_eq!(extract_keyword("an AI"), "an");
        assert_eq!(extract_keyword("1234 !!"), "agent");
        assert_eq!(
            extract_keyword("supercalifragilisticexpialidocious"),
            "supercalifragilistic"
        );
    }

    #[test]
    fn normalisation_produces_safe_keywords() {
        assert_eq!(normalize_keyword("Customer Support_Bot"), "customer-support-bot");
        assert_eq!(normalize_keyword("--weird!!name--"), "weirdname");
        assert_eq!(normalize_keyword("a   b"), "a-b");
        assert_eq!(normalize_keyword("***"), "agent");
        assert_eq!(normalize_keyword("abcdefghijklmnopqrs-tuvwxyz"), "abcdefghijklmnopqrs");
    }

    #[test]
    fn generated_ids_follow_the_format() {
        let id = generate(
            "I would like a friend agent",
            None,
            at(2025, 10, 13, 14, 30, 22),
        );
        assert_eq!(id.as_str(), "job-friend-20251013-143022");
        assert!(is_valid_job_id(id.as_str()));

        let explicit = generate("ignored", Some("Travel Planner"), at(2025, 1, 2, 3, 4, 5));
        assert_eq!(explicit.as_str(), "job-travel-planner-20250102-030405");
    }

    #[test]
    fn parsing_handles_hyphenated_keywords_and_suffixes() {
        let plain = parse_job_id("job-travel-planner-20250102-030405").unwrap();
        assert_eq!(plain.keyword, "travel-planner");
        assert_eq!(plain.timestamp(), "20250102-030405");
        assert_eq!(plain.suffix, None);

        let suffixed = parse_job_id("job-friend-20251013-143022-a1b2").unwrap();
        assert_eq!(suffixed.keyword, "friend");
        assert_eq!(suffixed.date, "20251013");
        assert_eq!(suffixed.time, "143022");
        assert_eq!(suffixed.suffix.as_deref(), Some("a1b2"));

        let base = JobId::new("job-friend-20251013-143022").unwrap();
        assert!(is_valid_job_id(base.with_suffix("00ff").as_str()));
    }

    #[test]
    fn malformed_ids_are_rejected() {
        for bad in [
            "",
            "job-",
            "friend-20251013-143022",
            "job-Friend-20251013-143022",
            "job-friend-2025101-143022",
            "job-friend-20251013-14302",
            "job--20251013-143022",
            "job-friend-20251013-143022-xyz1",
            "job-friend-20251013-143022-a1b2c",
        ] {
            assert!(!is_valid_job_id(bad), "{bad:?} should be invalid");
        }
    }
}
