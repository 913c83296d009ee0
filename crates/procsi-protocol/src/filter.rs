//! The request filter model shared by list/count/search methods.
//!
//! A filter is a product of optional predicates; an empty filter matches
//! every row. Parsing and validation live here so every front-end rejects
//! the same inputs the daemon would; SQL translation is the daemon's job.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Status ranges
// ---------------------------------------------------------------------------

/// A parsed status predicate.
///
/// Accepted forms:
/// - `Nxx` with N in 1..=5 (e.g. `2xx`)
/// - an exact three-digit code in 100..=599
/// - an inclusive range `L-H` with 0 <= L <= H <= 599 (0 covers aborted rows)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Class(u16),
    Exact(u16),
    Range(u16, u16),
}

impl StatusFilter {
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(FilterError::StatusRange(input.to_owned()));
        }

        // Nxx class form (case-insensitive on the x)
        let lower = s.to_ascii_lowercase();
        if let Some(class) = lower.strip_suffix("xx") {
            let n: u16 = class
                .parse()
                .map_err(|_| FilterError::StatusRange(input.to_owned()))?;
            if !(1..=5).contains(&n) {
                return Err(FilterError::StatusRange(input.to_owned()));
            }
            return Ok(StatusFilter::Class(n));
        }

        // L-H range form
        if let Some((lo, hi)) = s.split_once('-') {
            let lo: u16 = lo
                .trim()
                .parse()
                .map_err(|_| FilterError::StatusRange(input.to_owned()))?;
            let hi: u16 = hi
                .trim()
                .parse()
                .map_err(|_| FilterError::StatusRange(input.to_owned()))?;
            if lo > hi || hi > 599 {
                return Err(FilterError::StatusRange(input.to_owned()));
            }
            return Ok(StatusFilter::Range(lo, hi));
        }

        // Exact code
        let code: u16 = s
            .parse()
            .map_err(|_| FilterError::StatusRange(input.to_owned()))?;
        if !(100..=599).contains(&code) {
            return Err(FilterError::StatusRange(input.to_owned()));
        }
        Ok(StatusFilter::Exact(code))
    }

    pub fn matches(self, status: i64) -> bool {
        match self {
            StatusFilter::Class(n) => {
                status >= i64::from(n) * 100 && status < (i64::from(n) + 1) * 100
            }
            StatusFilter::Exact(code) => status == i64::from(code),
            StatusFilter::Range(lo, hi) => status >= i64::from(lo) && status <= i64::from(hi),
        }
    }

    /// The inclusive `(low, high)` bounds this predicate covers.
    pub fn bounds(self) -> (i64, i64) {
        match self {
            StatusFilter::Class(n) => (i64::from(n) * 100, i64::from(n) * 100 + 99),
            StatusFilter::Exact(code) => (i64::from(code), i64::from(code)),
            StatusFilter::Range(lo, hi) => (i64::from(lo), i64::from(hi)),
        }
    }
}

// ---------------------------------------------------------------------------
// Header predicate target
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderTarget {
    #[default]
    Request,
    Response,
}

// ---------------------------------------------------------------------------
// The filter object
// ---------------------------------------------------------------------------

/// Product of optional predicates applied to captured requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Uppercased before comparison.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    /// `Nxx`, exact code, or `L-H`; see [`StatusFilter::parse`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_range: Option<String>,
    /// Case-insensitive substring of the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    /// Epoch ms, inclusive lower bound on the intake timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    /// Epoch ms, exclusive upper bound on the intake timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<i64>,
    /// Matched against the full URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    /// Subset of `i`, `m`, `s`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex_flags: Option<String>,
    /// Case-sensitive substring of the full URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
    /// Only meaningful with `header_name`; case-insensitive exact value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_target: Option<HeaderTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl RequestFilter {
    pub fn is_empty(&self) -> bool {
        *self == RequestFilter::default()
    }

    /// Validate every parseable predicate, returning the first offender.
    pub fn validate(&self) -> Result<(), FilterError> {
        if let Some(range) = &self.status_range {
            StatusFilter::parse(range)?;
        }
        if let Some(pattern) = &self.regex {
            check_regex_safety(pattern)?;
        }
        if let Some(flags) = &self.regex_flags {
            if !flags.chars().all(|c| matches!(c, 'i' | 'm' | 's')) {
                return Err(FilterError::RegexFlags(flags.clone()));
            }
        }
        if self.header_value.is_some() && self.header_name.is_none() {
            return Err(FilterError::HeaderValueWithoutName);
        }
        Ok(())
    }

    /// The parsed status predicate, if one is set.
    pub fn status(&self) -> Result<Option<StatusFilter>, FilterError> {
        self.status_range.as_deref().map(StatusFilter::parse).transpose()
    }
}

// ---------------------------------------------------------------------------
// Regex guard
// ---------------------------------------------------------------------------

/// Reject patterns where a quantified group is itself quantified, e.g.
/// `(a+)+` or `(a*){2,}`. The daemon's engine is non-backtracking, so this
/// guard exists for contract parity: every front-end refuses the same
/// patterns regardless of which engine sits behind it.
pub fn check_regex_safety(pattern: &str) -> Result<(), FilterError> {
    let bytes = pattern.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == b')' && i >= 1 && i + 1 < bytes.len() {
            let inner_quantified = matches!(bytes[i - 1], b'+' | b'*' | b'}' | b'?');
            let outer_quantified = matches!(bytes[i + 1], b'+' | b'*' | b'{');
            if inner_quantified && outer_quantified {
                return Err(FilterError::CatastrophicRegex(pattern.to_owned()));
            }
        }
        i += 1;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    StatusRange(String),
    CatastrophicRegex(String),
    InvalidRegex(String),
    RegexFlags(String),
    HeaderValueWithoutName,
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::StatusRange(s) => write!(f, "invalid status range: {s:?}"),
            FilterError::CatastrophicRegex(s) => {
                write!(f, "regex rejected (nested quantifier): {s:?}")
            }
            FilterError::InvalidRegex(s) => write!(f, "invalid regex: {s}"),
            FilterError::RegexFlags(s) => write!(f, "unsupported regex flags: {s:?}"),
            FilterError::HeaderValueWithoutName => {
                write!(f, "headerValue requires headerName")
            }
        }
    }
}

impl std::error::Error for FilterError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_form_accepts_1xx_through_5xx() {
        for n in 1..=5u16 {
            let parsed = StatusFilter::parse(&format!("{n}xx")).unwrap();
            assert_eq!(parsed, StatusFilter::Class(n));
        }
        assert!(StatusFilter::parse("0xx").is_err());
        assert!(StatusFilter::parse("6xx").is_err());
    }

    #[test]
    fn exact_form_bounds() {
        assert_eq!(StatusFilter::parse("100").unwrap(), StatusFilter::Exact(100));
        assert_eq!(StatusFilter::parse("599").unwrap(), StatusFilter::Exact(599));
        assert!(StatusFilter::parse("99").is_err());
        assert!(StatusFilter::parse("600").is_err());
    }

    #[test]
    fn range_form_bounds() {
        assert_eq!(
            StatusFilter::parse("200-299").unwrap(),
            StatusFilter::Range(200, 299)
        );
        // 0 is allowed in ranges: it covers aborted rows.
        assert_eq!(StatusFilter::parse("0-599").unwrap(), StatusFilter::Range(0, 599));
        assert!(StatusFilter::parse("300-200").is_err());
        assert!(StatusFilter::parse("0-600").is_err());
    }

    #[test]
    fn class_matches_boundary_codes() {
        let c = StatusFilter::parse("1xx").unwrap();
        assert!(c.matches(100));
        assert!(c.matches(199));
        assert!(!c.matches(200));
        assert!(!c.matches(99));
    }

    #[test]
    fn catastrophic_patterns_are_rejected() {
        assert!(check_regex_safety("(a+)+$").is_err());
        assert!(check_regex_safety("(a*)*").is_err());
        assert!(check_regex_safety("(ab?)+").is_err());
        assert!(check_regex_safety("(a{2,}){3}").is_err());
    }

    #[test]
    fn ordinary_patterns_pass_the_guard() {
        assert!(check_regex_safety("^https://api\\.example\\.com/v[0-9]+/").is_ok());
        assert!(check_regex_safety("(abc)+").is_ok());
        assert!(check_regex_safety("a+b*c?").is_ok());
        // Escaped close paren is not a group boundary.
        assert!(check_regex_safety("a+\\)+").is_ok());
    }

    #[test]
    fn validate_flags_and_header_pairing() {
        let mut f = RequestFilter {
            regex_flags: Some("ix".to_owned()),
            ..RequestFilter::default()
        };
        assert!(f.validate().is_err());
        f.regex_flags = Some("is".to_owned());
        assert!(f.validate().is_ok());

        let f = RequestFilter {
            header_value: Some("application/json".to_owned()),
            ..RequestFilter::default()
        };
        assert_eq!(f.validate(), Err(FilterError::HeaderValueWithoutName));
    }

    #[test]
    fn filter_deserializes_from_camel_case() {
        let f: RequestFilter = serde_json::from_str(
            r#"{"sessionId":"s1","statusRange":"2xx","pathPrefix":"/api","saved":true}"#,
        )
        .unwrap();
        assert_eq!(f.session_id.as_deref(), Some("s1"));
        assert_eq!(f.status().unwrap(), Some(StatusFilter::Class(2)));
        assert_eq!(f.path_prefix.as_deref(), Some("/api"));
        assert_eq!(f.saved, Some(true));
    }
}
