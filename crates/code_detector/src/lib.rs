//! Verification-code detection
//!
//! Fixed regular-expression rules for spotting one-time codes (login codes,
//! OTPs, confirmation numbers) in normalized message text. Rules are grouped
//! into named pattern sets so the caller selects a set once and passes it
//! down, instead of dispatching on raw pattern strings.

use once_cell::sync::Lazy;
use regex::Regex;

// ---------------------------------------------------------------------------
// Compiled rules
// ---------------------------------------------------------------------------

static NUMERIC_6: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{6}\b").expect("valid regex"));

static NUMERIC_4_TO_8: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{4,8}\b").expect("valid regex"));

static ALPHANUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z0-9]{6,10}\b").expect("valid regex"));

// "code is 123456", "passcode: 1234", "OTP 98765432"
static KEYWORD_BEFORE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:code|passcode|otp|pin)\b[^0-9\n]{0,20}?\b([0-9]{4,8})\b")
        .expect("valid regex")
});

// "123456 is your verification code"
static KEYWORD_AFTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b([0-9]{4,8})\b\s+is\s+your\b[^\n]{0,30}?\b(?:code|passcode|otp|pin)\b")
        .expect("valid regex")
});

/// A single detection rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodePattern {
    /// Standalone six digit number
    Numeric6,
    /// Standalone number of four to eight digits
    Numeric4To8,
    /// Upper-case token of 6-10 characters mixing letters and digits
    Alphanumeric,
    /// A 4-8 digit number next to a code keyword ("code", "OTP", "passcode", "PIN")
    Keyword,
}

impl CodePattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Numeric6 => "numeric6",
            Self::Numeric4To8 => "numeric4to8",
            Self::Alphanumeric => "alphanumeric",
            Self::Keyword => "keyword",
        }
    }

    /// All codes this rule finds in `text`, in order of appearance.
    pub fn find_all(&self, text: &str) -> Vec<String> {
        match self {
            Self::Numeric6 => collect_matches(&NUMERIC_6, text),
            Self::Numeric4To8 => collect_matches(&NUMERIC_4_TO_8, text),
            Self::Alphanumeric => ALPHANUMERIC
                .find_iter(text)
                .map(|m| m.as_str())
                .filter(|token| {
                    token.chars().any(|c| c.is_ascii_digit())
                        && token.chars().any(|c| c.is_ascii_uppercase())
                })
                .map(str::to_string)
                .collect(),
            Self::Keyword => {
                let mut found = collect_captures(&KEYWORD_BEFORE, text);
                for code in collect_captures(&KEYWORD_AFTER, text) {
                    if !found.contains(&code) {
                        found.push(code);
                    }
                }
                found
            }
        }
    }

    pub fn is_match(&self, text: &str) -> bool {
        match self {
            Self::Numeric6 => NUMERIC_6.is_match(text),
            Self::Numeric4To8 => NUMERIC_4_TO_8.is_match(text),
            Self::Alphanumeric => !self.find_all(text).is_empty(),
            Self::Keyword => KEYWORD_BEFORE.is_match(text) || KEYWORD_AFTER.is_match(text),
        }
    }
}

fn collect_matches(re: &Regex, text: &str) -> Vec<String> {
    re.find_iter(text).map(|m| m.as_str().to_string()).collect()
}

fn collect_captures(re: &Regex, text: &str) -> Vec<String> {
    re.captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

// ---------------------------------------------------------------------------
// Pattern sets
// ---------------------------------------------------------------------------

const DEFAULT_RULES: &[CodePattern] = &[CodePattern::Keyword, CodePattern::Numeric6];
const STRICT_RULES: &[CodePattern] = &[CodePattern::Keyword];
const BROAD_RULES: &[CodePattern] = &[
    CodePattern::Keyword,
    CodePattern::Numeric6,
    CodePattern::Numeric4To8,
    CodePattern::Alphanumeric,
];

/// Named group of detection rules, chosen by the caller.
#[derive(Debug, Clone, Default)]
pub enum PatternSet {
    /// Keyword rule plus standalone six digit numbers
    #[default]
    Default,
    /// Keyword rule only
    Strict,
    /// Every built-in rule
    Broad,
    /// A caller-supplied expression. Capture group 1 is the code when present,
    /// otherwise the whole match.
    Custom(Regex),
}

impl PatternSet {
    /// Look up a built-in set by name ("default", "strict", "broad").
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "default" => Some(Self::Default),
            "strict" => Some(Self::Strict),
            "broad" => Some(Self::Broad),
            _ => None,
        }
    }

    pub fn custom(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Self::Custom)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Strict => "strict",
            Self::Broad => "broad",
            Self::Custom(_) => "custom",
        }
    }

    pub fn rules(&self) -> &'static [CodePattern] {
        match self {
            Self::Default => DEFAULT_RULES,
            Self::Strict => STRICT_RULES,
            Self::Broad => BROAD_RULES,
            Self::Custom(_) => &[],
        }
    }

    /// True if any rule of the set matches.
    pub fn detect(&self, text: &str) -> bool {
        match self {
            Self::Custom(re) => re.is_match(text),
            _ => self.rules().iter().any(|rule| rule.is_match(text)),
        }
    }

    /// Distinct codes found by the set, in rule order then appearance order.
    pub fn extract(&self, text: &str) -> Vec<String> {
        let mut codes: Vec<String> = Vec::new();
        let found = match self {
            Self::Custom(re) => re
                .captures_iter(text)
                .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
                .map(|m| m.as_str().to_string())
                .collect(),
            _ => self
                .rules()
                .iter()
                .flat_map(|rule| rule.find_all(text))
                .collect::<Vec<_>>(),
        };
        for code in found {
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
        codes
    }
}
