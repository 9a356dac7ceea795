//! Core domain model, fetch handoff drafts and normalization rules for PCW.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "pcw-core";

/// Live-status sentinel reported by the video platform for ordinary uploads.
pub const LIVE_STATUS_NONE: &str = "none";

/// Items at or under this many seconds (and above zero) are short-form.
pub const SHORT_FORM_MAX_SECS: u64 = 60;

/// External content platform an entity was fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    YouTube,
    Twitter,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::YouTube, Platform::Twitter];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::YouTube => "youtube",
            Self::Twitter => "twitter",
        }
    }

    /// Canonical form of an account identifier on this platform.
    ///
    /// Twitter accounts are keyed by username, which is case-insensitive and
    /// often written with a leading `@`.
    pub fn normalize_account_id(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        match self {
            Self::YouTube => trimmed.to_string(),
            Self::Twitter => trimmed.trim_start_matches('@').to_ascii_lowercase(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPlatform(pub String);

impl fmt::Display for UnknownPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown platform `{}`", self.0)
    }
}

impl std::error::Error for UnknownPlatform {}

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "youtube" | "video" => Ok(Self::YouTube),
            "twitter" | "x" | "microblog" => Ok(Self::Twitter),
            other => Err(UnknownPlatform(other.to_string())),
        }
    }
}

impl TryFrom<String> for Platform {
    type Error = UnknownPlatform;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Status tag written on a detection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStatus {
    Pending,
    Delivered,
    Failed,
}

impl DetectionStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for DetectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown detection status `{other}`")),
        }
    }
}

impl TryFrom<String> for DetectionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Freshly fetched account profile, handed from adapters to the reconciler.
///
/// `None` means the platform did not report the field; reconciliation keeps
/// whatever value is already stored for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountDraft {
    pub platform: Platform,
    pub external_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub follower_count: Option<i64>,
    #[serde(default)]
    pub content_count: Option<i64>,
    #[serde(default)]
    pub view_count: Option<i64>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub links: Option<String>,
}

impl AccountDraft {
    pub fn new(platform: Platform, external_id: impl Into<String>) -> Self {
        Self {
            platform,
            external_id: external_id.into(),
            display_name: None,
            handle: None,
            description: None,
            avatar_url: None,
            follower_count: None,
            content_count: None,
            view_count: None,
            published_at: None,
            location: None,
            links: None,
        }
    }
}

/// Freshly fetched video or post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentDraft {
    pub platform: Platform,
    pub external_id: String,
    #[serde(default)]
    pub account_external_id: Option<String>,
    #[serde(default)]
    pub account_display_name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub view_count: Option<i64>,
    #[serde(default)]
    pub like_count: Option<i64>,
    #[serde(default)]
    pub comment_count: Option<i64>,
    #[serde(default)]
    pub repost_count: Option<i64>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub live_status: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
}

impl ContentDraft {
    pub fn new(platform: Platform, external_id: impl Into<String>) -> Self {
        Self {
            platform,
            external_id: external_id.into(),
            account_external_id: None,
            account_display_name: None,
            title: None,
            description: None,
            view_count: None,
            like_count: None,
            comment_count: None,
            repost_count: None,
            published_at: None,
            live_status: None,
            duration: None,
        }
    }

    /// Whether this item counts as new content for a watched account:
    /// neither a live broadcast nor short-form.
    pub fn qualifies(&self) -> bool {
        !is_live(self.live_status.as_deref())
            && !self.duration.as_deref().is_some_and(is_short_form)
    }

    /// Best title to show for a detection, falling back to the text body.
    pub fn display_title(&self) -> Option<String> {
        self.title.clone().or_else(|| self.description.clone())
    }
}

/// Freshly fetched comment or reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentDraft {
    pub platform: Platform,
    pub external_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_external_id: Option<String>,
    #[serde(default)]
    pub like_count: Option<i64>,
    #[serde(default)]
    pub reply_count: Option<i64>,
    #[serde(default)]
    pub published_at: Option<String>,
}

impl CommentDraft {
    pub fn new(platform: Platform, external_id: impl Into<String>) -> Self {
        Self {
            platform,
            external_id: external_id.into(),
            text: None,
            author_name: None,
            author_external_id: None,
            like_count: None,
            reply_count: None,
            published_at: None,
        }
    }
}

/// A top-level comment together with whatever replies the platform inlined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentThread {
    pub comment: CommentDraft,
    #[serde(default)]
    pub replies: Vec<CommentDraft>,
}

/// Anything other than the `none` sentinel marks a live or upcoming broadcast.
/// A missing flag (platforms without broadcasts) is not live.
pub fn is_live(live_status: Option<&str>) -> bool {
    live_status.is_some_and(|status| !status.trim().eq_ignore_ascii_case(LIVE_STATUS_NONE))
}

/// Components of an ISO-8601 duration such as `PT1H2M10S` or `P1DT5M`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoDuration {
    pub days: u64,
    pub hours: Option<u64>,
    pub minutes: u64,
    pub seconds: u64,
}

impl IsoDuration {
    pub fn parse(input: &str) -> Option<Self> {
        let upper = input.trim().to_ascii_uppercase();
        let body = upper.strip_prefix('P')?;
        let (date_part, time_part) = match body.split_once('T') {
            Some((date, time)) => (date, time),
            None => (body, ""),
        };

        let mut out = Self::default();
        for (value, unit) in duration_components(date_part)? {
            match unit {
                'D' => out.days = value,
                'W' => out.days = value.checked_mul(7)?,
                _ => return None,
            }
        }
        for (value, unit) in duration_components(time_part)? {
            match unit {
                'H' => out.hours = Some(value),
                'M' => out.minutes = value,
                'S' => out.seconds = value,
                _ => return None,
            }
        }
        Some(out)
    }

    /// Minutes and seconds only; callers check the hour component separately.
    /// `None` when the total does not fit in a `u64`.
    pub fn minute_second_total(&self) -> Option<u64> {
        self.minutes.checked_mul(60)?.checked_add(self.seconds)
    }
}

fn duration_components(part: &str) -> Option<Vec<(u64, char)>> {
    let mut out = Vec::new();
    let mut digits = String::new();
    for c in part.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else if c == '.' || c == ',' {
            // fractional seconds are truncated
            digits.push('.');
        } else {
            let whole = digits.split('.').next().unwrap_or_default();
            let value = whole.parse::<u64>().ok()?;
            out.push((value, c));
            digits.clear();
        }
    }
    if !digits.is_empty() {
        return None;
    }
    Some(out)
}

/// Short-form rule: an hour component is never short-form; otherwise the
/// minute and second components must sum to a value in `(0, 60]`.
pub fn is_short_form(duration: &str) -> bool {
    let Some(parsed) = IsoDuration::parse(duration) else {
        return false;
    };
    if parsed.hours.is_some() || parsed.days > 0 {
        return false;
    }
    parsed
        .minute_second_total()
        .is_some_and(|total| total > 0 && total <= SHORT_FORM_MAX_SECS)
}

const HUMANIZED_SEPARATORS: [&str; 4] = ["\u{b7}", "\u{2022}", "|", " - "];

/// Parse a platform timestamp.
///
/// ISO-8601 with a trailing UTC marker is tried first, then a humanized
/// `Mon DD, YYYY` prefix (anything after a `·`, `•`, `|` or ` - ` separator is
/// ignored). Sub-second precision is dropped. Empty input yields `None`;
/// unparseable input yields `now`.
pub fn parse_platform_timestamp(input: &str) -> Option<DateTime<Utc>> {
    parse_platform_timestamp_at(input, Utc::now())
}

pub fn parse_platform_timestamp_at(input: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc).trunc_subsecs(0));
    }

    Some(parse_humanized_date(trimmed).unwrap_or(now))
}

fn parse_humanized_date(input: &str) -> Option<DateTime<Utc>> {
    let cut = HUMANIZED_SEPARATORS
        .iter()
        .filter_map(|sep| input.find(sep))
        .min()
        .unwrap_or(input.len());
    let date_part = input[..cut].trim().trim_end_matches(',').trim();

    ["%b %d, %Y", "%B %d, %Y", "%b %d %Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn iso_timestamps_with_and_without_fraction_are_the_same_instant() {
        let plain = parse_platform_timestamp("2021-01-10T12:02:20Z").unwrap();
        let fractional = parse_platform_timestamp("2021-01-10T12:02:20.098389Z").unwrap();
        assert_eq!(plain, Utc.with_ymd_and_hms(2021, 1, 10, 12, 2, 20).unwrap());
        assert_eq!(fractional, plain);
    }

    #[test]
    fn humanized_dates_use_the_fallback_path() {
        let parsed = parse_platform_timestamp_at("Jan 10, 2021 \u{b7} 3:00 PM", fixed_now()).unwrap();
        assert_eq!(parsed.date_naive(), NaiveDate::from_ymd_opt(2021, 1, 10).unwrap());

        let bare = parse_platform_timestamp_at("Mar 3, 2020", fixed_now()).unwrap();
        assert_eq!(bare.date_naive(), NaiveDate::from_ymd_opt(2020, 3, 3).unwrap());
    }

    #[test]
    fn empty_input_is_absent_and_garbage_is_now() {
        assert_eq!(parse_platform_timestamp_at("", fixed_now()), None);
        assert_eq!(parse_platform_timestamp_at("   ", fixed_now()), None);
        assert_eq!(
            parse_platform_timestamp_at("not a date at all", fixed_now()),
            Some(fixed_now())
        );
    }

    #[test]
    fn short_form_and_live_filtering() {
        let mut short = ContentDraft::new(Platform::YouTube, "v1");
        short.duration = Some("PT45S".into());
        short.live_status = Some("none".into());
        assert!(!short.qualifies());

        let mut long = ContentDraft::new(Platform::YouTube, "v2");
        long.duration = Some("PT1H2M".into());
        long.live_status = Some("none".into());
        assert!(long.qualifies());
        assert!(!is_short_form("PT1H"));

        let mut live = ContentDraft::new(Platform::YouTube, "v3");
        live.duration = Some("PT10M".into());
        live.live_status = Some("live".into());
        assert!(!live.qualifies());

        let mut upcoming = long.clone();
        upcoming.live_status = Some("upcoming".into());
        assert!(!upcoming.qualifies());
    }

    #[test]
    fn short_form_boundaries() {
        assert!(is_short_form("PT1M"));
        assert!(is_short_form("PT60S"));
        assert!(!is_short_form("PT1M1S"));
        assert!(!is_short_form("P0D"));
        assert!(!is_short_form("PT0S"));
        assert!(!is_short_form("P1DT30S"));
        assert!(!is_short_form("garbage"));
    }

    #[test]
    fn oversized_durations_are_not_short_form() {
        assert!(!is_short_form("PT999999999999999999M"));
        assert!(!is_short_form("P9999999999999999999W"));
        assert!(!is_short_form("PT18446744073709551615M30S"));
        assert_eq!(IsoDuration::parse("P9999999999999999999W"), None);

        let mut odd = ContentDraft::new(Platform::YouTube, "v4");
        odd.duration = Some("PT999999999999999999M".into());
        odd.live_status = Some("none".into());
        assert!(odd.qualifies());
    }

    #[test]
    fn posts_without_duration_or_live_flag_qualify() {
        let post = ContentDraft::new(Platform::Twitter, "1790000000000000000");
        assert!(post.qualifies());
    }

    #[test]
    fn twitter_usernames_are_case_and_at_insensitive() {
        assert_eq!(Platform::Twitter.normalize_account_id("@NASA "), "nasa");
        assert_eq!(
            Platform::YouTube.normalize_account_id(" UCabc "),
            "UCabc"
        );
        assert_eq!("x".parse::<Platform>().unwrap(), Platform::Twitter);
        assert!("myspace".parse::<Platform>().is_err());
    }

    #[test]
    fn drafts_deserialize_with_missing_optionals() {
        let draft: ContentDraft = serde_json::from_str(
            r#"{"platform":"youtube","external_id":"abc","title":"Hello"}"#,
        )
        .unwrap();
        assert_eq!(draft.title.as_deref(), Some("Hello"));
        assert_eq!(draft.view_count, None);
    }
}
