use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};

pub mod discovery;
pub mod extract;
pub mod parser;
pub mod rebuild;

pub use discovery::{discover, FeedCandidate};
pub use extract::{extract_feed, extract_latest, ExtractOptions};
pub use parser::{FeedDocument, FeedParser, FileAttachment, ItemDocument, XmlFeedParser};
pub use rebuild::build_feed_document;

/// Feed timestamps carry named US-eastern zones instead of numeric offsets;
/// they are mapped to the fixed offsets -0500/-0400 before parsing.
pub fn parse_feed_datetime(raw: &str) -> Option<DateTime<FixedOffset>> {
    let s = raw
        .trim()
        .replace(" EST", " -0500")
        .replace(" EDT", " -0400");
    if let Ok(dt) = DateTime::parse_from_rfc2822(&s) {
        return Some(dt);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Some(dt);
    }
    for fmt in ["%Y-%m-%d %H:%M:%S %z", "%m/%d/%Y %I:%M:%S %p %z"] {
        if let Ok(dt) = DateTime::parse_from_str(&s, fmt) {
            return Some(dt);
        }
    }
    // Directory listings show bare local timestamps; treat them as eastern
    // standard time.
    for fmt in ["%m/%d/%Y %I:%M:%S %p", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s.trim(), fmt) {
            let est = FixedOffset::west_opt(5 * 3600)?;
            return naive.and_local_timezone(est).single();
        }
    }
    None
}

/// Clamps a year/month to the final day of that month.
pub fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()
}
