/// Input validation shared by the tool handlers.
///
/// Each rejection condition has its own message so callers can tell a
/// malformed list from a malformed element, or a negative score from an
/// out-of-range one.
use chrono::{DateTime, Days, Months, Utc};

use crate::db::search::MAX_SEARCH_LIMIT;
use crate::error::RagError;

/// Update modes for `update_memory`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateMode {
    #[default]
    Replace,
    Append,
    Prepend,
}

impl UpdateMode {
    pub fn parse(s: &str) -> Result<Self, RagError> {
        match s {
            "replace" => Ok(Self::Replace),
            "append" => Ok(Self::Append),
            "prepend" => Ok(Self::Prepend),
            other => Err(RagError::validation(format!(
                "invalid mode {other:?}: expected replace|append|prepend"
            ))),
        }
    }
}

/// Validate a raw `tags` argument into a trimmed, deduplicated list.
///
/// Distinct failures: not a list, an element that is not a string, and an
/// element that is empty after trimming.
pub fn parse_tags(value: &serde_json::Value) -> Result<Vec<String>, RagError> {
    let items = value
        .as_array()
        .ok_or_else(|| RagError::validation("tags must be an array of strings"))?;

    let mut tags: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let s = item
            .as_str()
            .ok_or_else(|| RagError::validation("each tag must be a string"))?;
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(RagError::validation("tags must not be empty strings"));
        }
        if !tags.iter().any(|t| t == trimmed) {
            tags.push(trimmed.to_string());
        }
    }
    Ok(tags)
}

/// Optional-tags convenience: absent means the empty list.
pub fn parse_optional_tags(value: Option<&serde_json::Value>) -> Result<Vec<String>, RagError> {
    match value {
        Some(v) => parse_tags(v),
        None => Ok(Vec::new()),
    }
}

/// Parse a TTL string against `now` using calendar arithmetic.
///
/// `permanent` means no expiry. Otherwise the value must match
/// `^\d+[dhmy]$`; month and year units roll over calendar boundaries
/// (a "1m" started on Jan 31 expires on Feb 28/29), they are not
/// fixed-length windows. Fractional or signed values are rejected by the
/// digits-only rule.
pub fn parse_ttl(ttl: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, RagError> {
    if ttl == "permanent" {
        return Ok(None);
    }

    let bad = || {
        RagError::validation(format!(
            "invalid ttl {ttl:?}: expected \"permanent\" or a whole number with unit d|h|m|y"
        ))
    };

    let unit = ttl.chars().last().ok_or_else(bad)?;
    let digits = &ttl[..ttl.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let amount: u32 = digits.parse().map_err(|_| bad())?;

    let expires = match unit {
        'd' => now.checked_add_days(Days::new(u64::from(amount))),
        'h' => now.checked_add_signed(chrono::Duration::hours(i64::from(amount))),
        'm' => now.checked_add_months(Months::new(amount)),
        'y' => amount
            .checked_mul(12)
            .and_then(|months| now.checked_add_months(Months::new(months))),
        _ => return Err(bad()),
    };

    expires
        .map(Some)
        .ok_or_else(|| RagError::validation(format!("ttl {ttl:?} overflows the calendar")))
}

/// Validate a query result limit: integer in `[1, 20]`.
pub fn validate_query_limit(limit: i64) -> Result<usize, RagError> {
    if limit < 1 || limit > MAX_SEARCH_LIMIT as i64 {
        return Err(RagError::validation(format!(
            "limit must be between 1 and {MAX_SEARCH_LIMIT}, got {limit}"
        )));
    }
    Ok(limit as usize)
}

/// Validate a minimum-score threshold. Negatives and values above 2 are
/// distinct rejections.
pub fn validate_min_score(value: f64) -> Result<f32, RagError> {
    if value < 0.0 {
        return Err(RagError::validation(format!(
            "minScore must not be negative, got {value}"
        )));
    }
    if value > 2.0 {
        return Err(RagError::validation(format!(
            "minScore must not exceed 2, got {value}"
        )));
    }
    Ok(value as f32)
}
