use std::time::Duration;

use chrono::{DateTime, Utc};

/// First `max_chars` characters of `s` (never splits a code point).
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Truncate to `max_chars` characters, appending "..." when something was cut.
pub fn truncate_text(s: &str, max_chars: usize) -> String {
    let cut = truncate_chars(s, max_chars);
    if cut.len() == s.len() {
        return s.to_string();
    }
    format!("{cut}...")
}

/// `1h 5m 3s` style rendering for status output.
pub fn format_duration(d: Duration) -> String {
    let seconds = d.as_secs();
    let hours = seconds / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        return format!("{hours}h {mins}m {secs}s");
    }
    if mins > 0 {
        return format!("{mins}m {secs}s");
    }
    format!("{secs}s")
}

/// Human "5 minutes ago" relative to `now`.
pub fn format_time_ago(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - ts).num_seconds().max(0);
    let plural = |n: i64| if n == 1 { "" } else { "s" };
    if seconds < 60 {
        return "just now".to_string();
    }
    if seconds < 3600 {
        let m = seconds / 60;
        return format!("{m} minute{} ago", plural(m));
    }
    if seconds < 86_400 {
        let h = seconds / 3600;
        return format!("{h} hour{} ago", plural(h));
    }
    let d = seconds / 86_400;
    format!("{d} day{} ago", plural(d))
}
