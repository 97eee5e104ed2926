//! Formatting utilities (summary → Telegram HTML).

use chrono::FixedOffset;

use crate::{
    domain::{Sentiment, Summary},
    utils::{truncate_chars, truncate_text},
};

const MAX_BULLET_CHARS: usize = 400;

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[derive(Clone, Copy, Debug)]
pub struct SummaryFormat {
    pub max_key_points: usize,
    pub offset: FixedOffset,
    /// Messenger hard limit for one message.
    pub max_len: usize,
}

fn sentiment_badge(s: Sentiment) -> &'static str {
    match s {
        Sentiment::Bullish => "Bullish 📈",
        Sentiment::Bearish => "Bearish 📉",
        Sentiment::Neutral => "Neutral ➖",
        Sentiment::Unknown => "Unknown ❔",
    }
}

/// Render a summary as one Telegram HTML message. Empty sections are omitted.
pub fn format_summary_html(summary: &Summary, fmt: &SummaryFormat) -> String {
    let mut out = String::from("📊 <b>Financial News Summary</b>\n\n");
    out.push_str(&escape_html(summary.headline.trim()));

    let points: Vec<&String> = summary
        .bullets
        .iter()
        .filter(|b| !b.trim().is_empty())
        .take(fmt.max_key_points)
        .collect();
    if !points.is_empty() {
        out.push_str("\n\n<b>Key Points:</b>");
        for p in points {
            out.push_str("\n• ");
            out.push_str(&escape_html(&truncate_text(p.trim(), MAX_BULLET_CHARS)));
        }
    }

    out.push_str("\n\n<b>Market Sentiment:</b> ");
    out.push_str(sentiment_badge(summary.sentiment));

    if !summary.impacted.is_empty() {
        let impacted = summary
            .impacted
            .iter()
            .map(|s| escape_html(s))
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str("\n\n<b>Potentially Impacted:</b> ");
        out.push_str(&impacted);
    }

    let local = summary.generated_at.with_timezone(&fmt.offset);
    out.push_str(&format!(
        "\n\n<i>Generated at {} (UTC{}) from {} message{}</i>",
        local.format("%Y-%m-%d %H:%M:%S"),
        fmt.offset,
        summary.source_batch_size,
        if summary.source_batch_size == 1 { "" } else { "s" }
    ));

    cap_message(out, fmt.max_len)
}

/// Hard cap on characters. A cut never leaves a partial tag or entity behind and
/// re-closes any `<b>`/`<i>` left open.
pub fn cap_message(html: String, max_len: usize) -> String {
    if html.chars().count() <= max_len {
        return html;
    }
    const TAIL: &str = "…";
    // Room for the tail plus the closing tags appended below.
    let reserve = "</b></i>".len() + 1;
    let cut = truncate_chars(&html, max_len.saturating_sub(reserve));
    // Drop a dangling partial tag or entity.
    let cut = match (cut.rfind('<'), cut.rfind('>')) {
        (Some(open), Some(close)) if open > close => &cut[..open],
        (Some(open), None) => &cut[..open],
        _ => cut,
    };
    let cut = match (cut.rfind('&'), cut.rfind(';')) {
        (Some(amp), Some(semi)) if amp > semi => &cut[..amp],
        (Some(amp), None) => &cut[..amp],
        _ => cut,
    };
    let mut out = cut.to_string();
    for tag in ["b", "i"] {
        let opens = out.matches(&format!("<{tag}>")).count();
        let closes = out.matches(&format!("</{tag}>")).count();
        if opens > closes {
            out.push_str(&format!("</{tag}>"));
        }
    }
    out.push_str(TAIL);
    out
}
