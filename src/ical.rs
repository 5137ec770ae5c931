//! iCalendar (RFC 5545) export of catalog records.
//!
//! Pure transforms; the only I/O is [`write_calendar`].

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::model::CatalogRecord;

const PRODID: &str = "-//AudioStacker//Release Tracker//EN";
const CAL_NAME: &str = "AudioStacker - New Releases";
const UID_DOMAIN: &str = "audiostacker";
const MAX_LINE_OCTETS: usize = 75;

/// One all-day `VEVENT` on the release day. The UID depends only on the
/// external identifier, so re-exports update events instead of duplicating them.
pub fn event_for(record: &CatalogRecord, dtstamp: DateTime<Utc>) -> String {
    let d = &record.details;
    let summary = match d.series_label() {
        Some(series) => format!("{} ({series})", d.title),
        None => d.title.clone(),
    };

    let mut desc = vec![
        "New audiobook release".to_string(),
        String::new(),
        format!("Title: {}", d.title),
        format!("Author: {}", d.author),
        format!(
            "Narrator: {}",
            if d.narrators.is_empty() { "Unknown".to_string() } else { d.narrators.join(", ") }
        ),
        format!("Publisher: {}", d.publisher.as_deref().unwrap_or("Unknown")),
    ];
    if let Some(series) = d.series_label() {
        desc.push(format!("Series: {series}"));
    }
    desc.push(format!("ASIN: {}", record.external_id));
    if let Some(link) = &record.link {
        desc.push(format!("Link: {link}"));
    }

    let start = d.release_date;
    let end = start.succ_opt().unwrap_or(start);

    let mut lines = vec![
        "BEGIN:VEVENT".to_string(),
        format!("UID:audiobook-{}@{UID_DOMAIN}", escape_text(&record.external_id)),
        format!("DTSTAMP:{}", dtstamp.format("%Y%m%dT%H%M%SZ")),
        format!("DTSTART;VALUE=DATE:{}", start.format("%Y%m%d")),
        format!("DTEND;VALUE=DATE:{}", end.format("%Y%m%d")),
        format!("SUMMARY:{}", escape_text(&summary)),
        format!("DESCRIPTION:{}", escape_text(&desc.join("\n"))),
    ];
    if let Some(link) = &record.link {
        lines.push(format!("URL:{link}"));
    }
    lines.extend([
        "CATEGORIES:Audiobooks".to_string(),
        "TRANSP:TRANSPARENT".to_string(),
        "END:VEVENT".to_string(),
    ]);

    lines.iter().map(|l| fold_line(l)).collect::<Vec<_>>().join("\r\n")
}

/// Full `VCALENDAR` document for a single record.
pub fn calendar_for(record: &CatalogRecord, dtstamp: DateTime<Utc>) -> String {
    calendar(std::slice::from_ref(record), dtstamp)
}

/// Full `VCALENDAR` document with one event per record, in input order.
pub fn calendar(records: &[CatalogRecord], dtstamp: DateTime<Utc>) -> String {
    let mut out = vec![
        "BEGIN:VCALENDAR".to_string(),
        "VERSION:2.0".to_string(),
        format!("PRODID:{PRODID}"),
        "CALSCALE:GREGORIAN".to_string(),
        "METHOD:PUBLISH".to_string(),
        fold_line(&format!("X-WR-CALNAME:{CAL_NAME}")),
    ];
    out.extend(records.iter().map(|r| event_for(r, dtstamp)));
    out.push("END:VCALENDAR".to_string());
    let mut doc = out.join("\r\n");
    doc.push_str("\r\n");
    doc
}

/// Writes atomically: temp file in the same directory, then rename.
pub fn write_calendar(path: &Path, records: &[CatalogRecord], dtstamp: DateTime<Utc>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp = path.with_extension("ics.tmp");
    std::fs::write(&tmp, calendar(records, dtstamp))
        .with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming to {}", path.display()))?;
    tracing::debug!(target: "engine", path = %path.display(), events = records.len(), "calendar written");
    Ok(())
}

/// TEXT value escaping: backslash, semicolon, comma and newlines.
pub fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            other => out.push(other),
        }
    }
    out
}

/// Folds at 75 octets without splitting a UTF-8 character.
pub fn fold_line(line: &str) -> String {
    if line.len() <= MAX_LINE_OCTETS {
        return line.to_string();
    }
    let mut out = String::with_capacity(line.len() + line.len() / MAX_LINE_OCTETS * 3);
    let mut used = 0;
    for c in line.chars() {
        let w = c.len_utf8();
        if used + w > MAX_LINE_OCTETS {
            out.push_str("\r\n ");
            // continuation lines start with the space, which counts
            used = 1;
        }
        out.push(c);
        used += w;
    }
    out
}
