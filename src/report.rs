use crate::models::{MatchOutcome, MatchResult, ReportEntry, ReportOutcome};
use serde::Serialize;
use std::borrow::Cow;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Text,
    Json,
}

impl ReportFormat {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            ReportFormat::Json
        } else {
            ReportFormat::Text
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ReportFormat::Text => "text/plain; charset=utf-8",
            ReportFormat::Json => "application/json",
        }
    }
}

/// One entry per result, same order.
pub fn build_report(results: &[MatchResult]) -> Vec<ReportEntry> {
    results
        .iter()
        .enumerate()
        .map(|(i, r)| ReportEntry {
            index: i + 1,
            artist: r.item.artist.clone(),
            title: r.item.title.clone(),
            source_id: r.item.source_id.clone(),
            outcome: match &r.outcome {
                MatchOutcome::Matched {
                    destination_id, url, ..
                } => ReportOutcome::Matched {
                    destination_id: destination_id.clone(),
                    url: url.clone(),
                },
                MatchOutcome::NotFound => ReportOutcome::NotFound,
            },
        })
        .collect()
}

fn matched_count(entries: &[ReportEntry]) -> usize {
    entries
        .iter()
        .filter(|e| matches!(e.outcome, ReportOutcome::Matched { .. }))
        .count()
}

/// Tabs and line breaks inside a field would split an entry.
fn one_line(s: &str) -> Cow<'_, str> {
    let breaks = |c: char| matches!(c, '\t' | '\n' | '\r');
    if s.contains(breaks) {
        Cow::Owned(s.replace(breaks, " "))
    } else {
        Cow::Borrowed(s)
    }
}

/// Header lines start with '#'; every other line is one entry.
pub fn render_text(entries: &[ReportEntry]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# discofy transfer report");
    let _ = writeln!(out, "# matched {} of {}", matched_count(entries), entries.len());
    for e in entries {
        let (artist, title, source_id) = (one_line(&e.artist), one_line(&e.title), one_line(&e.source_id));
        match &e.outcome {
            ReportOutcome::Matched { destination_id, url } => {
                let link = one_line(url.as_deref().unwrap_or(destination_id));
                let _ = writeln!(out, "MATCHED\t{} - {}\t{}\t{}", artist, title, source_id, link);
            }
            ReportOutcome::NotFound => {
                let _ = writeln!(out, "NOT_FOUND\t{} - {}\t{}", artist, title, source_id);
            }
        }
    }
    out
}

#[derive(Serialize)]
struct JsonReport<'a> {
    matched: usize,
    total: usize,
    entries: &'a [ReportEntry],
}

pub fn render_json(entries: &[ReportEntry]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&JsonReport {
        matched: matched_count(entries),
        total: entries.len(),
        entries,
    })
}

pub fn render(entries: &[ReportEntry], format: ReportFormat) -> serde_json::Result<Vec<u8>> {
    Ok(match format {
        ReportFormat::Text => render_text(entries).into_bytes(),
        ReportFormat::Json => render_json(entries)?.into_bytes(),
    })
}
