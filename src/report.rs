//! Result output: the JSON document and the per-character capture table.

use crate::event::OutputRecord;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Write;

/// Captures credited to one character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTally {
    pub character_id: u64,
    pub character_name: String,
    pub captures: usize,
}

/// Write `records` as one JSON array.
pub fn write_json<W: Write>(records: &[OutputRecord], mut writer: W) -> Result<(), serde_json::Error> {
    serde_json::to_writer(&mut writer, records)?;
    writer.flush().map_err(serde_json::Error::io)
}

/// Count captures per character, most captures first, ties by name.
pub fn summarize(records: &[OutputRecord]) -> Vec<CaptureTally> {
    let mut counts: HashMap<(u64, &str), usize> = HashMap::new();
    for record in records {
        *counts
            .entry((record.character_id, record.character_name.as_str()))
            .or_default() += 1;
    }

    let mut tallies: Vec<CaptureTally> = counts
        .into_iter()
        .map(|((character_id, name), captures)| CaptureTally {
            character_id,
            character_name: name.to_string(),
            captures,
        })
        .collect();

    tallies.sort_by(|a, b| {
        b.captures
            .cmp(&a.captures)
            .then_with(|| a.character_name.cmp(&b.character_name))
            .then_with(|| a.character_id.cmp(&b.character_id))
    });
    tallies
}

/// Render tallies as a plain-text table with Name, Captures and CharacterId
/// columns.
pub fn render_table(tallies: &[CaptureTally]) -> String {
    const HEADERS: [&str; 3] = ["Name", "Captures", "CharacterId"];

    let rows: Vec<[String; 3]> = tallies
        .iter()
        .map(|t| {
            [
                t.character_name.clone(),
                t.captures.to_string(),
                t.character_id.to_string(),
            ]
        })
        .collect();

    let mut widths = HEADERS.map(|h| h.chars().count());
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let border = format!(
        "+{}+",
        widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+")
    );

    let mut out = String::new();
    let _ = writeln!(out, "{border}");
    let _ = writeln!(
        out,
        "| {:<w0$} | {:>w1$} | {:^w2$} |",
        HEADERS[0],
        HEADERS[1],
        HEADERS[2],
        w0 = widths[0],
        w1 = widths[1],
        w2 = widths[2]
    );
    let _ = writeln!(out, "{border}");
    for [name, captures, id] in &rows {
        let _ = writeln!(
            out,
            "| {:<w0$} | {:>w1$} | {:^w2$} |",
            name,
            captures,
            id,
            w0 = widths[0],
            w1 = widths[1],
            w2 = widths[2]
        );
    }
    let _ = writeln!(out, "{border}");
    out
}
