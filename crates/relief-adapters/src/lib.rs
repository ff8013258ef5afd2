//! Feed row parsing and field extraction heuristics.
//!
//! The upstream sheet renames, reorders, and translates its columns between
//! revisions. The row parser keeps header text exactly as published; tolerance
//! for drift lives entirely in the alias table and the note fallbacks below.

use std::io::Cursor;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use relief_core::{CandidateRecord, INGEST_MARKER};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "relief-adapters";

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Words that introduce a phone number inside free-text notes.
pub const PHONE_MARKERS: &[&str] = &["SĐT", "ĐT", "liên hệ", "gọi"];

pub const MAX_NOTE_ADDRESS_CHARS: usize = 200;

fn phone_marker_alternation() -> String {
    PHONE_MARKERS
        .iter()
        .map(|m| regex::escape(m))
        .collect::<Vec<_>>()
        .join("|")
}

static PHONE_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("(?i)(?:{})", phone_marker_alternation()))
        .expect("phone marker pattern is valid")
});

static NOTE_PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)(?:{})[:\s]*([0-9.\s]{{9,15}})",
        phone_marker_alternation()
    ))
    .expect("note phone pattern is valid")
});

// ---------------------------------------------------------------------------
// Streaming row parser
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("reading feed header row: {0}")]
    Header(#[source] csv::Error),
    #[error("reading feed record near line {line}: {source}")]
    Record {
        line: u64,
        #[source]
        source: csv::Error,
    },
}

/// One data line, keyed by the feed's own header text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRow {
    pub line: u64,
    pub cells: Vec<(String, String)>,
}

impl FeedRow {
    /// Value under a header whose text, ignoring surrounding whitespace, equals `alias`.
    /// A later duplicate header shadows an earlier one.
    pub fn lookup(&self, alias: &str) -> Option<&str> {
        self.cells
            .iter()
            .rev()
            .find(|(header, _)| header.trim() == alias)
            .map(|(_, value)| value.as_str())
    }

    /// `header=value` pairs for non-empty cells, for log lines.
    pub fn raw(&self) -> String {
        self.cells
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(header, value)| format!("{header}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Lazy row sequence over one feed snapshot. Stops after the first malformed record.
pub struct FeedRows {
    headers: Vec<String>,
    records: csv::StringRecordsIntoIter<Cursor<Vec<u8>>>,
    failed: bool,
}

impl FeedRows {
    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

impl std::fmt::Debug for FeedRows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedRows")
            .field("headers", &self.headers)
            .field("failed", &self.failed)
            .finish()
    }
}

impl Iterator for FeedRows {
    type Item = Result<FeedRow, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let record = match self.records.next()? {
                Ok(record) => record,
                Err(source) => {
                    self.failed = true;
                    let line = source.position().map(|p| p.line()).unwrap_or_default();
                    return Some(Err(ParseError::Record { line, source }));
                }
            };

            if record.len() <= 1 && record.iter().all(|field| field.trim().is_empty()) {
                continue;
            }

            let line = record.position().map(|p| p.line()).unwrap_or_default();
            let cells = self
                .headers
                .iter()
                .enumerate()
                .map(|(idx, header)| {
                    let value = record.get(idx).unwrap_or_default().trim().to_string();
                    (header.clone(), value)
                })
                .collect();
            return Some(Ok(FeedRow { line, cells }));
        }
    }
}

/// First line is the header row; ragged records are padded with empty values
/// and cells past the last header are dropped.
pub fn parse_feed(mut body: Vec<u8>) -> Result<FeedRows, ParseError> {
    if body.starts_with(UTF8_BOM) {
        body.drain(..UTF8_BOM.len());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(Cursor::new(body));

    let headers = reader
        .headers()
        .map_err(ParseError::Header)?
        .iter()
        .map(ToString::to_string)
        .collect();

    Ok(FeedRows {
        headers,
        records: reader.into_records(),
        failed: false,
    })
}

// ---------------------------------------------------------------------------
// Alias table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateField {
    Name,
    Address,
    Phone,
    Status,
    Area,
    PeopleCount,
    Note,
}

impl CandidateField {
    pub const ALL: [CandidateField; 7] = [
        CandidateField::Name,
        CandidateField::Address,
        CandidateField::Phone,
        CandidateField::Status,
        CandidateField::Area,
        CandidateField::PeopleCount,
        CandidateField::Note,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldAliasRule {
    pub field: CandidateField,
    pub aliases: Vec<String>,
}

/// Ordered header aliases per logical field; earlier aliases win.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldAliases {
    pub version: u32,
    #[serde(default)]
    pub fields: Vec<FieldAliasRule>,
}

fn rule(field: CandidateField, aliases: &[&str]) -> FieldAliasRule {
    FieldAliasRule {
        field,
        aliases: aliases.iter().map(|a| a.to_string()).collect(),
    }
}

fn builtin_rules() -> Vec<FieldAliasRule> {
    vec![
        rule(
            CandidateField::Name,
            &[
                "Tên",
                "Họ tên",
                "Người liên hệ",
                "Chủ hộ",
                "Name",
                "Full Name",
                "Contact Person",
                "Household Head",
            ],
        ),
        rule(
            CandidateField::Address,
            &["Địa chỉ", "Địa điểm", "Nơi cần hỗ trợ", "Address", "Location"],
        ),
        rule(
            CandidateField::Phone,
            &[
                "Thông tin liên lạc",
                "SĐT",
                "Số điện thoại",
                "Điện thoại",
                "Contact",
                "Phone",
                "Phone Number",
            ],
        ),
        rule(
            CandidateField::Status,
            &["Tình trạng", "Mức độ", "Status", "Severity"],
        ),
        rule(
            CandidateField::Area,
            &["Chi tiết khu vực", "Khu vực", "Huyện/Xã", "Area", "District"],
        ),
        rule(
            CandidateField::PeopleCount,
            &["Số người", "People", "People Count"],
        ),
        rule(
            CandidateField::Note,
            &["Ghi chú", "Nội dung hỗ trợ", "Cần hỗ trợ", "Note", "Notes"],
        ),
    ]
}

impl Default for FieldAliases {
    fn default() -> Self {
        Self {
            version: 1,
            fields: builtin_rules(),
        }
    }
}

impl FieldAliases {
    /// Fields the document leaves out keep their built-in aliases.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let mut parsed: FieldAliases =
            serde_yaml::from_str(text).context("parsing field alias table")?;
        for default_rule in builtin_rules() {
            if !parsed.fields.iter().any(|r| r.field == default_rule.field) {
                parsed.fields.push(default_rule);
            }
        }
        Ok(parsed)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn aliases_for(&self, field: CandidateField) -> impl Iterator<Item = &str> + '_ {
        self.fields
            .iter()
            .filter(move |r| r.field == field)
            .flat_map(|r| r.aliases.iter().map(String::as_str))
    }

    pub fn resolve<'r>(&self, field: CandidateField, row: &'r FeedRow) -> &'r str {
        self.aliases_for(field)
            .filter_map(|alias| row.lookup(alias))
            .find(|value| !value.is_empty())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Field extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionWarning {
    #[error("row at line {line} has no address, phone, or note")]
    EmptyRow { line: u64 },
}

/// Phone introduced by a marker word, with dot and whitespace separators removed.
pub fn phone_from_note(note: &str) -> Option<String> {
    let captured = NOTE_PHONE_RE.captures(note)?.get(1)?.as_str();
    let digits: String = captured
        .chars()
        .filter(|c| *c != '.' && !c.is_whitespace())
        .collect();
    (!digits.is_empty()).then_some(digits)
}

/// Note text before the first phone marker, capped at [`MAX_NOTE_ADDRESS_CHARS`].
pub fn address_from_note(note: &str) -> String {
    let head = PHONE_MARKER_RE.split(note).next().unwrap_or(note).trim();
    if head.chars().count() > MAX_NOTE_ADDRESS_CHARS {
        let mut truncated: String = head.chars().take(MAX_NOTE_ADDRESS_CHARS).collect();
        truncated.push_str("...");
        truncated
    } else {
        head.to_string()
    }
}

pub fn composite_description(
    address: &str,
    area: &str,
    people_count: &str,
    note: &str,
    status_text: &str,
) -> String {
    [
        format!("Nguồn: {INGEST_MARKER}"),
        format!("Địa chỉ: {address}"),
        format!("Khu vực: {area}"),
        format!("Số người: {people_count}"),
        format!("Ghi chú gốc: {note}"),
        format!("Tình trạng: {status_text}"),
    ]
    .iter()
    .map(|line| line.trim_end())
    .collect::<Vec<_>>()
    .join("\n")
}

#[derive(Debug, Clone, Default)]
pub struct FieldExtractor {
    aliases: FieldAliases,
}

impl FieldExtractor {
    pub fn new(aliases: FieldAliases) -> Self {
        Self { aliases }
    }

    pub fn aliases(&self) -> &FieldAliases {
        &self.aliases
    }

    pub fn extract(&self, row: &FeedRow) -> Result<CandidateRecord, ExtractionWarning> {
        let resolve = |field| self.aliases.resolve(field, row).to_string();

        let name = resolve(CandidateField::Name);
        let mut address = resolve(CandidateField::Address);
        let mut phone = resolve(CandidateField::Phone);
        let status_text = resolve(CandidateField::Status);
        let area = resolve(CandidateField::Area);
        let people_count = resolve(CandidateField::PeopleCount);
        let note = resolve(CandidateField::Note);

        if address.is_empty() && phone.is_empty() && !note.is_empty() {
            if let Some(found) = phone_from_note(&note) {
                phone = found;
            }
            address = address_from_note(&note);
        }

        if address.is_empty() && phone.is_empty() && note.is_empty() {
            return Err(ExtractionWarning::EmptyRow { line: row.line });
        }

        let description = composite_description(&address, &area, &people_count, &note, &status_text);
        Ok(CandidateRecord {
            line: row.line,
            name,
            address,
            phone,
            status_text,
            area,
            people_count,
            note,
            description,
        })
    }
}
