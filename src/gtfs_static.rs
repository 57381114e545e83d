//! GTFS Static extractor.
//!
//! Reads a schedule bundle (zip archive or extracted directory) and yields
//! [`SourceRecord`]s one table at a time, in table-then-row order. Each table
//! is only read when iteration reaches it, and [`StaticBundle::records`] can be
//! called again to restart from the first table.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::PathBuf;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::error::DecodeError;
use crate::model::{FieldValue, RecordKind, SourceRecord};

/// Largest table the extractor will read into memory.
const MAX_TABLE_BYTES: u64 = 2 * 1024 * 1024 * 1024;
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// Layout of one GTFS table.
#[derive(Debug)]
pub struct TableSpec {
    pub file: &'static str,
    pub kind: RecordKind,
    /// Columns forming the native key, joined with `:`.
    pub key: &'static [&'static str],
    /// Column used as key when the key column is absent (single-agency feeds).
    pub key_fallback: Option<&'static str>,
    /// Columns a row cannot be used without.
    pub required_columns: &'static [&'static str],
    /// A bundle without this table fails extraction.
    pub mandatory: bool,
}

pub const TABLES: &[TableSpec] = &[
    TableSpec {
        file: "agency.txt",
        kind: RecordKind::Agency,
        key: &["agency_id"],
        key_fallback: Some("agency_name"),
        required_columns: &["agency_name"],
        mandatory: false,
    },
    TableSpec {
        file: "levels.txt",
        kind: RecordKind::Level,
        key: &["level_id"],
        key_fallback: None,
        required_columns: &["level_index"],
        mandatory: false,
    },
    TableSpec {
        file: "stops.txt",
        kind: RecordKind::Stop,
        key: &["stop_id"],
        key_fallback: None,
        required_columns: &[],
        mandatory: true,
    },
    TableSpec {
        file: "routes.txt",
        kind: RecordKind::Route,
        key: &["route_id"],
        key_fallback: None,
        required_columns: &["route_type"],
        mandatory: true,
    },
    TableSpec {
        file: "trips.txt",
        kind: RecordKind::Trip,
        key: &["trip_id"],
        key_fallback: None,
        required_columns: &["route_id", "service_id"],
        mandatory: true,
    },
    TableSpec {
        file: "stop_times.txt",
        kind: RecordKind::StopTime,
        key: &["trip_id", "stop_sequence"],
        key_fallback: None,
        required_columns: &[],
        mandatory: false,
    },
    TableSpec {
        file: "calendar_dates.txt",
        kind: RecordKind::CalendarDate,
        key: &["service_id", "date"],
        key_fallback: None,
        required_columns: &["exception_type"],
        mandatory: false,
    },
    TableSpec {
        file: "shapes.txt",
        kind: RecordKind::Shape,
        key: &["shape_id", "shape_pt_sequence"],
        key_fallback: None,
        required_columns: &["shape_pt_lat", "shape_pt_lon"],
        mandatory: false,
    },
];

/// Finds a table by `stops` or `stops.txt`.
pub fn table_spec(name: &str) -> Option<&'static TableSpec> {
    let file = if name.ends_with(".txt") {
        name.to_string()
    } else {
        format!("{name}.txt")
    };
    TABLES.iter().find(|t| t.file == file)
}

/// Tables selected by an optional filter, in extraction order.
pub fn selected_tables(filter: Option<&[String]>) -> Vec<&'static TableSpec> {
    match filter {
        None => TABLES.iter().collect(),
        Some(names) => TABLES
            .iter()
            .filter(|t| names.iter().any(|n| table_spec(n).is_some_and(|s| s.file == t.file)))
            .collect(),
    }
}

enum BundleSource {
    Archive(Bytes),
    Directory(PathBuf),
}

/// Item yielded by the extractor.
#[derive(Debug)]
pub enum Extracted {
    Record(SourceRecord),
    /// Row skipped because it cannot be used; counted, never fatal.
    Malformed {
        table: &'static str,
        row: u64,
        reason: String,
    },
}

/// An opened schedule bundle.
pub struct StaticBundle {
    source: BundleSource,
    tables: Vec<&'static TableSpec>,
    /// Table file name -> archive entry name or directory file path.
    entries: HashMap<&'static str, String>,
    version: DateTime<Utc>,
}

impl StaticBundle {
    /// Opens a zip archive held in memory.
    pub fn from_archive(bytes: Bytes, filter: Option<&[String]>) -> Result<Self, DecodeError> {
        let mut archive = ZipArchive::new(Cursor::new(bytes.clone()))
            .map_err(|e| DecodeError::Archive(e.to_string()))?;

        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        let mut entries = HashMap::new();
        for spec in TABLES.iter().map(|t| t.file).chain(["feed_info.txt"]) {
            // bundles zipped from a folder nest everything one level down
            let found = names
                .iter()
                .filter(|n| *n == spec || n.ends_with(&format!("/{spec}")))
                .min_by_key(|n| n.len());
            if let Some(entry) = found {
                entries.insert(spec, entry.clone());
            }
        }

        let newest_entry = entries
            .values()
            .filter_map(|name| archive.by_name(name).ok().map(|f| f.last_modified()))
            .filter_map(|dt| {
                NaiveDate::from_ymd_opt(dt.year().into(), dt.month().into(), dt.day().into())
            })
            .max();

        let mut bundle = Self {
            source: BundleSource::Archive(bytes),
            tables: selected_tables(filter),
            entries,
            version: Utc::now(),
        };
        bundle.check_mandatory()?;
        bundle.version = bundle.resolve_version(newest_entry)?;
        Ok(bundle)
    }

    /// Opens an already extracted bundle directory.
    pub fn from_directory(path: PathBuf, filter: Option<&[String]>) -> Result<Self, DecodeError> {
        if !path.is_dir() {
            return Err(DecodeError::Archive(format!("{} is not a directory", path.display())));
        }

        let mut entries = HashMap::new();
        let mut newest = None;
        for spec in TABLES.iter().map(|t| t.file).chain(["feed_info.txt"]) {
            let file = path.join(spec);
            if file.is_file() {
                let modified = std::fs::metadata(&file)
                    .and_then(|m| m.modified())
                    .ok()
                    .map(|t| DateTime::<Utc>::from(t).date_naive());
                newest = newest.max(modified);
                entries.insert(spec, file.display().to_string());
            }
        }

        let mut bundle = Self {
            source: BundleSource::Directory(path),
            tables: selected_tables(filter),
            entries,
            version: Utc::now(),
        };
        bundle.check_mandatory()?;
        bundle.version = bundle.resolve_version(newest)?;
        Ok(bundle)
    }

    /// Effective date of the bundle, used as observation time for every record.
    pub fn version_date(&self) -> DateTime<Utc> {
        self.version
    }

    /// Record kinds this bundle will produce.
    pub fn kinds(&self) -> Vec<RecordKind> {
        self.tables
            .iter()
            .filter(|t| self.entries.contains_key(t.file))
            .map(|t| t.kind)
            .collect()
    }

    /// Lazily iterates all records, table by table.
    pub fn records(&self) -> BundleRecords<'_> {
        BundleRecords {
            bundle: self,
            next_table: 0,
            current: None,
        }
    }

    fn check_mandatory(&self) -> Result<(), DecodeError> {
        for table in &self.tables {
            if table.mandatory && !self.entries.contains_key(table.file) {
                return Err(DecodeError::MissingTable(table.file));
            }
        }
        Ok(())
    }

    fn read_table(&self, file: &'static str) -> Result<Option<Vec<u8>>, DecodeError> {
        let Some(entry) = self.entries.get(file) else {
            return Ok(None);
        };
        let table_err = |reason: String| DecodeError::Table { table: file, reason };

        let mut data = match &self.source {
            BundleSource::Archive(bytes) => {
                let mut archive = ZipArchive::new(Cursor::new(bytes.clone()))
                    .map_err(|e| DecodeError::Archive(e.to_string()))?;
                let zipped = archive.by_name(entry).map_err(|e| table_err(e.to_string()))?;
                let declared = zipped.size();
                read_capped(zipped, declared, MAX_TABLE_BYTES).map_err(table_err)?
            }
            BundleSource::Directory(_) => {
                let file = std::fs::File::open(entry).map_err(|e| table_err(e.to_string()))?;
                let declared = file.metadata().map(|m| m.len()).unwrap_or(0);
                read_capped(file, declared, MAX_TABLE_BYTES).map_err(table_err)?
            }
        };

        if data.starts_with(&[0xEF, 0xBB, 0xBF]) {
            data.drain(..3);
        }
        Ok(Some(data))
    }

    /// `feed_info.txt` start date, else the newest table date, else today.
    fn resolve_version(&self, fallback: Option<NaiveDate>) -> Result<DateTime<Utc>, DecodeError> {
        let from_feed_info = match self.read_table("feed_info.txt")? {
            Some(data) => {
                let mut reader = csv::ReaderBuilder::new()
                    .flexible(true)
                    .from_reader(Cursor::new(data));
                let start_col = reader
                    .headers()
                    .ok()
                    .and_then(|h| h.iter().position(|c| c.trim() == "feed_start_date"));
                let first = reader.records().next().and_then(Result::ok);
                match (start_col, first) {
                    (Some(col), Some(row)) => row
                        .get(col)
                        .and_then(|raw| NaiveDate::parse_from_str(raw.trim(), "%Y%m%d").ok()),
                    _ => None,
                }
            }
            None => None,
        };

        let date = from_feed_info
            .or(fallback)
            .unwrap_or_else(|| Utc::now().date_naive());
        debug!(version = %date, from_feed_info = from_feed_info.is_some(), "Resolved bundle version date");
        Ok(Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN)))
    }
}

/// Reads at most `limit` bytes. `declared` only sizes the initial buffer and
/// is not trusted beyond [`MAX_PREALLOCATION`].
fn read_capped(reader: impl Read, declared: u64, limit: u64) -> Result<Vec<u8>, String> {
    let mut data = Vec::with_capacity(declared.min(MAX_PREALLOCATION).min(limit) as usize);
    reader
        .take(limit + 1)
        .read_to_end(&mut data)
        .map_err(|e| e.to_string())?;
    if data.len() as u64 > limit {
        return Err(format!("table larger than {limit} bytes"));
    }
    Ok(data)
}

struct TableRows {
    spec: &'static TableSpec,
    headers: Vec<String>,
    rows: csv::StringRecordsIntoIter<Cursor<Vec<u8>>>,
    row: u64,
}

/// Iterator returned by [`StaticBundle::records`].
pub struct BundleRecords<'a> {
    bundle: &'a StaticBundle,
    next_table: usize,
    current: Option<TableRows>,
}

impl Iterator for BundleRecords<'_> {
    type Item = Result<Extracted, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(table) = self.current.as_mut() {
                match table.rows.next() {
                    Some(row) => {
                        table.row += 1;
                        return Some(Ok(parse_row(table, row, self.bundle.version)));
                    }
                    None => self.current = None,
                }
            }

            let spec = *self.bundle.tables.get(self.next_table)?;
            self.next_table += 1;

            let data = match self.bundle.read_table(spec.file) {
                Ok(Some(data)) => data,
                Ok(None) => {
                    debug!(table = spec.file, "Optional table not present in bundle");
                    continue;
                }
                Err(e) => return Some(Err(e)),
            };

            let mut reader = csv::ReaderBuilder::new()
                .flexible(true)
                .from_reader(Cursor::new(data));
            let headers = match reader.headers() {
                Ok(h) => h.iter().map(|c| c.trim().to_string()).collect(),
                Err(e) => {
                    return Some(Err(DecodeError::Table {
                        table: spec.file,
                        reason: e.to_string(),
                    }));
                }
            };
            self.current = Some(TableRows {
                spec,
                headers,
                rows: reader.into_records(),
                row: 0,
            });
        }
    }
}

fn parse_row(
    table: &TableRows,
    row: csv::Result<csv::StringRecord>,
    version: DateTime<Utc>,
) -> Extracted {
    let spec = table.spec;
    let malformed = |reason: String| {
        warn!(table = spec.file, row = table.row, %reason, "Skipping malformed row");
        Extracted::Malformed {
            table: spec.file,
            row: table.row,
            reason,
        }
    };

    let row = match row {
        Ok(row) => row,
        Err(e) => return malformed(e.to_string()),
    };

    // GTFS treats an empty cell the same as an omitted column
    let values: HashMap<&str, &str> = table
        .headers
        .iter()
        .map(String::as_str)
        .zip(row.iter().map(str::trim))
        .filter(|(_, v)| !v.is_empty())
        .collect();

    if let Some(column) = spec.required_columns.iter().find(|c| !values.contains_key(**c)) {
        return malformed(format!("missing mandatory column {column}"));
    }

    let key_parts: Option<Vec<&str>> = spec.key.iter().map(|c| values.get(c).copied()).collect();
    let key = match (key_parts, spec.key_fallback.and_then(|c| values.get(c))) {
        (Some(parts), _) => parts.join(":"),
        (None, Some(fallback)) => fallback.to_string(),
        (None, None) => return malformed(format!("missing key column {}", spec.key.join("+"))),
    };

    let mut record = SourceRecord::new(spec.kind, key, version);
    for (column, value) in values {
        record.set(column, Some(FieldValue::text(value)));
    }
    Extracted::Record(record)
}
