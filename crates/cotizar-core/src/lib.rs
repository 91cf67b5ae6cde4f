//! Core domain model for cotizar: series records, keys, board quotes and the
//! catalog of destination sheets.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "cotizar-core";

/// Number format applied to every value column on write.
pub const NUMBER_FORMAT: &str = "#,##0.00";

/// How ambiguous `a/b/YYYY` dates are read. Year-leading values are always
/// read as `YYYY-MM-DD` regardless of the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatePolicy {
    DayFirst,
    YearFirst,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateParseError {
    #[error("empty date value")]
    Empty,
    #[error("unrecognized date value '{0}'")]
    Unrecognized(String),
    #[error("date value '{0}' is out of range")]
    OutOfRange(String),
}

/// Parse a raw date cell into a calendar date under an explicit policy.
///
/// Time components (`T...` or ` HH:MM:SS`) are ignored, so already-canonical
/// values and ISO datetimes round-trip unchanged.
pub fn normalize_date(raw: &str, policy: DatePolicy) -> Result<NaiveDate, DateParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DateParseError::Empty);
    }
    let date_part = trimmed.split(['T', ' ']).next().unwrap_or(trimmed);
    let parts: Vec<&str> = date_part.split(['-', '/', '.']).collect();
    let [a, b, c] = parts.as_slice() else {
        return Err(DateParseError::Unrecognized(trimmed.to_string()));
    };
    if [a, b, c]
        .iter()
        .any(|p| p.is_empty() || !p.chars().all(|ch| ch.is_ascii_digit()))
    {
        return Err(DateParseError::Unrecognized(trimmed.to_string()));
    }

    let (year, month, day) = if a.len() == 4 {
        (*a, *b, *c)
    } else if c.len() == 4 {
        match policy {
            DatePolicy::DayFirst => (*c, *b, *a),
            DatePolicy::YearFirst => (*c, *a, *b),
        }
    } else {
        return Err(DateParseError::Unrecognized(trimmed.to_string()));
    };

    let parse = |s: &str| s.parse::<u32>().ok();
    match (parse(year), parse(month), parse(day)) {
        (Some(y), Some(m), Some(d)) => NaiveDate::from_ymd_opt(y as i32, m, d)
            .ok_or_else(|| DateParseError::OutOfRange(trimmed.to_string())),
        _ => Err(DateParseError::Unrecognized(trimmed.to_string())),
    }
}

/// Decimal-comma tolerant number parsing.
///
/// `1234,5`, `1234.5`, `1.234,5` and `1,234.5` all yield `1234.5`: when both
/// separators appear the right-most one is the decimal point. A separator that
/// repeats on its own is a thousands separator.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }
    let last_comma = compact.rfind(',');
    let last_dot = compact.rfind('.');
    let normalized = match (last_comma, last_dot) {
        (Some(comma), Some(dot)) if comma > dot => compact.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => compact.replace(',', ""),
        (Some(_), None) if compact.matches(',').count() > 1 => compact.replace(',', ""),
        (Some(_), None) => compact.replace(',', "."),
        (None, Some(_)) if compact.matches('.').count() > 1 => compact.replace('.', ""),
        _ => compact,
    };
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Inclusive range of calendar days requested from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// True once the start has moved past the end: nothing left to fetch.
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Dedup/sort key of a record: a calendar date or an opaque period label.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SeriesKey {
    Date(NaiveDate),
    Period(String),
}

impl SeriesKey {
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            SeriesKey::Date(date) => Some(*date),
            SeriesKey::Period(_) => None,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeriesKey::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            SeriesKey::Period(period) => f.write_str(period),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum CellValue {
    Flag(bool),
    Number(f64),
    Text(String),
    #[default]
    Empty,
}

impl CellValue {
    pub fn number(raw: &str) -> Self {
        parse_decimal(raw).map_or(CellValue::Empty, CellValue::Number)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Number(v) => Some(*v),
            CellValue::Text(s) => parse_decimal(s),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> bool {
        match self {
            CellValue::Flag(b) => *b,
            CellValue::Number(v) => *v != 0.0,
            CellValue::Text(s) => matches!(s.trim(), "true" | "TRUE" | "True" | "1"),
            CellValue::Empty => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }
}

/// One row of a series: its key plus named field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub key: SeriesKey,
    pub values: BTreeMap<String, CellValue>,
}

impl SeriesRecord {
    pub fn new(key: SeriesKey) -> Self {
        Self {
            key,
            values: BTreeMap::new(),
        }
    }

    pub fn dated(date: NaiveDate) -> Self {
        Self::new(SeriesKey::Date(date))
    }

    pub fn with(mut self, column: impl Into<String>, value: CellValue) -> Self {
        self.values.insert(column.into(), value);
        self
    }

    pub fn get(&self, column: &str) -> &CellValue {
        const EMPTY: &CellValue = &CellValue::Empty;
        self.values.get(column).unwrap_or(EMPTY)
    }

    pub fn number(&self, column: &str) -> Option<f64> {
        self.get(column).as_f64()
    }
}

/// A named, key-ordered sequence of records with unique keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub name: String,
    pub key_column: String,
    pub records: Vec<SeriesRecord>,
}

impl Series {
    pub fn empty(name: impl Into<String>, key_column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_column: key_column.into(),
            records: Vec::new(),
        }
    }

    /// Builds a series from arbitrary records: duplicates collapse to the
    /// last occurrence and the result is sorted by key.
    pub fn from_records(
        name: impl Into<String>,
        key_column: impl Into<String>,
        records: Vec<SeriesRecord>,
    ) -> Self {
        let mut series = Self::empty(name, key_column);
        series.records = records;
        series.normalize();
        series
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Last stored date, used to resolve the next fetch window.
    pub fn cursor(&self) -> Option<NaiveDate> {
        self.records.iter().filter_map(|r| r.key.as_date()).max()
    }

    /// Upsert: existing records followed by `incoming`, last write wins.
    pub fn merge(mut self, incoming: Vec<SeriesRecord>) -> Self {
        self.records.extend(incoming);
        self.normalize();
        self
    }

    fn normalize(&mut self) {
        let mut by_key: BTreeMap<SeriesKey, SeriesRecord> = BTreeMap::new();
        for record in self.records.drain(..) {
            by_key.insert(record.key.clone(), record);
        }
        self.records = by_key.into_values().collect();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Commodity {
    Trigo,
    Maiz,
    Sorgo,
    Girasol,
    Soja,
}

impl Commodity {
    pub const ALL: [Commodity; 5] = [
        Commodity::Trigo,
        Commodity::Maiz,
        Commodity::Sorgo,
        Commodity::Girasol,
        Commodity::Soja,
    ];

    /// Key used by the board payload.
    pub fn api_code(self) -> &'static str {
        match self {
            Commodity::Trigo => "trigo",
            Commodity::Maiz => "maiz",
            Commodity::Sorgo => "sorgo",
            Commodity::Girasol => "girasol",
            Commodity::Soja => "soja",
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            Commodity::Trigo => "Trigo",
            Commodity::Maiz => "Maíz",
            Commodity::Sorgo => "Sorgo",
            Commodity::Girasol => "Girasol",
            Commodity::Soja => "Soja",
        }
    }

    /// Hidden provenance column paired with [`Commodity::column`].
    pub fn flag_column(self) -> &'static str {
        match self {
            Commodity::Trigo => "Trigo_is_est",
            Commodity::Maiz => "Maíz_is_est",
            Commodity::Sorgo => "Sorgo_is_est",
            Commodity::Girasol => "Girasol_is_est",
            Commodity::Soja => "Soja_is_est",
        }
    }
}

/// A board value and whether it is an estimate rather than a closing price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BoardQuote {
    pub value: f64,
    pub estimated: bool,
}

impl BoardQuote {
    /// Actual price wins, then the estimate; neither present means no data.
    pub fn resolve(price: Option<f64>, estimate: Option<f64>) -> Self {
        match (price, estimate) {
            (Some(p), _) if p > 0.0 => Self {
                value: p,
                estimated: false,
            },
            (_, Some(e)) if e > 0.0 => Self {
                value: e,
                estimated: true,
            },
            _ => Self::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardRecord {
    pub date: NaiveDate,
    pub quotes: BTreeMap<Commodity, BoardQuote>,
}

impl BoardRecord {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            quotes: BTreeMap::new(),
        }
    }

    pub fn quote(&self, commodity: Commodity) -> BoardQuote {
        self.quotes.get(&commodity).copied().unwrap_or_default()
    }

    /// Flattens into a row with one value column and one flag column per commodity.
    pub fn to_series_record(&self) -> SeriesRecord {
        Commodity::ALL
            .iter()
            .fold(SeriesRecord::dated(self.date), |record, commodity| {
                let quote = self.quote(*commodity);
                record
                    .with(commodity.column(), CellValue::Number(quote.value))
                    .with(commodity.flag_column(), CellValue::Flag(quote.estimated))
            })
    }

    pub fn from_series_record(record: &SeriesRecord) -> Option<Self> {
        let date = record.key.as_date()?;
        let quotes = Commodity::ALL
            .iter()
            .map(|c| {
                (
                    *c,
                    BoardQuote {
                        value: record.number(c.column()).unwrap_or(0.0),
                        estimated: record.get(c.flag_column()).as_flag(),
                    },
                )
            })
            .collect();
        Some(Self { date, quotes })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyKind {
    Date,
    Period,
}

/// Static description of one destination sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesSchema {
    pub id: SeriesId,
    pub sheet: &'static str,
    pub key_column: &'static str,
    pub key_kind: KeyKind,
    pub value_columns: &'static [&'static str],
    pub flag_columns: &'static [&'static str],
    /// Policy for re-reading key cells already stored in the sheet.
    pub read_policy: DatePolicy,
}

impl SeriesSchema {
    pub fn columns(&self) -> Vec<String> {
        std::iter::once(self.key_column)
            .chain(self.value_columns.iter().copied())
            .chain(self.flag_columns.iter().copied())
            .map(ToString::to_string)
            .collect()
    }

    pub fn empty_series(&self) -> Series {
        Series::empty(self.sheet, self.key_column)
    }

    /// Parses a stored key cell under the sheet's read policy.
    pub fn parse_key(&self, raw: &str) -> Result<SeriesKey, DateParseError> {
        self.key_from(raw, self.read_policy)
    }

    /// Period keys that look like dates are canonicalized to `YYYY-MM-DD`;
    /// anything else non-empty is kept verbatim.
    pub fn key_from(&self, raw: &str, policy: DatePolicy) -> Result<SeriesKey, DateParseError> {
        match self.key_kind {
            KeyKind::Date => normalize_date(raw, policy).map(SeriesKey::Date),
            KeyKind::Period => match normalize_date(raw, policy) {
                Ok(date) => Ok(SeriesKey::Period(date.format("%Y-%m-%d").to_string())),
                Err(DateParseError::Empty) => Err(DateParseError::Empty),
                Err(_) => Ok(SeriesKey::Period(raw.trim().to_string())),
            },
        }
    }
}

/// Closed catalog of synchronized series, in run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SeriesId {
    DivisaBillete,
    Mep,
    Libre,
    Uva,
    Ipc,
    Cac,
    Smvym,
    PizarraRosario,
}

const DIVISA_BILLETE: SeriesSchema = SeriesSchema {
    id: SeriesId::DivisaBillete,
    sheet: "Divisa-Billete",
    key_column: "Fecha",
    key_kind: KeyKind::Date,
    value_columns: &["Billete Compra", "Billete Venta", "Divisa Compra", "Divisa Venta"],
    flag_columns: &[],
    read_policy: DatePolicy::DayFirst,
};

const MEP: SeriesSchema = SeriesSchema {
    id: SeriesId::Mep,
    sheet: "MEP",
    key_column: "fecha",
    key_kind: KeyKind::Date,
    value_columns: &["DOLAR MEP"],
    flag_columns: &[],
    read_policy: DatePolicy::DayFirst,
};

const LIBRE: SeriesSchema = SeriesSchema {
    id: SeriesId::Libre,
    sheet: "Libre",
    key_column: "Fecha",
    key_kind: KeyKind::Date,
    value_columns: &["Compra", "Venta"],
    flag_columns: &[],
    read_policy: DatePolicy::DayFirst,
};

const UVA: SeriesSchema = SeriesSchema {
    id: SeriesId::Uva,
    sheet: "UVA",
    key_column: "Fecha",
    key_kind: KeyKind::Date,
    value_columns: &["Valor"],
    flag_columns: &[],
    read_policy: DatePolicy::YearFirst,
};

const IPC: SeriesSchema = SeriesSchema {
    id: SeriesId::Ipc,
    sheet: "IPC",
    key_column: "Fecha",
    key_kind: KeyKind::Date,
    value_columns: &["Valor"],
    flag_columns: &[],
    read_policy: DatePolicy::YearFirst,
};

const CAC: SeriesSchema = SeriesSchema {
    id: SeriesId::Cac,
    sheet: "CAC",
    key_column: "Periodo",
    key_kind: KeyKind::Period,
    value_columns: &["General", "Materiales", "Mano de obra"],
    flag_columns: &[],
    read_policy: DatePolicy::DayFirst,
};

const SMVYM: SeriesSchema = SeriesSchema {
    id: SeriesId::Smvym,
    sheet: "SMVYM",
    key_column: "Periodo",
    key_kind: KeyKind::Date,
    value_columns: &["Salario"],
    flag_columns: &[],
    read_policy: DatePolicy::YearFirst,
};

const PIZARRA_ROSARIO: SeriesSchema = SeriesSchema {
    id: SeriesId::PizarraRosario,
    sheet: "Pizarra Rosario",
    key_column: "Fecha",
    key_kind: KeyKind::Date,
    value_columns: &["Trigo", "Maíz", "Sorgo", "Girasol", "Soja"],
    flag_columns: &[
        "Trigo_is_est",
        "Maíz_is_est",
        "Sorgo_is_est",
        "Girasol_is_est",
        "Soja_is_est",
    ],
    read_policy: DatePolicy::DayFirst,
};

impl SeriesId {
    pub const ALL: [SeriesId; 8] = [
        SeriesId::DivisaBillete,
        SeriesId::Mep,
        SeriesId::Libre,
        SeriesId::Uva,
        SeriesId::Ipc,
        SeriesId::Cac,
        SeriesId::Smvym,
        SeriesId::PizarraRosario,
    ];

    /// Daily exchange-rate series that get the calendar gap-fill pass.
    pub const DAILY_RATES: [SeriesId; 3] = [SeriesId::DivisaBillete, SeriesId::Mep, SeriesId::Libre];

    pub fn schema(self) -> &'static SeriesSchema {
        match self {
            SeriesId::DivisaBillete => &DIVISA_BILLETE,
            SeriesId::Mep => &MEP,
            SeriesId::Libre => &LIBRE,
            SeriesId::Uva => &UVA,
            SeriesId::Ipc => &IPC,
            SeriesId::Cac => &CAC,
            SeriesId::Smvym => &SMVYM,
            SeriesId::PizarraRosario => &PIZARRA_ROSARIO,
        }
    }

    pub fn sheet_name(self) -> &'static str {
        self.schema().sheet
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sheet_name())
    }
}

/// Failure taxonomy surfaced in run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Connectivity,
    Parse,
    ResourceLocked,
    ResourceMissing,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Connectivity => "connectivity failure",
            FailureKind::Parse => "parse failure",
            FailureKind::ResourceLocked => "destination locked",
            FailureKind::ResourceMissing => "destination missing",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn day_first_and_year_first_policies_disagree_on_ambiguous_dates() {
        assert_eq!(normalize_date("01/03/2024", DatePolicy::DayFirst).unwrap(), ymd(2024, 3, 1));
        assert_eq!(normalize_date("01/03/2024", DatePolicy::YearFirst).unwrap(), ymd(2024, 1, 3));
        assert_eq!(normalize_date("05-03-2024", DatePolicy::DayFirst).unwrap(), ymd(2024, 3, 5));
    }

    #[test]
    fn canonical_and_iso_values_are_idempotent() {
        for policy in [DatePolicy::DayFirst, DatePolicy::YearFirst] {
            assert_eq!(normalize_date("2024-03-01", policy).unwrap(), ymd(2024, 3, 1));
            assert_eq!(
                normalize_date("2024-03-01T00:00:00.000Z", policy).unwrap(),
                ymd(2024, 3, 1)
            );
            assert_eq!(normalize_date("2024-03-01 00:00:00", policy).unwrap(), ymd(2024, 3, 1));
        }
    }

    #[test]
    fn garbage_dates_are_rejected() {
        assert_eq!(normalize_date("  ", DatePolicy::DayFirst), Err(DateParseError::Empty));
        assert!(matches!(
            normalize_date("Total", DatePolicy::DayFirst),
            Err(DateParseError::Unrecognized(_))
        ));
        assert!(matches!(
            normalize_date("31/02/2024", DatePolicy::DayFirst),
            Err(DateParseError::OutOfRange(_))
        ));
        assert!(normalize_date("01/03/24", DatePolicy::DayFirst).is_err());
    }

    #[test]
    fn decimal_comma_and_point_are_both_accepted() {
        assert_eq!(parse_decimal("1234,5"), Some(1234.5));
        assert_eq!(parse_decimal("1234.5"), Some(1234.5));
        assert_eq!(parse_decimal("1.234,50"), Some(1234.5));
        assert_eq!(parse_decimal("1,234.50"), Some(1234.5));
        assert_eq!(parse_decimal("1.234.567"), Some(1234567.0));
        assert_eq!(parse_decimal(" 850 "), Some(850.0));
        assert_eq!(parse_decimal("-"), None);
        assert_eq!(parse_decimal(""), None);
    }

    #[test]
    fn merge_keeps_the_later_record_and_sorts() {
        let existing = Series::from_records(
            "MEP",
            "fecha",
            vec![
                SeriesRecord::dated(ymd(2024, 3, 2)).with("DOLAR MEP", CellValue::Number(2.0)),
                SeriesRecord::dated(ymd(2024, 3, 1)).with("DOLAR MEP", CellValue::Number(1.0)),
            ],
        );
        let merged = existing.merge(vec![
            SeriesRecord::dated(ymd(2024, 3, 2)).with("DOLAR MEP", CellValue::Number(20.0)),
            SeriesRecord::dated(ymd(2024, 3, 3)).with("DOLAR MEP", CellValue::Number(3.0)),
        ]);

        let values: Vec<_> = merged.records.iter().map(|r| r.number("DOLAR MEP")).collect();
        assert_eq!(values, vec![Some(1.0), Some(20.0), Some(3.0)]);
        assert_eq!(merged.cursor(), Some(ymd(2024, 3, 3)));
    }

    #[test]
    fn board_quote_resolution_prefers_actual_price() {
        assert_eq!(
            BoardQuote::resolve(Some(0.0), Some(7.5)),
            BoardQuote { value: 7.5, estimated: true }
        );
        assert_eq!(
            BoardQuote::resolve(Some(10.0), Some(7.5)),
            BoardQuote { value: 10.0, estimated: false }
        );
        assert_eq!(
            BoardQuote::resolve(Some(0.0), Some(0.0)),
            BoardQuote { value: 0.0, estimated: false }
        );
        assert_eq!(BoardQuote::resolve(None, None), BoardQuote::default());
    }

    #[test]
    fn board_record_survives_row_flattening() {
        let mut record = BoardRecord::new(ymd(2024, 1, 2));
        record.quotes.insert(Commodity::Soja, BoardQuote { value: 300.0, estimated: true });
        let row = record.to_series_record();
        assert_eq!(row.get("Soja_is_est"), &CellValue::Flag(true));
        assert_eq!(row.number("Trigo"), Some(0.0));
        let back = BoardRecord::from_series_record(&row).unwrap();
        assert_eq!(back.quote(Commodity::Soja), record.quote(Commodity::Soja));
    }

    #[test]
    fn period_keys_are_normalized_when_date_like() {
        let schema = SeriesId::Cac.schema();
        assert_eq!(
            schema.parse_key("2024-02-01T00:00:00").unwrap(),
            SeriesKey::Period("2024-02-01".to_string())
        );
        assert_eq!(
            schema.parse_key("2024-Q1").unwrap(),
            SeriesKey::Period("2024-Q1".to_string())
        );
        assert_eq!(
            SeriesId::PizarraRosario.schema().columns().len(),
            1 + Commodity::ALL.len() * 2
        );
    }
}
