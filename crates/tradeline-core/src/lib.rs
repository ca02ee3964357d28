//! Core data model for the tradeline pipeline: source records, tasks, the
//! fixed 31-column output row and the shared progress/clock seams.

use std::fmt;

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tradeline-core";

/// Canonical output column order. Every export uses exactly this order.
pub const OUTPUT_COLUMNS: [&str; 31] = [
    "pan",
    "fiName",
    "creditLineType",
    "totalSanctionedAmount",
    "currentOutstanding",
    "status",
    "paidPrincipalAmount",
    "EMI",
    "totalTenure",
    "pendingTenure",
    "startDate",
    "Balance",
    "lastPaymentDate",
    "lastPaymentAmount",
    "accountPastDueAmount",
    "totalDelinquencies",
    "delinquencies",
    "delinquencies30Days",
    "delinquencies60Days",
    "delinquencies90Days",
    "Recent_Missed_30DPD",
    "Recent_Missed_60DPD",
    "Recent_Missed_90DPD",
    "Enq_30Days",
    "Enq_60Days",
    "Enq_90Days",
    "Enq_1Year",
    "currentDpd",
    "settledLast30Days",
    "settledLast60Days",
    "settledLast90Days",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Float,
    Integer,
}

pub const COLUMN_KINDS: [ColumnKind; 31] = {
    use ColumnKind::{Float, Integer, Text};
    [
        Text, Text, Text, Float, Float, Text, Float, Float, Text, Integer, Text, Float, Text,
        Float, Float, Integer, Text, Integer, Integer, Integer, Integer, Integer, Integer,
        Integer, Integer, Integer, Integer, Float, Integer, Integer, Integer,
    ]
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub identifier: String,
    pub report_reference: Option<String>,
}

impl SourceRecord {
    pub fn new(identifier: impl Into<String>, report_reference: Option<&str>) -> Self {
        Self {
            identifier: identifier.into(),
            report_reference: report_reference.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Task {
    pub identifier: String,
    pub report_reference: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnquiryCounts {
    pub within_30_days: u32,
    pub within_60_days: u32,
    pub within_90_days: u32,
    pub within_1_year: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradelineRow {
    pub pan: Option<String>,
    #[serde(rename = "fiName")]
    pub fi_name: Option<String>,
    #[serde(rename = "creditLineType")]
    pub credit_line_type: Option<String>,
    #[serde(rename = "totalSanctionedAmount")]
    pub total_sanctioned_amount: Option<f64>,
    #[serde(rename = "currentOutstanding")]
    pub current_outstanding: Option<f64>,
    pub status: Option<String>,
    #[serde(rename = "paidPrincipalAmount")]
    pub paid_principal_amount: Option<f64>,
    #[serde(rename = "EMI")]
    pub emi: Option<f64>,
    #[serde(rename = "totalTenure")]
    pub total_tenure: Option<String>,
    #[serde(rename = "pendingTenure")]
    pub pending_tenure: Option<u32>,
    #[serde(rename = "startDate")]
    pub start_date: Option<String>,
    #[serde(rename = "Balance")]
    pub balance: Option<f64>,
    #[serde(rename = "lastPaymentDate")]
    pub last_payment_date: Option<String>,
    #[serde(rename = "lastPaymentAmount")]
    pub last_payment_amount: Option<f64>,
    #[serde(rename = "accountPastDueAmount")]
    pub account_past_due_amount: Option<f64>,
    #[serde(rename = "totalDelinquencies")]
    pub total_delinquencies: u32,
    pub delinquencies: Option<String>,
    #[serde(rename = "delinquencies30Days")]
    pub delinquencies_30_days: u32,
    #[serde(rename = "delinquencies60Days")]
    pub delinquencies_60_days: u32,
    #[serde(rename = "delinquencies90Days")]
    pub delinquencies_90_days: u32,
    #[serde(rename = "Recent_Missed_30DPD")]
    pub recent_missed_30_dpd: u32,
    #[serde(rename = "Recent_Missed_60DPD")]
    pub recent_missed_60_dpd: u32,
    #[serde(rename = "Recent_Missed_90DPD")]
    pub recent_missed_90_dpd: u32,
    #[serde(rename = "Enq_30Days")]
    pub enq_30_days: u32,
    #[serde(rename = "Enq_60Days")]
    pub enq_60_days: u32,
    #[serde(rename = "Enq_90Days")]
    pub enq_90_days: u32,
    #[serde(rename = "Enq_1Year")]
    pub enq_1_year: u32,
    #[serde(rename = "currentDpd")]
    pub current_dpd: f64,
    #[serde(rename = "settledLast30Days")]
    pub settled_last_30_days: u8,
    #[serde(rename = "settledLast60Days")]
    pub settled_last_60_days: u8,
    #[serde(rename = "settledLast90Days")]
    pub settled_last_90_days: u8,
}

impl TradelineRow {
    /// Row emitted for a report without any recognized account: identifier and
    /// enquiry counts set, every delinquency/settlement counter zero, the
    /// account columns null.
    pub fn placeholder(pan: Option<String>, enquiries: EnquiryCounts) -> Self {
        Self {
            pan,
            fi_name: None,
            credit_line_type: None,
            total_sanctioned_amount: None,
            current_outstanding: None,
            status: None,
            paid_principal_amount: None,
            emi: None,
            total_tenure: None,
            pending_tenure: None,
            start_date: None,
            balance: None,
            last_payment_date: None,
            last_payment_amount: None,
            account_past_due_amount: None,
            total_delinquencies: 0,
            delinquencies: None,
            delinquencies_30_days: 0,
            delinquencies_60_days: 0,
            delinquencies_90_days: 0,
            recent_missed_30_dpd: 0,
            recent_missed_60_dpd: 0,
            recent_missed_90_dpd: 0,
            enq_30_days: enquiries.within_30_days,
            enq_60_days: enquiries.within_60_days,
            enq_90_days: enquiries.within_90_days,
            enq_1_year: enquiries.within_1_year,
            current_dpd: 0.0,
            settled_last_30_days: 0,
            settled_last_60_days: 0,
            settled_last_90_days: 0,
        }
    }

    pub fn cells(&self) -> [Cell; 31] {
        [
            Cell::text(&self.pan),
            Cell::text(&self.fi_name),
            Cell::text(&self.credit_line_type),
            Cell::float(self.total_sanctioned_amount),
            Cell::float(self.current_outstanding),
            Cell::text(&self.status),
            Cell::float(self.paid_principal_amount),
            Cell::float(self.emi),
            Cell::text(&self.total_tenure),
            Cell::integer(self.pending_tenure),
            Cell::text(&self.start_date),
            Cell::float(self.balance),
            Cell::text(&self.last_payment_date),
            Cell::float(self.last_payment_amount),
            Cell::float(self.account_past_due_amount),
            Cell::Integer(self.total_delinquencies.into()),
            Cell::text(&self.delinquencies),
            Cell::Integer(self.delinquencies_30_days.into()),
            Cell::Integer(self.delinquencies_60_days.into()),
            Cell::Integer(self.delinquencies_90_days.into()),
            Cell::Integer(self.recent_missed_30_dpd.into()),
            Cell::Integer(self.recent_missed_60_dpd.into()),
            Cell::Integer(self.recent_missed_90_dpd.into()),
            Cell::Integer(self.enq_30_days.into()),
            Cell::Integer(self.enq_60_days.into()),
            Cell::Integer(self.enq_90_days.into()),
            Cell::Integer(self.enq_1_year.into()),
            Cell::Float(self.current_dpd),
            Cell::Integer(self.settled_last_30_days.into()),
            Cell::Integer(self.settled_last_60_days.into()),
            Cell::Integer(self.settled_last_90_days.into()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Text(String),
    Float(f64),
    Integer(i64),
}

impl Cell {
    fn text(value: &Option<String>) -> Self {
        value.clone().map_or(Cell::Null, Cell::Text)
    }

    fn float(value: Option<f64>) -> Self {
        value.map_or(Cell::Null, Cell::Float)
    }

    fn integer(value: Option<u32>) -> Self {
        value.map_or(Cell::Null, |v| Cell::Integer(v.into()))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

impl fmt::Display for Cell {
    /// Text rendering used by delimited exports. Whole floats keep one decimal
    /// place so money columns read as floats (`100000.0`).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => Ok(()),
            Cell::Text(s) => f.write_str(s),
            Cell::Integer(v) => write!(f, "{v}"),
            Cell::Float(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 => {
                write!(f, "{v:.1}")
            }
            Cell::Float(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutputTable {
    rows: Vec<TradelineRow>,
}

impl OutputTable {
    pub fn new(rows: Vec<TradelineRow>) -> Self {
        Self { rows }
    }

    pub fn columns(&self) -> &'static [&'static str; 31] {
        &OUTPUT_COLUMNS
    }

    pub fn rows(&self) -> &[TradelineRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<TradelineRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn cell_rows(&self) -> impl Iterator<Item = [Cell; 31]> + '_ {
        self.rows.iter().map(TradelineRow::cells)
    }
}

/// Progress notification: `total == 0` means the total is not known yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub completed: usize,
    pub total: usize,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(completed: usize, total: usize, message: impl Into<String>) -> Self {
        Self {
            completed,
            total,
            message: message.into(),
        }
    }

    pub fn indeterminate(message: impl Into<String>) -> Self {
        Self::new(0, 0, message)
    }

    pub fn fraction(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some((self.completed as f64 / self.total as f64).min(1.0))
    }
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn report(&self, event: ProgressEvent) {
        self(event)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_kinds_align_with_columns() {
        assert_eq!(OUTPUT_COLUMNS.len(), COLUMN_KINDS.len());
        assert_eq!(COLUMN_KINDS[0], ColumnKind::Text);
        assert_eq!(COLUMN_KINDS[9], ColumnKind::Integer);
        assert_eq!(COLUMN_KINDS[27], ColumnKind::Float);
    }

    #[test]
    fn placeholder_cells_follow_schema() {
        let row = TradelineRow::placeholder(
            Some("ABCDE1234F".into()),
            EnquiryCounts {
                within_30_days: 1,
                within_60_days: 2,
                within_90_days: 2,
                within_1_year: 5,
            },
        );
        let cells = row.cells();
        assert_eq!(cells[0], Cell::Text("ABCDE1234F".into()));
        assert!(cells[1].is_null());
        assert!(cells[16].is_null());
        assert_eq!(cells[15], Cell::Integer(0));
        assert_eq!(cells[23], Cell::Integer(1));
        assert_eq!(cells[26], Cell::Integer(5));
        assert_eq!(cells[27], Cell::Float(0.0));
        assert_eq!(cells[30], Cell::Integer(0));

        for (cell, kind) in cells.iter().zip(COLUMN_KINDS) {
            match cell {
                Cell::Null => {}
                Cell::Text(_) => assert_eq!(kind, ColumnKind::Text),
                Cell::Float(_) => assert_eq!(kind, ColumnKind::Float),
                Cell::Integer(_) => assert_eq!(kind, ColumnKind::Integer),
            }
        }
    }

    #[test]
    fn cell_display_keeps_float_shape() {
        assert_eq!(Cell::Float(100000.0).to_string(), "100000.0");
        assert_eq!(Cell::Float(12.5).to_string(), "12.5");
        assert_eq!(Cell::Integer(3).to_string(), "3");
        assert_eq!(Cell::Null.to_string(), "");
    }

    #[test]
    fn indeterminate_progress_has_no_fraction() {
        assert_eq!(ProgressEvent::indeterminate("Initializing").fraction(), None);
        assert_eq!(ProgressEvent::new(5, 10, "x").fraction(), Some(0.5));
        assert_eq!(ProgressEvent::new(12, 10, "x").fraction(), Some(1.0));
    }

    #[test]
    fn closures_are_progress_sinks() {
        let seen = std::sync::Mutex::new(Vec::new());
        let sink = |event: ProgressEvent| seen.lock().unwrap().push(event.completed);
        sink.report(ProgressEvent::new(1, 2, "a"));
        sink.report(ProgressEvent::new(2, 2, "b"));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }
}
