//! Credit report normalizer: turns one raw report document into flat
//! tradeline rows. Everything here is pure; "now" is always passed in.

use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::warn;
use tradeline_core::{EnquiryCounts, TradelineRow};

pub const CRATE_NAME: &str = "tradeline-normalize";

pub const NOISE_CHARS: [char; 2] = ['*', ','];

pub const ENQUIRY_LENDER_KEYS: [&str; 3] = ["lender", "institution", "InstitutionName"];
pub const UNKNOWN_LENDER: &str = "Unknown";
pub const LENDER_NAME_KEYS: [&str; 1] = ["provider"];
pub const CREDIT_LINE_TYPE_KEYS: [&str; 2] = ["accountType", "product"];
pub const SANCTIONED_KEYS: [&str; 2] = ["sanctionedAmount", "totalSanctionAmt"];
pub const OUTSTANDING_KEYS: [&str; 2] = ["outstanding", "totalBalance"];

const CREDIT_ANALYSIS_ENQUIRY_LISTS: [&str; 3] = ["recent", "all", "previous"];
const SUMMARY_ENQUIRY_LISTS: [&str; 2] = ["recent", "all"];
const ENQUIRY_WINDOWS_DAYS: [i64; 4] = [30, 60, 90, 365];
const RECENT_DELINQUENCY_DAYS: i64 = 90;
const DATE_FORMAT: &str = "%Y-%m-%d";

const CURRENT_STATUS_CODES: [&str; 4] = ["STD", "STANDARD", "CURRENT", ""];
const DEFAULT_STATUS_CODES: [&str; 3] = ["SUB", "DBT", "LSS"];
const SPECIAL_MENTION_PREFIX: &str = "SMA";
const SETTLED_MARKER: &str = "SETTLED";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("report root is not a json object")]
    NotAnObject,
    #[error("report section `{0}` is not an object")]
    MalformedSection(&'static str),
    #[error("normalizer panicked: {0}")]
    Panicked(String),
}

pub fn strip_noise(text: &str) -> String {
    text.chars().filter(|c| !NOISE_CHARS.contains(c)).collect()
}

pub fn clean_money(value: Option<&JsonValue>) -> f64 {
    match value {
        Some(JsonValue::Number(n)) => n.as_f64().filter(|v| v.is_finite()).unwrap_or(0.0),
        Some(JsonValue::String(s)) => parse_money_text(s),
        _ => 0.0,
    }
}

pub fn parse_money_text(text: &str) -> f64 {
    let cleaned = strip_noise(text);
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned.eq_ignore_ascii_case("null") {
        return 0.0;
    }
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

pub fn clean_str(value: Option<&JsonValue>) -> Option<String> {
    let text = value.filter(|v| is_truthy(v)).and_then(scalar_text)?;
    let cleaned = strip_noise(&text);
    let cleaned = cleaned.trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}

pub fn first_present<'a>(record: &'a Map<String, JsonValue>, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter()
        .find_map(|key| record.get(*key).filter(|v| is_truthy(v)))
}

fn parse_date(value: Option<&JsonValue>) -> Option<NaiveDate> {
    value
        .and_then(JsonValue::as_str)
        .and_then(|s| NaiveDate::parse_from_str(s, DATE_FORMAT).ok())
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

fn list_items(value: Option<&JsonValue>) -> &[JsonValue] {
    value
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnquiryEvent {
    pub raw_date: String,
    pub date: Option<NaiveDate>,
    pub lender: String,
}

pub fn collect_enquiries(
    credit_analysis: Option<&Map<String, JsonValue>>,
    report_summary: Option<&Map<String, JsonValue>>,
) -> Vec<EnquiryEvent> {
    let mut raw: Vec<&JsonValue> = Vec::new();
    if let Some(section) = credit_analysis
        .and_then(|ca| ca.get("enquiries"))
        .and_then(JsonValue::as_object)
    {
        for list in CREDIT_ANALYSIS_ENQUIRY_LISTS {
            raw.extend(list_items(section.get(list)));
        }
    }
    if let Some(section) = report_summary
        .and_then(|rs| rs.get("enquiries"))
        .and_then(JsonValue::as_object)
    {
        for list in SUMMARY_ENQUIRY_LISTS {
            raw.extend(list_items(section.get(list)));
        }
    }

    let mut seen = HashSet::new();
    let mut events = Vec::new();
    for enquiry in raw.into_iter().filter_map(JsonValue::as_object) {
        let Some(raw_date) = enquiry
            .get("date")
            .filter(|v| is_truthy(v))
            .and_then(scalar_text)
        else {
            continue;
        };
        let lender = first_present(enquiry, &ENQUIRY_LENDER_KEYS)
            .and_then(scalar_text)
            .unwrap_or_else(|| UNKNOWN_LENDER.to_string());

        if seen.insert((raw_date.clone(), lender.clone())) {
            events.push(EnquiryEvent {
                date: NaiveDate::parse_from_str(&raw_date, DATE_FORMAT).ok(),
                raw_date,
                lender,
            });
        }
    }
    events
}

pub fn enquiries_within(events: &[EnquiryEvent], days: i64, now: NaiveDateTime) -> u32 {
    let cutoff = now - Duration::days(days);
    events
        .iter()
        .filter(|e| e.date.is_some_and(|d| midnight(d) >= cutoff))
        .count() as u32
}

pub fn count_enquiries(events: &[EnquiryEvent], now: NaiveDateTime) -> EnquiryCounts {
    let [d30, d60, d90, d365] = ENQUIRY_WINDOWS_DAYS;
    EnquiryCounts {
        within_30_days: enquiries_within(events, d30, now),
        within_60_days: enquiries_within(events, d60, now),
        within_90_days: enquiries_within(events, d90, now),
        within_1_year: enquiries_within(events, d365, now),
    }
}

/// Months still to run: total tenure minus whole calendar months since the
/// open date, floored at 0. Unparsable tenure or open date gives 0.
pub fn pending_tenure(
    total_tenure: Option<&JsonValue>,
    open_date: Option<&JsonValue>,
    now: NaiveDateTime,
) -> u32 {
    let Some(total_months) = total_tenure.and_then(parse_tenure_months) else {
        return 0;
    };
    let Some(opened) = parse_date(open_date) else {
        return 0;
    };
    let months_elapsed = i64::from(now.year() - opened.year()) * 12
        + (i64::from(now.month()) - i64::from(opened.month()));
    total_months
        .saturating_sub(months_elapsed)
        .clamp(0, i64::from(u32::MAX)) as u32
}

fn parse_tenure_months(value: &JsonValue) -> Option<i64> {
    let months = match value {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => {
            let cleaned = strip_noise(s);
            let cleaned = cleaned.trim();
            if cleaned.is_empty() || cleaned.eq_ignore_ascii_case("null") {
                return None;
            }
            cleaned.parse::<f64>().ok()?
        }
        _ => return None,
    };
    months.is_finite().then(|| months.trunc() as i64)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentHistoryEntry {
    pub month: NaiveDate,
    pub label: String,
    pub status: String,
}

/// Parses a `MM-YY` month label. Two-digit years 00-68 are 20xx, 69-99 19xx.
pub fn parse_history_month(label: &str) -> Option<NaiveDate> {
    let (month, year) = label.split_once('-')?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(month) || month.len() > 2 || !digits(year) || year.len() != 2 {
        return None;
    }
    let month: u32 = month.parse().ok()?;
    let yy: i32 = year.parse().ok()?;
    let year = if yy <= 68 { 2000 + yy } else { 1900 + yy };
    NaiveDate::from_ymd_opt(year, month, 1)
}

pub fn parse_payment_history(value: Option<&JsonValue>) -> Vec<PaymentHistoryEntry> {
    list_items(value)
        .iter()
        .filter_map(JsonValue::as_object)
        .filter_map(|entry| {
            let label = entry.get("month")?.as_str()?;
            let month = parse_history_month(label)?;
            // an explicit null is an unknown code, only an absent key is blank
            let status = match entry.get("status") {
                None => String::new(),
                Some(JsonValue::Null) => "null".to_string(),
                Some(v) => scalar_text(v).unwrap_or_default(),
            };
            Some(PaymentHistoryEntry {
                month,
                label: label.to_string(),
                status,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSeverity {
    pub dpd: u32,
    pub delinquent: bool,
}

pub fn classify_status(status: &str) -> StatusSeverity {
    let code = strip_noise(status).trim().to_uppercase();

    if !code.is_empty() && code.bytes().all(|b| b.is_ascii_digit()) {
        let dpd = code.parse::<u32>().unwrap_or(u32::MAX);
        return StatusSeverity {
            dpd,
            delinquent: dpd > 0,
        };
    }
    if CURRENT_STATUS_CODES.contains(&code.as_str()) {
        return StatusSeverity {
            dpd: 0,
            delinquent: false,
        };
    }
    let dpd = if DEFAULT_STATUS_CODES.contains(&code.as_str()) {
        90
    } else if code.starts_with(SPECIAL_MENTION_PREFIX) {
        30
    } else {
        1
    };
    StatusSeverity {
        dpd,
        delinquent: true,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DelinquencySummary {
    pub total: u32,
    pub months: Vec<String>,
    pub over_30: u32,
    pub over_60: u32,
    pub over_90: u32,
    pub recent_30: u32,
    pub recent_60: u32,
    pub recent_90: u32,
}

impl DelinquencySummary {
    pub fn months_joined(&self) -> String {
        self.months.join(",")
    }
}

pub fn delinquency_buckets(entries: &[PaymentHistoryEntry], now: NaiveDateTime) -> DelinquencySummary {
    let mut ordered: Vec<&PaymentHistoryEntry> = entries.iter().collect();
    ordered.sort_by(|a, b| b.month.cmp(&a.month));

    let recent_cutoff = now - Duration::days(RECENT_DELINQUENCY_DAYS);
    let mut summary = DelinquencySummary::default();

    for entry in ordered {
        let severity = classify_status(&entry.status);
        if !severity.delinquent {
            continue;
        }
        summary.total += 1;
        summary.months.push(entry.label.clone());

        let dpd = severity.dpd;
        summary.over_30 += u32::from(dpd >= 30);
        summary.over_60 += u32::from(dpd >= 60);
        summary.over_90 += u32::from(dpd >= 90);

        if midnight(entry.month) >= recent_cutoff {
            summary.recent_30 += u32::from(dpd >= 30);
            summary.recent_60 += u32::from(dpd >= 60);
            summary.recent_90 += u32::from(dpd >= 90);
        }
    }
    summary
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettlementFlags {
    pub within_30_days: bool,
    pub within_60_days: bool,
    pub within_90_days: bool,
}

pub fn settlement_recency(
    status: Option<&str>,
    close_date: Option<&JsonValue>,
    now: NaiveDateTime,
) -> SettlementFlags {
    let settled = status.is_some_and(|s| s.to_uppercase().contains(SETTLED_MARKER));
    if !settled {
        return SettlementFlags::default();
    }
    let Some(closed) = parse_date(close_date) else {
        return SettlementFlags::default();
    };
    let elapsed_days = (now - midnight(closed)).num_days();
    SettlementFlags {
        within_30_days: elapsed_days <= 30,
        within_60_days: elapsed_days <= 60,
        within_90_days: elapsed_days <= 90,
    }
}

pub fn collect_accounts(credit_analysis: &Map<String, JsonValue>) -> Vec<&Map<String, JsonValue>> {
    let mut items: Vec<&JsonValue> = Vec::new();
    items.extend(list_items(credit_analysis.get("creditCards")));

    match credit_analysis.get("loans") {
        Some(JsonValue::Object(groups)) => {
            for group in groups.values() {
                items.extend(list_items(Some(group)));
            }
        }
        Some(JsonValue::Array(loans)) => items.extend(loans),
        _ => {}
    }

    if let Some(others) = credit_analysis.get("others").and_then(JsonValue::as_object) {
        items.extend(list_items(others.get("overdraft")));
    }

    items.into_iter().filter_map(JsonValue::as_object).collect()
}

fn account_row(
    account: &Map<String, JsonValue>,
    pan: Option<String>,
    enquiries: EnquiryCounts,
    now: NaiveDateTime,
) -> TradelineRow {
    let delinquency = delinquency_buckets(&parse_payment_history(account.get("paymentHistory")), now);

    let total_tenure = account.get("repaymentTenure");
    let open_date = account.get("accountOpenDate");

    let sanctioned = clean_money(first_present(account, &SANCTIONED_KEYS));
    let outstanding = clean_money(first_present(account, &OUTSTANDING_KEYS));
    let paid_principal = match account.get("paidPrincipal") {
        Some(value) => clean_money(Some(value)),
        None => (sanctioned - outstanding).max(0.0),
    };

    let status = clean_str(account.get("accountStatus"));
    let settlement = settlement_recency(status.as_deref(), account.get("accountCloseDate"), now);
    let past_due = clean_money(account.get("accountPastDueAmount"));

    TradelineRow {
        pan,
        fi_name: first_present(account, &LENDER_NAME_KEYS).and_then(scalar_text),
        credit_line_type: first_present(account, &CREDIT_LINE_TYPE_KEYS).and_then(scalar_text),
        total_sanctioned_amount: Some(sanctioned),
        current_outstanding: Some(outstanding),
        status,
        paid_principal_amount: Some(paid_principal),
        emi: Some(clean_money(account.get("emi"))),
        total_tenure: clean_str(total_tenure),
        pending_tenure: Some(pending_tenure(total_tenure, open_date, now)),
        start_date: clean_str(open_date),
        balance: Some(outstanding),
        last_payment_date: clean_str(account.get("lastPaymentDate")),
        last_payment_amount: Some(clean_money(account.get("lastPaymentAmount"))),
        account_past_due_amount: Some(past_due),
        total_delinquencies: delinquency.total,
        delinquencies: Some(delinquency.months_joined()),
        delinquencies_30_days: delinquency.over_30,
        delinquencies_60_days: delinquency.over_60,
        delinquencies_90_days: delinquency.over_90,
        recent_missed_30_dpd: delinquency.recent_30,
        recent_missed_60_dpd: delinquency.recent_60,
        recent_missed_90_dpd: delinquency.recent_90,
        enq_30_days: enquiries.within_30_days,
        enq_60_days: enquiries.within_60_days,
        enq_90_days: enquiries.within_90_days,
        enq_1_year: enquiries.within_1_year,
        current_dpd: past_due,
        settled_last_30_days: u8::from(settlement.within_30_days),
        settled_last_60_days: u8::from(settlement.within_60_days),
        settled_last_90_days: u8::from(settlement.within_90_days),
    }
}

fn section<'a>(
    parent: Option<&'a Map<String, JsonValue>>,
    key: &'static str,
) -> Result<Option<&'a Map<String, JsonValue>>, NormalizeError> {
    match parent.and_then(|p| p.get(key)) {
        None => Ok(None),
        Some(JsonValue::Object(map)) => Ok(Some(map)),
        Some(_) => Err(NormalizeError::MalformedSection(key)),
    }
}

pub fn normalize_report(
    raw: &JsonValue,
    identifier: &str,
    now: NaiveDateTime,
) -> Result<Vec<TradelineRow>, NormalizeError> {
    let root = raw.as_object().ok_or(NormalizeError::NotAnObject)?;
    let data = match root.get("data") {
        None => None,
        Some(JsonValue::Object(map)) => Some(map),
        Some(_) => return Ok(Vec::new()),
    };
    let report_data = section(data, "reportData")?;
    let report_summary = section(report_data, "reportSummary")?;
    let personal_details = section(report_summary, "personalDetails")?;
    let credit_analysis = section(report_data, "creditAnalysis")?;

    let pan = if identifier.trim().is_empty() {
        personal_details
            .and_then(|pd| pd.get("pan"))
            .and_then(scalar_text)
    } else {
        Some(identifier.to_string())
    };

    let enquiries = count_enquiries(&collect_enquiries(credit_analysis, report_summary), now);

    let accounts = credit_analysis.map(collect_accounts).unwrap_or_default();
    if accounts.is_empty() {
        return Ok(vec![TradelineRow::placeholder(pan, enquiries)]);
    }

    Ok(accounts
        .into_iter()
        .map(|account| account_row(account, pan.clone(), enquiries, now))
        .collect())
}

/// [`normalize_report`] with panics converted into [`NormalizeError::Panicked`].
pub fn try_normalize(
    raw: &JsonValue,
    identifier: &str,
    now: NaiveDateTime,
) -> Result<Vec<TradelineRow>, NormalizeError> {
    panic::catch_unwind(AssertUnwindSafe(|| normalize_report(raw, identifier, now)))
        .unwrap_or_else(|payload| Err(NormalizeError::Panicked(panic_message(payload.as_ref()))))
}

pub fn normalize(raw: &JsonValue, identifier: &str, now: NaiveDateTime) -> Vec<TradelineRow> {
    try_normalize(raw, identifier, now).unwrap_or_else(|err| {
        warn!(identifier, error = %err, "report normalization failed");
        Vec::new()
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn history(entries: JsonValue) -> Vec<PaymentHistoryEntry> {
        parse_payment_history(Some(&entries))
    }

    fn report_with_accounts(accounts: JsonValue) -> JsonValue {
        json!({
            "data": {
                "reportData": {
                    "reportSummary": { "personalDetails": { "pan": "REPORT1234P" } },
                    "creditAnalysis": { "loans": { "personalLoans": accounts } }
                }
            }
        })
    }

    #[test]
    fn money_strips_noise_and_falls_back_to_zero() {
        assert_eq!(clean_money(Some(&json!("1,00,000*"))), 100000.0);
        assert_eq!(clean_money(Some(&json!(2500.5))), 2500.5);
        assert_eq!(clean_money(Some(&json!(" 42 "))), 42.0);
        assert_eq!(clean_money(Some(&json!(""))), 0.0);
        assert_eq!(clean_money(Some(&json!("NULL"))), 0.0);
        assert_eq!(clean_money(Some(&json!("abc"))), 0.0);
        assert_eq!(clean_money(Some(&JsonValue::Null)), 0.0);
        assert_eq!(clean_money(Some(&json!(true))), 0.0);
        assert_eq!(clean_money(None), 0.0);
    }

    #[test]
    fn money_parsing_ignores_injected_noise() {
        for clean in ["0", "12", "1500.75", "-20", "100000"] {
            let expected = parse_money_text(clean);
            for noisy in [
                format!("*{clean}*"),
                format!(" {clean} "),
                format!("**{clean},"),
                format!(",{clean} *"),
            ] {
                assert_eq!(parse_money_text(&noisy), expected, "{noisy}");
            }
        }
    }

    #[test]
    fn clean_str_maps_blank_to_none() {
        assert_eq!(clean_str(Some(&json!("  ACTIVE* "))), Some("ACTIVE".into()));
        assert_eq!(clean_str(Some(&json!(36))), Some("36".into()));
        assert_eq!(clean_str(Some(&json!(""))), None);
        assert_eq!(clean_str(Some(&json!("**"))), None);
        assert_eq!(clean_str(Some(&JsonValue::Null)), None);
        assert_eq!(clean_str(None), None);
    }

    #[test]
    fn fallback_keys_take_first_non_empty() {
        let account = json!({ "sanctionedAmount": "", "totalSanctionAmt": "5,000" });
        let map = account.as_object().unwrap();
        assert_eq!(clean_money(first_present(map, &SANCTIONED_KEYS)), 5000.0);

        let account = json!({ "sanctionedAmount": 0, "totalSanctionAmt": null });
        assert_eq!(first_present(account.as_object().unwrap(), &SANCTIONED_KEYS), None);
    }

    #[test]
    fn enquiries_deduplicate_across_sections_and_window() {
        let now = at(2024, 6, 30);
        let ca = json!({
            "enquiries": {
                "recent": [
                    { "date": "2024-06-10", "lender": "HDFC" },
                    { "date": "2024-05-15", "institution": "ICICI" }
                ],
                "all": [
                    { "date": "2024-06-10", "lender": "HDFC" },
                    { "date": "2024-04-20", "InstitutionName": "SBI" },
                    { "date": "2023-09-01" },
                    { "date": "31/12/2023", "lender": "AXIS" },
                    { "lender": "NO DATE" },
                    "garbage"
                ],
                "previous": null
            }
        });
        let rs = json!({
            "enquiries": {
                "recent": [{ "date": "2024-05-15", "institution": "ICICI" }],
                "all": [{ "date": "2022-01-01", "lender": "OLD" }]
            }
        });
        let events = collect_enquiries(ca.as_object(), rs.as_object());
        assert_eq!(events.len(), 6);
        assert!(events.iter().any(|e| e.lender == UNKNOWN_LENDER));
        assert!(events.iter().any(|e| e.lender == "AXIS" && e.date.is_none()));

        let counts = count_enquiries(&events, now);
        assert_eq!(
            counts,
            EnquiryCounts {
                within_30_days: 1,
                within_60_days: 2,
                within_90_days: 3,
                within_1_year: 4,
            }
        );
    }

    #[test]
    fn pending_tenure_counts_calendar_months() {
        let now = at(2024, 3, 28);
        assert_eq!(pending_tenure(Some(&json!("36")), Some(&json!("2023-03-01")), now), 24);
        assert_eq!(pending_tenure(Some(&json!(24.9)), Some(&json!("2024-01-31")), now), 22);
        assert_eq!(pending_tenure(Some(&json!("12*")), Some(&json!("2020-01-01")), now), 0);
        assert_eq!(pending_tenure(Some(&json!("abc")), Some(&json!("2023-03-01")), now), 0);
        assert_eq!(pending_tenure(Some(&json!("null")), Some(&json!("2023-03-01")), now), 0);
        assert_eq!(pending_tenure(Some(&json!("36")), None, now), 0);
        assert_eq!(pending_tenure(Some(&json!("36")), Some(&json!("03/01/2023")), now), 0);
        assert_eq!(pending_tenure(None, Some(&json!("2023-03-01")), now), 0);
    }

    #[test]
    fn history_months_use_two_digit_years() {
        assert_eq!(parse_history_month("01-24"), NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(parse_history_month("12-99"), NaiveDate::from_ymd_opt(1999, 12, 1));
        assert_eq!(parse_history_month("3-23"), NaiveDate::from_ymd_opt(2023, 3, 1));
        assert_eq!(parse_history_month("13-23"), None);
        assert_eq!(parse_history_month("2023-01"), None);
        assert_eq!(parse_history_month("Jan-24"), None);
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status("90"), StatusSeverity { dpd: 90, delinquent: true });
        assert_eq!(classify_status("000"), StatusSeverity { dpd: 0, delinquent: false });
        assert_eq!(classify_status("std"), StatusSeverity { dpd: 0, delinquent: false });
        assert_eq!(classify_status("CURRENT"), StatusSeverity { dpd: 0, delinquent: false });
        assert_eq!(classify_status(""), StatusSeverity { dpd: 0, delinquent: false });
        assert_eq!(classify_status("DBT*"), StatusSeverity { dpd: 90, delinquent: true });
        assert_eq!(classify_status("LSS"), StatusSeverity { dpd: 90, delinquent: true });
        assert_eq!(classify_status("SMA-1"), StatusSeverity { dpd: 30, delinquent: true });
        assert_eq!(classify_status("XXX"), StatusSeverity { dpd: 1, delinquent: true });
    }

    #[test]
    fn recent_ninety_day_delinquency_example() {
        let entries = history(json!([
            { "month": "01-24", "status": "90" },
            { "month": "12-23", "status": "STD" }
        ]));
        let summary = delinquency_buckets(&entries, at(2024, 1, 20));
        assert_eq!(summary.total, 1);
        assert_eq!((summary.over_30, summary.over_60, summary.over_90), (1, 1, 1));
        assert_eq!((summary.recent_30, summary.recent_60, summary.recent_90), (1, 1, 1));
        assert_eq!(summary.months_joined(), "01-24");
    }

    #[test]
    fn old_delinquencies_are_not_recent() {
        let entries = history(json!([
            { "month": "02-23", "status": "SMA" },
            { "month": "06-23", "status": "60" },
            { "month": "bad", "status": "90" },
            { "status": "90" },
            { "month": "05-24", "status": "45" },
            { "month": "04-24", "status": "X" }
        ]));
        let summary = delinquency_buckets(&entries, at(2024, 6, 15));
        assert_eq!(summary.total, 4);
        assert_eq!(summary.months, vec!["05-24", "04-24", "06-23", "02-23"]);
        assert_eq!((summary.over_30, summary.over_60, summary.over_90), (3, 1, 0));
        assert_eq!((summary.recent_30, summary.recent_60, summary.recent_90), (1, 0, 0));
    }

    #[test]
    fn null_status_counts_as_unknown_code() {
        let entries = history(json!([
            { "month": "05-24", "status": null },
            { "month": "04-24" }
        ]));
        let summary = delinquency_buckets(&entries, at(2024, 6, 15));
        assert_eq!(summary.total, 1);
        assert_eq!(summary.months, vec!["05-24"]);
        assert_eq!((summary.over_30, summary.recent_30), (0, 0));
    }

    #[test]
    fn huge_tenure_with_future_open_date_keeps_every_account() {
        let now = at(2024, 6, 15);
        assert_eq!(
            pending_tenure(Some(&json!("1e30")), Some(&json!("2030-01-01")), now),
            u32::MAX
        );

        let raw = report_with_accounts(json!([
            { "provider": "A", "repaymentTenure": "36", "accountOpenDate": "2024-01-01" },
            { "provider": "B", "repaymentTenure": "1e30", "accountOpenDate": "2030-01-01" }
        ]));
        let rows = try_normalize(&raw, "P1", now).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].pending_tenure, Some(31));
    }

    #[test]
    fn buckets_are_monotonic() {
        let statuses = ["0", "STD", "SMA", "SUB", "30", "59", "60", "89", "90", "120", "?"];
        let months = ["01-24", "12-23", "11-23", "06-23", "01-20"];
        let now = at(2024, 1, 15);
        for (i, _) in statuses.iter().enumerate() {
            let entries: Vec<JsonValue> = months
                .iter()
                .enumerate()
                .map(|(j, m)| json!({ "month": m, "status": statuses[(i + j * 3) % statuses.len()] }))
                .collect();
            let s = delinquency_buckets(&history(JsonValue::Array(entries)), now);
            assert!(s.over_90 <= s.over_60 && s.over_60 <= s.over_30 && s.over_30 <= s.total);
            assert!(s.recent_90 <= s.recent_60 && s.recent_60 <= s.recent_30);
            assert!(s.recent_30 <= s.over_30);
        }
    }

    #[test]
    fn settlement_forty_days_ago() {
        let now = at(2024, 3, 15);
        let closed = json!("2024-02-04");
        let flags = settlement_recency(Some("Settled"), Some(&closed), now);
        assert_eq!(
            flags,
            SettlementFlags {
                within_30_days: false,
                within_60_days: true,
                within_90_days: true,
            }
        );
        assert_eq!(
            settlement_recency(Some("Closed"), Some(&closed), now),
            SettlementFlags::default()
        );
        assert_eq!(
            settlement_recency(Some("WRITTEN OFF AND SETTLED"), Some(&json!("bad")), now),
            SettlementFlags::default()
        );
        assert_eq!(settlement_recency(Some("settled"), None, now), SettlementFlags::default());
    }

    #[test]
    fn accounts_flatten_every_grouping() {
        let ca = json!({
            "creditCards": [{ "provider": "A" }, 7],
            "loans": {
                "homeLoans": [{ "provider": "B" }],
                "autoLoans": [{ "provider": "C" }, { "provider": "D" }],
                "note": "ignored"
            },
            "others": { "overdraft": [{ "provider": "E" }] }
        });
        assert_eq!(collect_accounts(ca.as_object().unwrap()).len(), 5);

        let ca = json!({ "loans": [{ "provider": "X" }, null] });
        assert_eq!(collect_accounts(ca.as_object().unwrap()).len(), 1);
    }

    #[test]
    fn money_example_row() {
        let report = report_with_accounts(json!([{
            "provider": "HDFC BANK",
            "accountType": "Personal Loan",
            "sanctionedAmount": "1,00,000*",
            "outstanding": null,
            "accountStatus": "ACTIVE"
        }]));
        let rows = normalize_report(&report, "ABCDE1234F", at(2024, 1, 10)).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.pan.as_deref(), Some("ABCDE1234F"));
        assert_eq!(row.fi_name.as_deref(), Some("HDFC BANK"));
        assert_eq!(row.total_sanctioned_amount, Some(100000.0));
        assert_eq!(row.current_outstanding, Some(0.0));
        assert_eq!(row.paid_principal_amount, Some(100000.0));
        assert_eq!(row.balance, Some(0.0));
        assert_eq!(row.delinquencies.as_deref(), Some(""));
    }

    #[test]
    fn explicit_paid_principal_wins_even_when_null() {
        let report = report_with_accounts(json!([
            { "sanctionedAmount": 500, "outstanding": 100, "paidPrincipal": "350" },
            { "sanctionedAmount": 500, "outstanding": 100, "paidPrincipal": null },
            { "sanctionedAmount": 100, "totalBalance": "250" }
        ]));
        let rows = normalize_report(&report, "ABCDE1234F", at(2024, 1, 10)).unwrap();
        let paid: Vec<_> = rows.iter().map(|r| r.paid_principal_amount).collect();
        assert_eq!(paid, vec![Some(350.0), Some(0.0), Some(0.0)]);
    }

    #[test]
    fn full_account_row() {
        let now = at(2024, 3, 15);
        let report = report_with_accounts(json!([{
            "provider": "ICICI",
            "product": "Credit Card",
            "sanctionedAmount": 50000,
            "outstanding": "12,500",
            "emi": "2,000*",
            "repaymentTenure": "24",
            "accountOpenDate": "2023-03-10",
            "lastPaymentDate": "2024-03-01",
            "lastPaymentAmount": "2000",
            "accountPastDueAmount": "1500",
            "accountStatus": "Settled*",
            "accountCloseDate": "2024-02-04",
            "paymentHistory": [
                { "month": "02-24", "status": "SUB" },
                { "month": "01-24", "status": "30" },
                { "month": "12-23", "status": "STD" }
            ]
        }]));
        let row = normalize_report(&report, "ABCDE1234F", now).unwrap().remove(0);
        assert_eq!(row.credit_line_type.as_deref(), Some("Credit Card"));
        assert_eq!(row.status.as_deref(), Some("Settled"));
        assert_eq!(row.emi, Some(2000.0));
        assert_eq!(row.total_tenure.as_deref(), Some("24"));
        assert_eq!(row.pending_tenure, Some(12));
        assert_eq!(row.start_date.as_deref(), Some("2023-03-10"));
        assert_eq!(row.paid_principal_amount, Some(37500.0));
        assert_eq!(row.current_dpd, 1500.0);
        assert_eq!(row.total_delinquencies, 2);
        assert_eq!(row.delinquencies.as_deref(), Some("02-24,01-24"));
        assert_eq!(
            (row.delinquencies_30_days, row.delinquencies_60_days, row.delinquencies_90_days),
            (2, 1, 1)
        );
        assert_eq!(
            (row.recent_missed_30_dpd, row.recent_missed_60_dpd, row.recent_missed_90_dpd),
            (2, 1, 1)
        );
        assert_eq!(
            (row.settled_last_30_days, row.settled_last_60_days, row.settled_last_90_days),
            (0, 1, 1)
        );
    }

    #[test]
    fn report_without_accounts_yields_placeholder() {
        let report = json!({
            "data": {
                "reportData": {
                    "creditAnalysis": {
                        "creditCards": ["not-an-account"],
                        "enquiries": { "recent": [{ "date": "2024-01-05", "lender": "HDFC" }] }
                    }
                }
            }
        });
        let rows = normalize_report(&report, "ABCDE1234F", at(2024, 1, 20)).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.pan.as_deref(), Some("ABCDE1234F"));
        assert_eq!((row.enq_30_days, row.enq_1_year), (1, 1));
        assert_eq!(row.total_delinquencies, 0);
        assert_eq!(row.settled_last_90_days, 0);
        assert_eq!(row.current_dpd, 0.0);
        assert!(row.fi_name.is_none());
        assert!(row.delinquencies.is_none());
    }

    #[test]
    fn empty_identifier_falls_back_to_report_pan() {
        let report = report_with_accounts(json!([]));
        let rows = normalize_report(&report, "", at(2024, 1, 20)).unwrap();
        assert_eq!(rows[0].pan.as_deref(), Some("REPORT1234P"));
    }

    #[test]
    fn structural_faults_are_errors_not_panics() {
        let now = at(2024, 1, 20);
        assert!(matches!(
            try_normalize(&json!([1, 2]), "A", now),
            Err(NormalizeError::NotAnObject)
        ));
        assert!(matches!(
            try_normalize(&json!({ "data": { "reportData": null } }), "A", now),
            Err(NormalizeError::MalformedSection("reportData"))
        ));
        assert!(matches!(
            try_normalize(
                &json!({ "data": { "reportData": { "creditAnalysis": [] } } }),
                "A",
                now
            ),
            Err(NormalizeError::MalformedSection("creditAnalysis"))
        ));
        assert!(normalize(&json!("text"), "A", now).is_empty());
        assert!(normalize(&json!({ "data": "x" }), "A", now).is_empty());
    }

    #[test]
    fn missing_data_still_yields_placeholder() {
        let rows = normalize(&json!({}), "ABCDE1234F", at(2024, 1, 20));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].enq_1_year, 0);
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");
    }
}
