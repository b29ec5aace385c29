//! Raw row normalization: header folding, type coercion and status flags.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use super::Record;

/// Canonical fields a source column can map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    TransactionId,
    Timestamp,
    Amount,
    Status,
    PaymentMode,
    MerchantId,
    Gateway,
    Bank,
    CardType,
}

/// Folded header spellings for each canonical field.
const ALIASES: &[(Field, &[&str])] = &[
    (
        Field::TransactionId,
        &["transactionid", "txnid", "txid", "id", "orderid", "paymentid"],
    ),
    (
        Field::Timestamp,
        &[
            "timestamp",
            "transactiontime",
            "txtime",
            "txntime",
            "createdat",
            "createdon",
            "datetime",
            "transactiondate",
            "txdate",
            "txndate",
            "date",
            "time",
        ],
    ),
    (
        Field::Amount,
        &["amount", "txamount", "txnamount", "transactionamount", "amt", "value"],
    ),
    (
        Field::Status,
        &[
            "status",
            "txstatus",
            "txnstatus",
            "transactionstatus",
            "paymentstatus",
            "state",
        ],
    ),
    (
        Field::PaymentMode,
        &["paymentmode", "mode", "paymentmethod", "method", "pm", "instrument"],
    ),
    (
        Field::MerchantId,
        &["merchantid", "merchant", "mid", "merchantname"],
    ),
    (
        Field::Gateway,
        &["gateway", "pg", "paymentgateway", "processinggateway", "gatewayname"],
    ),
    (Field::Bank, &["bank", "bankname", "issuer", "issuingbank"]),
    (
        Field::CardType,
        &["cardtype", "card", "cardnetwork", "network", "cardscheme"],
    ),
];

/// Fold a header for alias lookup: lowercase, alphanumerics only.
///
/// `"Tx Status"`, `"transaction_status"` and `"TX-STATUS"` all fold to a
/// key that resolves to [`Field::Status`].
pub fn fold_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn lookup_field(folded: &str) -> Option<Field> {
    ALIASES
        .iter()
        .find(|(_, names)| names.contains(&folded))
        .map(|(field, _)| *field)
}

/// Positions of canonical fields within a source header row.
#[derive(Debug, Clone, Default)]
pub struct ColumnMap {
    positions: HashMap<Field, usize>,
}

impl ColumnMap {
    /// Resolve a header row. The first column that maps to a field wins.
    pub fn resolve<'a>(headers: impl IntoIterator<Item = &'a str>) -> Self {
        let mut positions = HashMap::new();
        for (idx, header) in headers.into_iter().enumerate() {
            if let Some(field) = lookup_field(&fold_header(header)) {
                positions.entry(field).or_insert(idx);
            }
        }
        Self { positions }
    }

    pub fn position(&self, field: Field) -> Option<usize> {
        self.positions.get(&field).copied()
    }

    fn cell<'c>(&self, cells: &[&'c str], field: Field) -> &'c str {
        self.position(field)
            .and_then(|idx| cells.get(idx).copied())
            .map(str::trim)
            .unwrap_or("")
    }

    /// Whether every row would fail for lack of a timestamp column.
    pub fn has_timestamp(&self) -> bool {
        self.positions.contains_key(&Field::Timestamp)
    }

    /// Normalize one raw row into a [`Record`].
    pub fn normalize(&self, cells: &[&str]) -> Result<Record, RowError> {
        let cell = |field: Field| self.cell(cells, field);

        let raw_ts = cell(Field::Timestamp);
        let timestamp_ms =
            parse_timestamp_ms(raw_ts).ok_or_else(|| RowError::Timestamp(raw_ts.to_string()))?;
        let date = DateTime::from_timestamp_millis(timestamp_ms)
            .ok_or_else(|| RowError::Timestamp(raw_ts.to_string()))?
            .format("%Y-%m-%d")
            .to_string();

        let raw_amount = cell(Field::Amount);
        let amount =
            parse_amount(raw_amount).ok_or_else(|| RowError::Amount(raw_amount.to_string()))?;

        let status = cell(Field::Status).to_string();
        let flags = derive_status(&status);
        let transaction_id = Some(cell(Field::TransactionId))
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Ok(Record {
            transaction_id,
            timestamp_ms,
            date,
            amount,
            payment_mode: cell(Field::PaymentMode).to_string(),
            merchant_id: cell(Field::MerchantId).to_string(),
            gateway: cell(Field::Gateway).to_string(),
            bank: cell(Field::Bank).to_string(),
            card_type: cell(Field::CardType).to_string(),
            status,
            is_success: flags.success,
            is_failed: flags.failed,
            is_user_dropped: flags.user_dropped,
        })
    }
}

/// Why a row could not be normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    Timestamp(String),
    Amount(String),
}

/// Derived status flags. At most one is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags {
    pub success: bool,
    pub failed: bool,
    pub user_dropped: bool,
}

const SUCCESS_STATUSES: &[&str] = &[
    "success",
    "successful",
    "succeeded",
    "captured",
    "completed",
    "charged",
    "paid",
];

const USER_DROPPED_STATUSES: &[&str] = &[
    "userdropped",
    "dropped",
    "abandoned",
    "cancelled",
    "canceled",
    "usercancelled",
    "timeout",
    "expired",
];

const FAILED_STATUSES: &[&str] = &["failed", "failure", "declined", "error", "rejected", "bounced"];

/// Derive the success / failed / user-dropped flags from a raw status.
pub fn derive_status(status: &str) -> StatusFlags {
    let folded = fold_header(status);
    let folded = folded.as_str();
    StatusFlags {
        success: SUCCESS_STATUSES.contains(&folded),
        failed: FAILED_STATUSES.contains(&folded),
        user_dropped: USER_DROPPED_STATUSES.contains(&folded),
    }
}

/// Currency markers stripped from either end of an amount.
const CURRENCY_MARKERS: &[&str] = &[
    "rs.", "rs", "inr", "usd", "eur", "\u{20b9}", "$", "\u{20ac}", "\u{a3}",
];

/// Parse an amount, tolerating currency symbols and thousands separators.
///
/// Empty cells are zero. Returns `None` for anything else that is not a number.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let mut cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',' && *c != '_')
        .collect::<String>()
        .to_lowercase();
    if cleaned.is_empty() {
        return Some(0.0);
    }

    for marker in CURRENCY_MARKERS {
        if let Some(rest) = cleaned.strip_prefix(marker) {
            cleaned = rest.to_string();
            break;
        }
    }
    for marker in CURRENCY_MARKERS {
        if let Some(rest) = cleaned.strip_suffix(marker) {
            cleaned = rest.to_string();
            break;
        }
    }

    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d-%m-%Y"];

/// Epoch values above this are milliseconds rather than seconds.
const EPOCH_MILLIS_CUTOFF: i64 = 100_000_000_000;

/// Parse a timestamp into epoch milliseconds (UTC).
pub fn parse_timestamp_ms(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(epoch) = raw.parse::<i64>() {
        return Some(if epoch.abs() >= EPOCH_MILLIS_CUTOFF {
            epoch
        } else {
            epoch * 1000
        });
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }

    for format in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt.and_utc().timestamp_millis());
        }
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return date
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc().timestamp_millis());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_aliases_fold_together() {
        for header in ["Tx Status", "transaction_status", "status", "TX-STATUS"] {
            assert_eq!(lookup_field(&fold_header(header)), Some(Field::Status));
        }
        assert_eq!(lookup_field(&fold_header("PG")), Some(Field::Gateway));
        assert_eq!(lookup_field(&fold_header("Payment Gateway")), Some(Field::Gateway));
        assert_eq!(lookup_field(&fold_header("notes")), None);
    }

    #[test]
    fn test_first_matching_column_wins() {
        let map = ColumnMap::resolve(["created_at", "date", "amount"]);
        assert_eq!(map.position(Field::Timestamp), Some(0));
        assert_eq!(map.position(Field::Amount), Some(2));
        assert!(map.position(Field::Bank).is_none());
    }

    #[test]
    fn test_status_flags() {
        assert!(derive_status("SUCCESS").success);
        assert!(derive_status("Captured").success);
        assert!(derive_status("FAILED").failed);
        assert!(derive_status("User Dropped").user_dropped);
        assert!(derive_status("USER_DROPPED").user_dropped);
        assert_eq!(derive_status("pending"), StatusFlags::default());
        assert_eq!(derive_status(""), StatusFlags::default());
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("1,234.50"), Some(1234.5));
        assert_eq!(parse_amount("₹ 99"), Some(99.0));
        assert_eq!(parse_amount("INR 10"), Some(10.0));
        assert_eq!(parse_amount("Rs. 99"), Some(99.0));
        assert_eq!(parse_amount("$5"), Some(5.0));
        assert_eq!(parse_amount(""), Some(0.0));
        assert_eq!(parse_amount("-3.5"), Some(-3.5));
        assert_eq!(parse_amount("abc"), None);
    }

    #[test]
    fn test_parse_timestamps() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis();

        assert_eq!(parse_timestamp_ms("2024-03-05 10:30:00"), Some(expected));
        assert_eq!(parse_timestamp_ms("2024-03-05T10:30:00"), Some(expected));
        assert_eq!(parse_timestamp_ms("2024-03-05T10:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp_ms("2024-03-05T16:00:00+05:30"), Some(expected));
        assert_eq!(parse_timestamp_ms("05/03/2024 10:30"), Some(expected));
        assert_eq!(parse_timestamp_ms(&(expected / 1000).to_string()), Some(expected));
        assert_eq!(parse_timestamp_ms(&expected.to_string()), Some(expected));
        assert!(parse_timestamp_ms("2024-03-05").is_some());
        assert_eq!(parse_timestamp_ms("yesterday"), None);
        assert_eq!(parse_timestamp_ms(""), None);
    }

    #[test]
    fn test_normalize_row() {
        let map = ColumnMap::resolve(["Txn ID", "Created At", "Amount", "Tx Status", "PG", "Mode"]);
        let row = vec!["t-1", "2024-01-02 23:59:59", "150.25", "success", " RAZORPAY ", "UPI"];
        let record = map.normalize(&row).unwrap();

        assert_eq!(record.transaction_id.as_deref(), Some("t-1"));
        assert_eq!(record.date, "2024-01-02");
        assert_eq!(record.amount, 150.25);
        assert_eq!(record.gateway, "RAZORPAY");
        assert_eq!(record.payment_mode, "UPI");
        assert!(record.is_success && !record.is_failed && !record.is_user_dropped);
        assert_eq!(record.bank, "");
    }

    #[test]
    fn test_normalize_row_errors() {
        let map = ColumnMap::resolve(["timestamp", "amount"]);
        let bad_ts = vec!["not a date", "1"];
        assert!(matches!(map.normalize(&bad_ts), Err(RowError::Timestamp(_))));

        let bad_amount = vec!["2024-01-01", "lots"];
        assert!(matches!(map.normalize(&bad_amount), Err(RowError::Amount(_))));

        let short = vec!["2024-01-01"];
        assert_eq!(map.normalize(&short).unwrap().amount, 0.0);
    }
}
