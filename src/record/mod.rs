//! The normalized transaction record.
//!
//! Every dataset shares one schema. Status flags and the calendar date are
//! derived once, when a raw row is normalized, and never recomputed.

mod normalize;

pub use normalize::{
    derive_status, fold_header, parse_amount, parse_timestamp_ms, ColumnMap, Field,
    RowError, StatusFlags,
};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// One normalized transaction. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub transaction_id: Option<String>,
    /// Milliseconds since the Unix epoch, UTC.
    pub timestamp_ms: i64,
    /// UTC calendar date, `YYYY-MM-DD`.
    pub date: String,
    pub amount: f64,
    pub payment_mode: String,
    pub merchant_id: String,
    pub gateway: String,
    pub bank: String,
    pub card_type: String,
    /// Status as it appeared in the source, trimmed.
    pub status: String,
    pub is_success: bool,
    pub is_failed: bool,
    pub is_user_dropped: bool,
}

impl Record {
    /// Value of an indexed dimension.
    pub fn dimension(&self, dimension: Dimension) -> &str {
        match dimension {
            Dimension::PaymentMode => &self.payment_mode,
            Dimension::MerchantId => &self.merchant_id,
            Dimension::Gateway => &self.gateway,
            Dimension::Bank => &self.bank,
            Dimension::CardType => &self.card_type,
        }
    }

    /// Whether the gateway is a placeholder (`N/A`, `NA` or empty).
    ///
    /// Such records are excluded by every predicate.
    pub fn has_placeholder_gateway(&self) -> bool {
        let gateway = self.gateway.trim();
        gateway.is_empty()
            || gateway.eq_ignore_ascii_case("n/a")
            || gateway.eq_ignore_ascii_case("na")
    }
}

/// The indexed categorical dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    PaymentMode,
    MerchantId,
    Gateway,
    Bank,
    CardType,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::PaymentMode,
        Dimension::MerchantId,
        Dimension::Gateway,
        Dimension::Bank,
        Dimension::CardType,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::PaymentMode => "payment_mode",
            Dimension::MerchantId => "merchant_id",
            Dimension::Gateway => "gateway",
            Dimension::Bank => "bank",
            Dimension::CardType => "card_type",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dimension {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        Dimension::ALL
            .into_iter()
            .find(|d| d.as_str() == name)
            .ok_or_else(|| EngineError::validation(format!("Unknown dimension: {s}")))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a record for tests. `day` is the day of January 2024.
    pub fn record(day: u32, amount: f64, status: &str, gateway: &str, mode: &str) -> Record {
        let flags = derive_status(status);
        let timestamp_ms = chrono::NaiveDate::from_ymd_opt(2024, 1, day)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap();
        Record {
            transaction_id: Some(format!("tx-{day}-{amount}")),
            timestamp_ms,
            date: format!("2024-01-{day:02}"),
            amount,
            payment_mode: mode.to_string(),
            merchant_id: "m-1".to_string(),
            gateway: gateway.to_string(),
            bank: "HDFC".to_string(),
            card_type: "VISA".to_string(),
            status: status.to_string(),
            is_success: flags.success,
            is_failed: flags.failed,
            is_user_dropped: flags.user_dropped,
        }
    }

    /// A deterministic mixed dataset of `n` records across ten days.
    pub fn dataset(n: usize) -> Vec<Record> {
        let statuses = ["SUCCESS", "FAILED", "USER_DROPPED", "success", "pending"];
        let gateways = ["RAZORPAY", "PAYU", "N/A", "CASHFREE", ""];
        let modes = ["UPI", "CARD", "NETBANKING"];
        (0..n)
            .map(|i| {
                let mut r = record(
                    (i % 10) as u32 + 1,
                    (i % 97) as f64 * 10.5,
                    statuses[i % statuses.len()],
                    gateways[i % gateways.len()],
                    modes[i % modes.len()],
                );
                r.transaction_id = Some(format!("tx-{i}"));
                r.merchant_id = format!("m-{}", i % 4);
                r
            })
            .collect()
    }
}
