//! Account/transaction ledger records and their stock stages
//!
//! The engine itself is payload-agnostic; this module is the reference
//! domain used by transaction reporting and statement jobs.

use chrono::NaiveDate;
use ledgerflow_common::Money;
use serde::{Deserialize, Serialize};

use super::stage::{FnStage, StageKind};
use super::types::{Amounted, ProcessingResult, Record};

/// One posted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub transaction_id: String,
    pub account_id: String,
    pub posted_on: NaiveDate,
    pub description: String,
    pub amount: Money,
    /// Filled in by the cross-reference stage
    #[serde(default)]
    pub customer_name: Option<String>,
}

impl Amounted for LedgerEntry {
    fn amount(&self) -> Money {
        self.amount
    }
}

impl LedgerEntry {
    pub fn new(
        transaction_id: impl Into<String>,
        account_id: impl Into<String>,
        posted_on: NaiveDate,
        description: impl Into<String>,
        amount: Money,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            account_id: account_id.into(),
            posted_on,
            description: description.into(),
            amount,
            customer_name: None,
        }
    }

    /// Wrap as a record ordered by account, posting date, then transaction id
    pub fn into_record(self) -> Record<LedgerEntry> {
        let order_key = format!(
            "{}|{}|{}",
            self.account_id,
            self.posted_on.format("%Y-%m-%d"),
            self.transaction_id
        );
        Record::new(self.transaction_id.clone(), order_key, self.account_id.clone(), self)
    }
}

/// Required fields present and keys consistent with the payload
pub fn structural_validation(
) -> FnStage<LedgerEntry, impl Fn(Record<LedgerEntry>) -> ProcessingResult<LedgerEntry> + Send + Sync> {
    FnStage::new("structural_validation", StageKind::Structural, |r: Record<LedgerEntry>| {
        let e = &r.payload;
        if e.transaction_id.trim().is_empty() {
            return ProcessingResult::Skipped("transaction id is blank".into());
        }
        if e.account_id.trim().is_empty() {
            return ProcessingResult::Skipped("account id is blank".into());
        }
        if r.group_key != e.account_id {
            return ProcessingResult::Skipped(format!(
                "group key '{}' does not match account '{}'",
                r.group_key, e.account_id
            ));
        }
        ProcessingResult::Accepted(r)
    })
}

/// Business rule: absolute amount must not exceed `limit`
pub fn amount_limit(
    limit: Money,
) -> FnStage<LedgerEntry, impl Fn(Record<LedgerEntry>) -> ProcessingResult<LedgerEntry> + Send + Sync> {
    FnStage::new("amount_limit", StageKind::BusinessRule, move |r: Record<LedgerEntry>| {
        let amount = r.payload.amount;
        let magnitude = if amount.is_negative() { -amount } else { amount };
        if magnitude > limit {
            ProcessingResult::Skipped(format!("amount {} exceeds limit {}", amount, limit))
        } else {
            ProcessingResult::Accepted(r)
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::stage::Stage;

    fn entry(id: &str, account: &str, amount: &str) -> LedgerEntry {
        LedgerEntry::new(
            id,
            account,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            "POS PURCHASE",
            amount.parse().unwrap(),
        )
    }

    #[test]
    fn test_record_keys() {
        let r = entry("T100", "ACC-7", "1.00").into_record();
        assert_eq!(r.natural_key, "T100");
        assert_eq!(r.group_key, "ACC-7");
        assert_eq!(r.order_key, "ACC-7|2024-03-01|T100");
    }

    #[tokio::test]
    async fn test_structural_validation_rejects_blank_ids() {
        let stage = structural_validation();
        assert!(stage.process(entry("T1", "ACC-1", "1.00").into_record()).await.is_accepted());

        let blank = entry("T2", "ACC-1", "1.00").into_record().map(|mut e| {
            e.account_id = " ".into();
            e
        });
        assert!(matches!(stage.process(blank).await, ProcessingResult::Skipped(_)));
    }

    #[tokio::test]
    async fn test_amount_limit_applies_to_debits_and_credits() {
        let stage = amount_limit("100.00".parse().unwrap());
        assert!(stage.process(entry("T1", "A", "100.00").into_record()).await.is_accepted());
        assert!(!stage.process(entry("T2", "A", "-100.01").into_record()).await.is_accepted());
        assert!(!stage.process(entry("T3", "A", "250.00").into_record()).await.is_accepted());
    }
}
