//! Fixed-width report layout
//!
//! A layout turns records and break events into report lines. Column widths
//! belong to the concrete job, so [`FixedWidthLayout`] takes them as
//! configuration.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::accumulator::{BreakEvent, BreakLevel};
use super::types::{Amounted, LineKind, Record, ReportLine};

pub trait ReportLayout<P>: Send + Sync {
    /// Header block, written once at the top of a fresh run
    fn header(&self, job_name: &str) -> Vec<String>;

    fn detail(&self, record: &Record<P>) -> String;

    fn page_total(&self, event: &BreakEvent) -> String;

    fn group_total(&self, event: &BreakEvent) -> String;

    fn grand_total(&self, event: &BreakEvent) -> String;

    fn break_line(&self, event: &BreakEvent) -> ReportLine {
        match event.level {
            BreakLevel::Page => ReportLine::new(LineKind::PageTotal, self.page_total(event)),
            BreakLevel::Group => ReportLine::new(LineKind::GroupTotal, self.group_total(event)),
            BreakLevel::Grand => ReportLine::new(LineKind::GrandTotal, self.grand_total(event)),
        }
    }
}

/// Column widths, in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnWidths {
    pub key: usize,
    pub group: usize,
    pub description: usize,
    pub amount: usize,
}

impl Default for ColumnWidths {
    fn default() -> Self {
        Self {
            key: 16,
            group: 12,
            description: 30,
            amount: 14,
        }
    }
}

impl ColumnWidths {
    fn label(&self) -> usize {
        self.key + self.group + self.description
    }

    pub fn line_width(&self) -> usize {
        self.label() + self.amount
    }
}

/// Left-aligned, truncated or space-padded to exactly `width` chars
fn fit(text: &str, width: usize) -> String {
    let truncated: String = text.chars().take(width).collect();
    format!("{:<width$}", truncated, width = width)
}

type DescribeFn<P> = dyn Fn(&P) -> String + Send + Sync;

pub struct FixedWidthLayout<P> {
    title: String,
    widths: ColumnWidths,
    describe: Arc<DescribeFn<P>>,
}

impl<P> Clone for FixedWidthLayout<P> {
    fn clone(&self) -> Self {
        Self {
            title: self.title.clone(),
            widths: self.widths,
            describe: Arc::clone(&self.describe),
        }
    }
}

impl<P: Amounted + 'static> FixedWidthLayout<P> {
    pub fn new(title: impl Into<String>, widths: ColumnWidths) -> Self {
        Self {
            title: title.into(),
            widths,
            describe: Arc::new(|_| String::new()),
        }
    }

    /// Text for the description column
    pub fn with_description(mut self, describe: impl Fn(&P) -> String + Send + Sync + 'static) -> Self {
        self.describe = Arc::new(describe);
        self
    }

    pub fn widths(&self) -> ColumnWidths {
        self.widths
    }

    fn total_line(&self, label: &str, event: &BreakEvent) -> String {
        format!(
            "{}{:>width$}",
            fit(label, self.widths.label()),
            event.total,
            width = self.widths.amount
        )
    }
}

impl<P: Amounted + 'static> ReportLayout<P> for FixedWidthLayout<P> {
    fn header(&self, job_name: &str) -> Vec<String> {
        let w = &self.widths;
        vec![
            fit(&format!("{} - {}", self.title, job_name), w.line_width()),
            format!(
                "{}{}{}{:>width$}",
                fit("KEY", w.key),
                fit("GROUP", w.group),
                fit("DESCRIPTION", w.description),
                "AMOUNT",
                width = w.amount
            ),
            "-".repeat(w.line_width()),
        ]
    }

    fn detail(&self, record: &Record<P>) -> String {
        let w = &self.widths;
        format!(
            "{}{}{}{:>width$}",
            fit(&record.natural_key, w.key),
            fit(&record.group_key, w.group),
            fit(&(self.describe)(&record.payload), w.description),
            record.payload.amount(),
            width = w.amount
        )
    }

    fn page_total(&self, event: &BreakEvent) -> String {
        self.total_line(&format!("PAGE {} TOTAL", event.page_number), event)
    }

    fn group_total(&self, event: &BreakEvent) -> String {
        let group = event.group_key.as_deref().unwrap_or("");
        self.total_line(&format!("GROUP TOTAL {}", group), event)
    }

    fn grand_total(&self, event: &BreakEvent) -> String {
        self.total_line("GRAND TOTAL", event)
    }
}
