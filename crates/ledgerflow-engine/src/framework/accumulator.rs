//! Break-total accumulator
//!
//! Maintains nested running totals (page, group, grand) over an ordered
//! stream of accepted records and reports control breaks. For every record
//! the steps run in this fixed order:
//!
//! 1. If the group key changed, flush and reset the group total. The page
//!    total and page line counter are left alone.
//! 2. Add the amount to page, group and grand totals; count one page line.
//! 3. If the page line counter reached `page_size`, flush and reset the page.
//!
//! A group break and a page break on the same record therefore always come
//! out group first, and the page check runs against the untouched counter.
//! `finish` flushes the open group and then the grand total, once each, even
//! when they are zero. A partially filled last page is not flushed; its total
//! stays visible through [`BreakTotalAccumulator::open_page_total`].

use ledgerflow_common::{Money, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakLevel {
    Page,
    Group,
    Grand,
}

/// A flushed total
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakEvent {
    pub level: BreakLevel,
    /// Group being closed (group breaks) or open when the page filled
    pub group_key: Option<String>,
    pub total: Money,
    /// Detail lines folded into this total
    pub lines: u64,
    /// Page number for page breaks, pages emitted so far otherwise
    pub page_number: u64,
}

/// Breaks triggered by one record, in emission order around its detail line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Breaks {
    /// Emitted before the record's detail line
    pub group: Option<BreakEvent>,
    /// Emitted after the record's detail line
    pub page: Option<BreakEvent>,
}

/// Serializable accumulator state; persisted with every checkpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccumulatorState {
    pub current_group: Option<String>,
    pub page_total: Money,
    pub page_lines: u64,
    pub pages_emitted: u64,
    pub group_total: Money,
    pub group_lines: u64,
    pub grand_total: Money,
    pub grand_lines: u64,
    pub finished: bool,
}

/// Control-break accumulator for one job execution
#[derive(Debug, Clone)]
pub struct BreakTotalAccumulator {
    page_size: u64,
    state: AccumulatorState,
}

impl BreakTotalAccumulator {
    pub fn new(page_size: usize) -> Self {
        Self::from_state(page_size, AccumulatorState::default())
    }

    /// Resume from a checkpointed state
    pub fn from_state(page_size: usize, state: AccumulatorState) -> Self {
        Self {
            page_size: page_size.max(1) as u64,
            state,
        }
    }

    pub fn state(&self) -> &AccumulatorState {
        &self.state
    }

    pub fn grand_total(&self) -> Money {
        self.state.grand_total
    }

    pub fn open_page_total(&self) -> Money {
        self.state.page_total
    }

    pub fn current_group(&self) -> Option<&str> {
        self.state.current_group.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished
    }

    /// Fold one accepted record into the totals
    ///
    /// Fails without touching the totals when any of them would overflow.
    pub fn accept(&mut self, group_key: &str, amount: Money) -> Result<Breaks> {
        let mut breaks = Breaks::default();
        let group_changed = self.state.current_group.as_deref() != Some(group_key);
        let group_base = if group_changed {
            Money::ZERO
        } else {
            self.state.group_total
        };
        let page_total = self.state.page_total.checked_add(amount)?;
        let group_total = group_base.checked_add(amount)?;
        let grand_total = self.state.grand_total.checked_add(amount)?;

        let s = &mut self.state;
        if group_changed {
            if s.current_group.is_some() {
                breaks.group = Some(BreakEvent {
                    level: BreakLevel::Group,
                    group_key: s.current_group.clone(),
                    total: s.group_total,
                    lines: s.group_lines,
                    page_number: s.pages_emitted,
                });
            }
            s.group_lines = 0;
            s.current_group = Some(group_key.to_string());
        }

        s.page_total = page_total;
        s.group_total = group_total;
        s.grand_total = grand_total;
        s.page_lines += 1;
        s.group_lines += 1;
        s.grand_lines += 1;

        if s.page_lines >= self.page_size {
            s.pages_emitted += 1;
            breaks.page = Some(BreakEvent {
                level: BreakLevel::Page,
                group_key: s.current_group.clone(),
                total: s.page_total,
                lines: s.page_lines,
                page_number: s.pages_emitted,
            });
            s.page_total = Money::ZERO;
            s.page_lines = 0;
        }

        Ok(breaks)
    }

    /// End-of-source flush: open group, then grand total
    ///
    /// Returns nothing when called a second time.
    pub fn finish(&mut self) -> Vec<BreakEvent> {
        if self.state.finished {
            return Vec::new();
        }
        let s = &mut self.state;
        s.finished = true;

        let group = BreakEvent {
            level: BreakLevel::Group,
            group_key: s.current_group.clone(),
            total: s.group_total,
            lines: s.group_lines,
            page_number: s.pages_emitted,
        };
        let grand = BreakEvent {
            level: BreakLevel::Grand,
            group_key: None,
            total: s.grand_total,
            lines: s.grand_lines,
            page_number: s.pages_emitted,
        };
        s.group_total = Money::ZERO;
        s.group_lines = 0;

        vec![group, grand]
    }
}
