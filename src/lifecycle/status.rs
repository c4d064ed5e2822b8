//! Content-based status determination.
//!
//! Absence from the live summary (see [`super::Reconciler`]) is the canonical
//! signal that an entity has finished. The strategies here only let a summary
//! row that already *says* it is finished skip the grace period.

use crate::core::{EntityStatus, UnitScore};
use crate::source::mapper::{RawRow, field, unit_scores};

pub trait StatusStrategy: Send + Sync {
    fn determine(&self, row: &RawRow) -> EntityStatus;
}

/// Completed when the source names a winner (`"1"` or `"2"`).
#[derive(Debug, Clone, Default)]
pub struct WinnerFlag;

impl StatusStrategy for WinnerFlag {
    fn determine(&self, row: &RawRow) -> EntityStatus {
        match field(row, "winner").as_deref() {
            Some("1") | Some("2") => EntityStatus::Completed,
            _ => EntityStatus::Live,
        }
    }
}

/// Completed when the free-text status contains a terminal keyword.
#[derive(Debug, Clone)]
pub struct CompletionKeywords {
    keywords: Vec<String>,
}

impl Default for CompletionKeywords {
    fn default() -> Self {
        Self::new(["finished", "retired", "walkover", "awarded", "cancelled"])
    }
}

impl CompletionKeywords {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.into().to_lowercase())
                .collect(),
        }
    }
}

impl StatusStrategy for CompletionKeywords {
    fn determine(&self, row: &RawRow) -> EntityStatus {
        let text = field(row, "status").unwrap_or_default().to_lowercase();
        if self.keywords.iter().any(|k| text.contains(k.as_str())) {
            EntityStatus::Completed
        } else {
            EntityStatus::Live
        }
    }
}

/// Completed once either side has won `units_to_win` decided units.
///
/// A unit counts as decided when the leader reached `games_per_unit` with a
/// two-game margin, or won it `games_per_unit + 1` to anything (tie-break).
/// An in-progress unit such as 3-1 never counts.
#[derive(Debug, Clone)]
pub struct SetMajority {
    pub units_to_win: usize,
    pub games_per_unit: u32,
}

impl Default for SetMajority {
    fn default() -> Self {
        Self {
            units_to_win: 2,
            games_per_unit: 6,
        }
    }
}

impl SetMajority {
    fn winner(&self, unit: &UnitScore) -> Option<usize> {
        let (lead, trail, side) = if unit.home > unit.away {
            (unit.home, unit.away, 0)
        } else if unit.away > unit.home {
            (unit.away, unit.home, 1)
        } else {
            return None;
        };
        let decided = (lead >= self.games_per_unit && lead - trail >= 2)
            || lead == self.games_per_unit + 1;
        decided.then_some(side)
    }
}

impl StatusStrategy for SetMajority {
    fn determine(&self, row: &RawRow) -> EntityStatus {
        let mut won = [0usize; 2];
        for unit in unit_scores(row) {
            if let Some(side) = self.winner(&unit) {
                won[side] += 1;
            }
        }
        if won.iter().any(|count| *count >= self.units_to_win) {
            EntityStatus::Completed
        } else {
            EntityStatus::Live
        }
    }
}

/// Completed as soon as any inner strategy says so.
pub struct FirstCompleted {
    strategies: Vec<Box<dyn StatusStrategy>>,
}

impl FirstCompleted {
    pub fn new(strategies: Vec<Box<dyn StatusStrategy>>) -> Self {
        Self { strategies }
    }
}

impl StatusStrategy for FirstCompleted {
    fn determine(&self, row: &RawRow) -> EntityStatus {
        if self
            .strategies
            .iter()
            .any(|s| s.determine(row) == EntityStatus::Completed)
        {
            EntityStatus::Completed
        } else {
            EntityStatus::Live
        }
    }
}

/// Winner flag, then keywords, then best-of-three unit count.
pub fn default_strategy() -> Box<dyn StatusStrategy> {
    Box::new(FirstCompleted::new(vec![
        Box::new(WinnerFlag),
        Box::new(CompletionKeywords::default()),
        Box::new(SetMajority::default()),
    ]))
}
