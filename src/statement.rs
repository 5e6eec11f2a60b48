//! Statement phase, kind and per-row bookkeeping.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::StateError;
use crate::types::Column;

/// Column descriptors shared between the statement and its buffers.
pub type SharedColumns = Arc<Vec<Column>>;

bitflags! {
    /// Accumulated protocol phase. Bits are only ever added.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Phase: u8 {
        const PREPARED = 1;
        const EXECUTED = 2;
        const ROWS_DONE = 4;
        const FINISHED = 8;
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("fresh");
        }
        bitflags::parser::to_writer(self, f)
    }
}

/// What a statement does with rows, as decided by its metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatementKind {
    #[default]
    Unset,
    Select,
    Insert,
    Direct,
}

impl StatementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StatementKind::Unset => "unset",
            StatementKind::Select => "select",
            StatementKind::Insert => "insert",
            StatementKind::Direct => "direct",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Row Tracker
// ============================================================================

/// Which insert columns have been set in the current row.
#[derive(Debug, Clone, Default)]
pub struct RowTracker {
    set: Vec<bool>,
}

impl RowTracker {
    pub fn new(columns: usize) -> Self {
        Self {
            set: vec![false; columns],
        }
    }

    pub fn mark(&mut self, column: usize) -> Result<(), StateError> {
        match self.set.get_mut(column) {
            Some(flag) if *flag => Err(StateError::ColumnAlreadySet { column }),
            Some(flag) => {
                *flag = true;
                Ok(())
            }
            // Index is validated against the descriptors before marking.
            None => Ok(()),
        }
    }

    pub fn is_set(&self, column: usize) -> bool {
        self.set.get(column).copied().unwrap_or(false)
    }

    pub fn missing(&self) -> Vec<usize> {
        self.set
            .iter()
            .enumerate()
            .filter(|(_, set)| !**set)
            .map(|(i, _)| i)
            .collect()
    }

    /// Check the row is complete, then start the next one.
    pub fn complete_row(&mut self) -> Result<(), StateError> {
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(StateError::ColumnsNotSet { missing });
        }
        self.set.iter_mut().for_each(|flag| *flag = false);
        Ok(())
    }
}

// ============================================================================
// Statement
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct Statement {
    pub id: u32,
    pub kind: StatementKind,
    pub phase: Phase,
    /// Columns an insert expects
    pub input: SharedColumns,
    /// Columns a select returns
    pub output: SharedColumns,
}

impl Statement {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Fail unless the phase is exactly `expected`.
    pub fn require(&self, operation: &'static str, expected: Phase) -> Result<(), StateError> {
        if self.phase != expected {
            return Err(self.violation(operation));
        }
        Ok(())
    }

    /// Fail unless every bit of `needed` has been reached.
    pub fn require_reached(&self, operation: &'static str, needed: Phase) -> Result<(), StateError> {
        if !self.phase.contains(needed) {
            return Err(self.violation(operation));
        }
        Ok(())
    }

    pub fn advance(&mut self, phase: Phase) {
        self.phase |= phase;
    }

    /// Between prepare and finish: the server still holds the statement open.
    pub fn is_open(&self) -> bool {
        self.phase.contains(Phase::PREPARED) && !self.phase.contains(Phase::FINISHED)
    }

    /// Descriptors callers address: input for inserts, output for selects.
    pub fn columns(&self) -> &[Column] {
        match self.kind {
            StatementKind::Insert => &self.input[..],
            StatementKind::Select => &self.output[..],
            _ => &[],
        }
    }

    fn violation(&self, operation: &'static str) -> StateError {
        StateError::OrderViolation {
            operation,
            phase: self.phase.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_requirements() {
        let mut stmt = Statement::new(1);
        assert!(stmt.require("execute_query", Phase::PREPARED).is_err());

        stmt.advance(Phase::PREPARED);
        assert!(stmt.require("execute_query", Phase::PREPARED).is_ok());
        assert!(stmt
            .require("next_row", Phase::PREPARED | Phase::EXECUTED)
            .is_err());

        stmt.advance(Phase::EXECUTED);
        assert!(stmt.require("execute_query", Phase::PREPARED).is_err());
        assert!(stmt.require_reached("metadata", Phase::PREPARED).is_ok());
        assert!(stmt.is_open());

        stmt.advance(Phase::ROWS_DONE | Phase::FINISHED);
        assert!(!stmt.is_open());
    }

    #[test]
    fn test_violation_reports_phase() {
        let mut stmt = Statement::new(1);
        stmt.advance(Phase::PREPARED | Phase::EXECUTED);
        let err = stmt.require("execute_query", Phase::PREPARED).unwrap_err();
        assert_eq!(
            err,
            StateError::OrderViolation {
                operation: "execute_query",
                phase: "PREPARED | EXECUTED".to_string(),
            }
        );
        assert_eq!(Phase::empty().to_string(), "fresh");
    }

    #[test]
    fn test_row_tracker() {
        let mut tracker = RowTracker::new(3);
        tracker.mark(0).unwrap();
        tracker.mark(2).unwrap();
        assert_eq!(
            tracker.mark(2),
            Err(StateError::ColumnAlreadySet { column: 2 })
        );
        assert_eq!(
            tracker.complete_row(),
            Err(StateError::ColumnsNotSet { missing: vec![1] })
        );

        tracker.mark(1).unwrap();
        tracker.complete_row().unwrap();
        assert!(!tracker.is_set(0));
        assert_eq!(tracker.missing(), vec![0, 1, 2]);
    }
}
