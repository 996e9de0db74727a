//! Undo/redo history.
//!
//! Every committed local mutation records a forward change and its inverse.
//! Entries recorded with the same group id form one step, so a bulk delete
//! is undone and redone as a unit.

use crate::ids::GroupId;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub struct UndoEntry<C> {
    pub forward: C,
    pub inverse: C,
    pub group_id: Option<GroupId>,
}

/// One undoable step: a single entry or a whole group.
#[derive(Debug, Clone, PartialEq)]
struct Step<C> {
    group_id: Option<GroupId>,
    entries: Vec<UndoEntry<C>>,
}

/// Bounded undo/redo stacks. Depth is counted in steps; the oldest step is
/// dropped once the limit is exceeded.
#[derive(Debug)]
pub struct UndoStack<C> {
    undo: VecDeque<Step<C>>,
    redo: Vec<Step<C>>,
    max_depth: usize,
}

impl<C: Clone> UndoStack<C> {
    pub fn new(max_depth: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: Vec::new(),
            max_depth,
        }
    }

    /// Record a change. Clears the redo stack.
    pub fn record(&mut self, forward: C, inverse: C, group_id: Option<GroupId>) {
        self.redo.clear();
        let entry = UndoEntry {
            forward,
            inverse,
            group_id,
        };
        match self.undo.back_mut() {
            Some(step) if group_id.is_some() && step.group_id == group_id => {
                step.entries.push(entry);
            }
            _ => {
                self.undo.push_back(Step {
                    group_id,
                    entries: vec![entry],
                });
                while self.undo.len() > self.max_depth {
                    self.undo.pop_front();
                }
            }
        }
    }

    /// Pop the latest step. Returns its inverses, newest first.
    pub fn undo(&mut self) -> Option<Vec<C>> {
        let step = self.undo.pop_back()?;
        let inverses = step.entries.iter().rev().map(|e| e.inverse.clone()).collect();
        self.redo.push(step);
        Some(inverses)
    }

    /// Pop the latest undone step. Returns its forward changes in order.
    pub fn redo(&mut self) -> Option<Vec<C>> {
        let step = self.redo.pop()?;
        let forwards = step.entries.iter().map(|e| e.forward.clone()).collect();
        self.undo.push_back(step);
        Some(forwards)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_count(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo.len()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}
