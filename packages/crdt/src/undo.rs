//! Local undo/redo over Loro's `UndoManager`.
//!
//! Only commits made with [`TreeDoc::commit`] become undo steps. Imports,
//! untracked commits and rollbacks are treated as someone else's edits:
//! undo steps are rebased over them instead of reverting them.

use loro::UndoManager;

use crate::doc::{CommitOrigin, UNDO_EXCLUDED_PREFIX};
use crate::{CrdtError, TreeDoc};

pub struct UndoHistory {
    manager: UndoManager,
}

impl std::fmt::Debug for UndoHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoHistory")
            .field("can_undo", &self.manager.can_undo())
            .field("can_redo", &self.manager.can_redo())
            .finish()
    }
}

impl UndoHistory {
    pub fn new(doc: &TreeDoc) -> Self {
        let mut manager = UndoManager::new(&doc.doc);
        manager.add_exclude_origin_prefix(UNDO_EXCLUDED_PREFIX);
        // one commit, one step
        manager.set_merge_interval(0);
        Self { manager }
    }

    /// Cap on remembered steps; the oldest are dropped first
    pub fn set_max_steps(&mut self, steps: usize) {
        self.manager.set_max_undo_steps(steps);
    }

    pub fn can_undo(&self) -> bool {
        self.manager.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.manager.can_redo()
    }

    /// Revert the latest local step. Returns false when there was none.
    pub fn undo(&mut self, doc: &mut TreeDoc) -> Result<bool, CrdtError> {
        doc.require_committed("undo")?;
        let undone = self.manager.undo()?;
        if undone {
            doc.publish(CommitOrigin::Local);
        }
        Ok(undone)
    }

    pub fn redo(&mut self, doc: &mut TreeDoc) -> Result<bool, CrdtError> {
        doc.require_committed("redo")?;
        let redone = self.manager.redo()?;
        if redone {
            doc.publish(CommitOrigin::Local);
        }
        Ok(redone)
    }
}
