//! # Export / Import
//!
//! Bytes are Loro's own export format, so any replica (or a plain Loro
//! peer reading the `tree` container) can merge them.
//!
//! Import is idempotent. Updates whose causal dependencies have not
//! arrived yet are held by Loro and applied once they do.

use loro::ExportMode as LoroExportMode;

use crate::doc::CommitOrigin;
use crate::{CrdtError, TreeDoc, VersionVector};

/// What to export
#[derive(Debug, Clone, Copy)]
pub enum ExportMode<'a> {
    /// Full document
    Snapshot,
    /// Committed changes not covered by `from`
    Updates { from: &'a VersionVector },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportStatus {
    /// Ops integrated by this call (including previously held ones)
    pub applied: usize,
    /// Some changes are still waiting for missing dependencies
    pub pending: bool,
}

impl TreeDoc {
    /// Committed changes only; fails while edits are pending
    pub fn export(&self, mode: ExportMode<'_>) -> Result<Vec<u8>, CrdtError> {
        self.require_committed("export")?;
        let result = match mode {
            ExportMode::Snapshot => self.doc.export(LoroExportMode::Snapshot),
            ExportMode::Updates { from } => {
                self.doc.export(LoroExportMode::updates(&from.to_loro()))
            }
        };
        result.map_err(|e| CrdtError::Encode(e.to_string()))
    }

    /// Merge bytes produced by [`TreeDoc::export`] on any replica.
    ///
    /// Pending local edits are committed first so they are never
    /// interleaved with remote ones.
    pub fn import(&mut self, bytes: &[u8]) -> Result<ImportStatus, CrdtError> {
        self.commit_untracked();
        let before = self.version().op_count();
        let status = self
            .doc
            .import(bytes)
            .map_err(|e| CrdtError::Decode(e.to_string()))?;
        self.publish(CommitOrigin::Import);

        let applied = self.version().op_count().saturating_sub(before);
        let status = ImportStatus {
            applied: usize::try_from(applied).unwrap_or(usize::MAX),
            pending: status.pending.is_some(),
        };
        if status.pending {
            tracing::debug!(applied = status.applied, "updates held waiting for dependencies");
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeKind;

    #[test]
    fn test_rejects_foreign_bytes() {
        let mut doc = TreeDoc::with_peer(1);
        assert!(matches!(doc.import(b"nope"), Err(CrdtError::Decode(_))));
        assert!(doc.state().is_empty());
    }

    #[test]
    fn test_export_refuses_uncommitted_edits() {
        let mut doc = TreeDoc::with_peer(1);
        doc.create_node(None, 0, NodeKind::Element).unwrap();
        doc.commit();
        doc.create_node(None, 1, NodeKind::Element).unwrap();
        assert!(matches!(
            doc.export(ExportMode::Snapshot),
            Err(CrdtError::InvalidOperation(_))
        ));

        doc.rollback_to(0);
        let mut other = TreeDoc::with_peer(2);
        other.import(&doc.export(ExportMode::Snapshot).unwrap()).unwrap();
        assert_eq!(other.roots().len(), 1);
    }

    #[test]
    fn test_out_of_order_updates_are_held() {
        let mut a = TreeDoc::with_peer(1);
        let root = a.create_node(None, 0, NodeKind::Element).unwrap();
        a.commit();
        let v1 = a.version().clone();
        let first = a.export(ExportMode::Snapshot).unwrap();

        a.create_node(Some(root), 0, NodeKind::Value).unwrap();
        a.commit();
        let second = a.export(ExportMode::Updates { from: &v1 }).unwrap();

        let mut b = TreeDoc::with_peer(2);
        let status = b.import(&second).unwrap();
        assert_eq!(status.applied, 0);
        assert!(status.pending);

        let status = b.import(&first).unwrap();
        assert!(status.applied > 0);
        assert!(!status.pending);
        assert_eq!(b.children(&root).len(), 1);
        assert_eq!(b.version(), a.version());

        // importing again is a no-op
        let status = b.import(&first).unwrap();
        assert_eq!(status.applied, 0);
    }
}
