use crate::storage::buffer::LatchKind;

/// How a tree descent latches the index and its pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtrLatchMode {
    /// Tree S while descending, S latch on the target page.
    SearchLeaf,
    /// Tree S while descending, X latch on the target page.
    ModifyLeaf,
    /// Tree X and an X latch on every page of the path.
    ModifyTree,
    /// Like `ModifyTree`, for a caller that already holds the tree X lock.
    ContModifyTree,
}

impl BtrLatchMode {
    /// Latch taken on the page at the target level.
    pub fn target_latch(self) -> LatchKind {
        match self {
            BtrLatchMode::SearchLeaf => LatchKind::S,
            _ => LatchKind::X,
        }
    }

    /// Latch taken on pages above the target level.
    pub fn upper_latch(self) -> LatchKind {
        if self.modifies_tree() {
            LatchKind::X
        } else {
            LatchKind::S
        }
    }

    pub fn modifies_tree(self) -> bool {
        matches!(self, BtrLatchMode::ModifyTree | BtrLatchMode::ContModifyTree)
    }
}
