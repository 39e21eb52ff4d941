use shared::protocol::CodeRevision;

/// Cursor over one student's saved code revisions, oldest first.
///
/// While the cursor sits on the newest revision it follows live appends;
/// stepping back pins it until [`RevisionHistory::latest`] is called again.
#[derive(Debug, Clone)]
pub struct RevisionHistory {
    revisions: Vec<CodeRevision>,
    cursor: Option<usize>,
    following: bool,
}

impl Default for RevisionHistory {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl RevisionHistory {
    pub fn new(revisions: Vec<CodeRevision>) -> Self {
        let cursor = revisions.len().checked_sub(1);
        Self {
            revisions,
            cursor,
            following: true,
        }
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    pub fn current(&self) -> Option<&CodeRevision> {
        self.cursor.and_then(|index| self.revisions.get(index))
    }

    pub fn position(&self) -> Option<usize> {
        self.cursor
    }

    pub fn is_following_latest(&self) -> bool {
        self.following
    }

    pub fn push(&mut self, revision: CodeRevision) {
        self.revisions.push(revision);
        if self.following {
            self.cursor = Some(self.revisions.len() - 1);
        }
    }

    pub fn first(&mut self) -> Option<&CodeRevision> {
        self.jump_to(0)
    }

    pub fn latest(&mut self) -> Option<&CodeRevision> {
        self.cursor = self.revisions.len().checked_sub(1);
        self.following = true;
        self.current()
    }

    pub fn older(&mut self) -> Option<&CodeRevision> {
        match self.cursor {
            Some(index) if index > 0 => self.jump_to(index - 1),
            _ => None,
        }
    }

    pub fn newer(&mut self) -> Option<&CodeRevision> {
        match self.cursor {
            Some(index) if index + 1 < self.revisions.len() => self.jump_to(index + 1),
            _ => None,
        }
    }

    /// Moves to `index`, leaving the cursor untouched when out of range.
    pub fn jump_to(&mut self, index: usize) -> Option<&CodeRevision> {
        if index >= self.revisions.len() {
            return None;
        }
        self.cursor = Some(index);
        self.following = index + 1 == self.revisions.len();
        self.current()
    }
}
