//! Event kinds delivered to watcher callbacks.

use notify::EventKind;

/// The three changes a watcher reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl ChangeKind {
    /// Translate a raw notify kind; kinds outside the interest set
    /// (access, metadata-only notifications without a class) are
    /// dropped.
    pub(crate) fn from_notify(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Create(_) => Some(Self::Created),
            EventKind::Modify(_) => Some(Self::Modified),
            EventKind::Remove(_) => Some(Self::Deleted),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind, RemoveKind};

    #[test]
    fn interest_set_covers_create_modify_delete() {
        assert_eq!(
            ChangeKind::from_notify(&EventKind::Create(CreateKind::File)),
            Some(ChangeKind::Created)
        );
        assert_eq!(
            ChangeKind::from_notify(&EventKind::Modify(ModifyKind::Any)),
            Some(ChangeKind::Modified)
        );
        assert_eq!(
            ChangeKind::from_notify(&EventKind::Remove(RemoveKind::File)),
            Some(ChangeKind::Deleted)
        );
    }

    #[test]
    fn access_events_are_ignored() {
        assert_eq!(
            ChangeKind::from_notify(&EventKind::Access(AccessKind::Any)),
            None
        );
        assert_eq!(ChangeKind::from_notify(&EventKind::Any), None);
    }
}
