//! File system event types and their mapping from notify.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use notify::event::{ModifyKind, RenameMode};

/// Kind of observed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Path appeared.
    Created,
    /// File contents changed.
    Modified,
    /// Path disappeared.
    Deleted,
}

impl EventKind {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        }
    }
}

/// An observed filesystem change. Consumed once by the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub kind: EventKind,
    pub path: PathBuf,
    pub observed_at: DateTime<Utc>,
}

impl FileEvent {
    /// Create an event observed now.
    pub fn new(kind: EventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            observed_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self::new(EventKind::Created, path)
    }

    #[must_use]
    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self::new(EventKind::Modified, path)
    }

    #[must_use]
    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self::new(EventKind::Deleted, path)
    }

    /// Translate a notify event into zero or more file events.
    ///
    /// Access and metadata-only changes are dropped. Renames become a
    /// deletion of the old path and a creation of the new one.
    #[must_use]
    pub fn from_notify(event: &notify::Event) -> Vec<Self> {
        use notify::EventKind as Kind;

        let each = |kind: EventKind| -> Vec<Self> {
            event.paths.iter().map(|p| Self::new(kind, p)).collect()
        };

        match event.kind {
            Kind::Create(_) | Kind::Modify(ModifyKind::Name(RenameMode::To)) => {
                each(EventKind::Created)
            }
            Kind::Remove(_) | Kind::Modify(ModifyKind::Name(RenameMode::From)) => {
                each(EventKind::Deleted)
            }
            Kind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => each(EventKind::Modified),
            // The paired form follows separate From and To events.
            Kind::Modify(ModifyKind::Name(RenameMode::Both)) => Vec::new(),
            Kind::Modify(ModifyKind::Name(_)) => event
                .paths
                .iter()
                .map(|p| Self::new(renamed_kind(p), p))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// A rename that notify could not pair: the path either arrived or left.
fn renamed_kind(path: &Path) -> EventKind {
    if path.exists() {
        EventKind::Created
    } else {
        EventKind::Deleted
    }
}

/// Item delivered by a watch backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// A filesystem change.
    Change(FileEvent),
    /// The OS notification subsystem reported an error.
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

    fn notify_event(kind: notify::EventKind, paths: &[&str]) -> notify::Event {
        paths
            .iter()
            .fold(notify::Event::new(kind), |e, p| e.add_path(PathBuf::from(p)))
    }

    fn kinds(events: &[FileEvent]) -> Vec<(EventKind, PathBuf)> {
        events.iter().map(|e| (e.kind, e.path.clone())).collect()
    }

    #[test]
    fn test_create_maps_to_created() {
        let event = notify_event(
            notify::EventKind::Create(CreateKind::File),
            &["/w/new.txt"],
        );
        assert_eq!(
            kinds(&FileEvent::from_notify(&event)),
            vec![(EventKind::Created, PathBuf::from("/w/new.txt"))]
        );
    }

    #[test]
    fn test_data_change_maps_to_modified() {
        let event = notify_event(
            notify::EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/w/a.txt"],
        );
        assert_eq!(
            kinds(&FileEvent::from_notify(&event)),
            vec![(EventKind::Modified, PathBuf::from("/w/a.txt"))]
        );
    }

    #[test]
    fn test_remove_maps_to_deleted() {
        let event = notify_event(notify::EventKind::Remove(RemoveKind::Any), &["/w/a.txt"]);
        assert_eq!(
            kinds(&FileEvent::from_notify(&event)),
            vec![(EventKind::Deleted, PathBuf::from("/w/a.txt"))]
        );
    }

    #[test]
    fn test_rename_halves_without_duplicates() {
        let from = notify_event(
            notify::EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &["/w/old.txt"],
        );
        let to = notify_event(
            notify::EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            &["/w/new.txt"],
        );
        let both = notify_event(
            notify::EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/w/old.txt", "/w/new.txt"],
        );

        let all: Vec<_> = [from, to, both]
            .iter()
            .flat_map(FileEvent::from_notify)
            .collect();
        assert_eq!(
            kinds(&all),
            vec![
                (EventKind::Deleted, PathBuf::from("/w/old.txt")),
                (EventKind::Created, PathBuf::from("/w/new.txt")),
            ]
        );
    }

    #[test]
    fn test_metadata_and_access_ignored() {
        let metadata = notify_event(
            notify::EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
            &["/w/a.txt"],
        );
        assert!(FileEvent::from_notify(&metadata).is_empty());

        let access = notify_event(
            notify::EventKind::Access(notify::event::AccessKind::Any),
            &["/w/a.txt"],
        );
        assert!(FileEvent::from_notify(&access).is_empty());
    }

    #[test]
    fn test_event_kind_labels() {
        assert_eq!(EventKind::Created.as_str(), "created");
        assert_eq!(EventKind::Modified.as_str(), "modified");
        assert_eq!(EventKind::Deleted.as_str(), "deleted");
    }
}
