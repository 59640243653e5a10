use anyhow::Result;
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::event::{FsEvent, FsOp};
use crate::fsops::is_ignored;

/// How long a rename source waits for its destination before it is treated
/// as a move out of the tree.
const RENAME_WINDOW: Duration = Duration::from_millis(100);

pub struct FileWatcher {
    watcher: RecommendedWatcher,
    rx: mpsc::Receiver<notify::Result<Event>>,
    normalizer: EventNormalizer,
    ready: VecDeque<FsEvent>,
}

impl FileWatcher {
    pub fn new(capacity: usize) -> Result<Self> {
        let (tx, rx) = mpsc::channel(capacity);

        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.blocking_send(res);
            },
            Config::default(),
        )?;

        Ok(Self {
            watcher,
            rx,
            normalizer: EventNormalizer::default(),
            ready: VecDeque::new(),
        })
    }

    pub fn watch(&mut self, path: &Path) -> Result<()> {
        self.watcher.watch(path, RecursiveMode::Recursive)?;
        Ok(())
    }

    pub async fn next_event(&mut self) -> Option<Result<FsEvent>> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Some(Ok(event));
            }
            let raw = if self.normalizer.has_pending() {
                match tokio::time::timeout(RENAME_WINDOW, self.rx.recv()).await {
                    Ok(raw) => raw,
                    Err(_) => {
                        self.ready.extend(self.normalizer.flush());
                        continue;
                    }
                }
            } else {
                self.rx.recv().await
            };
            match raw {
                Some(Ok(event)) => {
                    enqueue(&mut self.ready, self.normalizer.push(&event));
                    // Fold whatever else already arrived, so a burst of writes
                    // to one file yields a single Modify.
                    while let Ok(raw) = self.rx.try_recv() {
                        match raw {
                            Ok(event) => enqueue(&mut self.ready, self.normalizer.push(&event)),
                            Err(e) => return Some(Err(anyhow::anyhow!("Watch error: {}", e))),
                        }
                    }
                }
                Some(Err(e)) => return Some(Err(anyhow::anyhow!("Watch error: {}", e))),
                None => {
                    self.ready.extend(self.normalizer.flush());
                    if self.ready.is_empty() {
                        return None;
                    }
                }
            }
        }
    }
}

/// Queues `events`, dropping a `Modify` whose path already has an
/// undelivered `Modify` as its latest queued event.
fn enqueue(ready: &mut VecDeque<FsEvent>, events: Vec<FsEvent>) {
    for event in events {
        if event.op == FsOp::Modify && modify_pending(ready, &event.path) {
            continue;
        }
        ready.push_back(event);
    }
}

fn modify_pending(ready: &VecDeque<FsEvent>, path: &Path) -> bool {
    ready
        .iter()
        .rev()
        .find(|e| e.path == path || e.origin_path.as_deref() == Some(path))
        .is_some_and(|e| e.op == FsOp::Modify)
}

/// Folds raw notify events into create/modify/remove/rename/mkdir.
#[derive(Debug, Default)]
pub struct EventNormalizer {
    rename_from: Option<PathBuf>,
    last_rename: Option<(PathBuf, PathBuf)>,
}

impl EventNormalizer {
    pub fn has_pending(&self) -> bool {
        self.rename_from.is_some()
    }

    /// A rename source that never saw its destination left the tree.
    pub fn flush(&mut self) -> Vec<FsEvent> {
        self.rename_from
            .take()
            .filter(|from| !is_ignored(from))
            .map(|from| FsEvent::new(FsOp::Remove, from))
            .into_iter()
            .collect()
    }

    pub fn push(&mut self, event: &Event) -> Vec<FsEvent> {
        let Some(path) = event.paths.first() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                out.extend(self.flush());
                self.rename_from = Some(path.clone());
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                out.extend(self.arrived(path));
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => {
                let pair = (path.clone(), event.paths[1].clone());
                if self.last_rename.as_ref() != Some(&pair) {
                    out.extend(self.flush());
                    out.extend(self.renamed(pair.0, pair.1));
                }
            }
            // Platforms that report each side of a rename separately without
            // saying which is which: the side that still exists is the target.
            EventKind::Modify(ModifyKind::Name(_)) => {
                if path.exists() {
                    out.extend(self.arrived(path));
                } else {
                    out.extend(self.flush());
                    self.rename_from = Some(path.clone());
                }
            }
            EventKind::Create(kind) => {
                out.extend(self.flush());
                let op = match kind {
                    CreateKind::Folder => FsOp::Mkdir,
                    CreateKind::File => FsOp::Create,
                    _ if path.is_dir() => FsOp::Mkdir,
                    _ => FsOp::Create,
                };
                out.push(FsEvent::new(op, path.clone()));
            }
            EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
                out.extend(self.flush());
                if !path.is_dir() {
                    out.push(FsEvent::new(FsOp::Modify, path.clone()));
                }
            }
            EventKind::Remove(_) => {
                out.extend(self.flush());
                out.push(FsEvent::new(FsOp::Remove, path.clone()));
            }
            _ => {}
        }
        out.retain(|e| !is_ignored(&e.path));
        out
    }

    fn arrived(&mut self, to: &Path) -> Vec<FsEvent> {
        match self.rename_from.take() {
            Some(from) => self.renamed(from, to.to_path_buf()),
            None => {
                let op = if to.is_dir() { FsOp::Mkdir } else { FsOp::Create };
                vec![FsEvent::new(op, to)]
            }
        }
    }

    fn renamed(&mut self, from: PathBuf, to: PathBuf) -> Vec<FsEvent> {
        self.last_rename = Some((from.clone(), to.clone()));
        match (is_ignored(&from), is_ignored(&to)) {
            (false, _) => vec![FsEvent::rename(from, to)],
            // A scratch file moved over its target is a content change.
            (true, false) => vec![FsEvent::new(FsOp::Modify, to)],
            (true, true) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::RemoveKind;

    fn event(kind: EventKind, paths: &[&Path]) -> Event {
        let mut event = Event::new(kind);
        for path in paths {
            event = event.add_path(path.to_path_buf());
        }
        event
    }

    fn rename(mode: RenameMode) -> EventKind {
        EventKind::Modify(ModifyKind::Name(mode))
    }

    #[test]
    fn creations_split_files_and_folders() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let file = dir.path().join("a.txt");

        let mut n = EventNormalizer::default();
        let out = n.push(&event(EventKind::Create(CreateKind::Any), &[&sub]));
        assert_eq!(out, vec![FsEvent::new(FsOp::Mkdir, &sub)]);
        let out = n.push(&event(EventKind::Create(CreateKind::File), &[&file]));
        assert_eq!(out, vec![FsEvent::new(FsOp::Create, &file)]);
    }

    #[test]
    fn from_to_pair_is_one_rename_and_both_is_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("old.txt");
        let to = dir.path().join("new.txt");

        let mut n = EventNormalizer::default();
        assert!(n.push(&event(rename(RenameMode::From), &[&from])).is_empty());
        assert!(n.has_pending());
        let out = n.push(&event(rename(RenameMode::To), &[&to]));
        assert_eq!(out, vec![FsEvent::rename(&from, &to)]);
        assert!(n
            .push(&event(rename(RenameMode::Both), &[&from, &to]))
            .is_empty());
    }

    #[test]
    fn unmatched_source_becomes_remove() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("moved-away.txt");

        let mut n = EventNormalizer::default();
        assert!(n.push(&event(rename(RenameMode::Any), &[&gone])).is_empty());
        assert_eq!(n.flush(), vec![FsEvent::new(FsOp::Remove, &gone)]);
        assert!(!n.has_pending());
    }

    #[test]
    fn unmatched_destination_becomes_create() {
        let dir = tempfile::tempdir().unwrap();
        let arrived = dir.path().join("moved-in.txt");
        std::fs::write(&arrived, b"x").unwrap();

        let mut n = EventNormalizer::default();
        let out = n.push(&event(rename(RenameMode::Any), &[&arrived]));
        assert_eq!(out, vec![FsEvent::new(FsOp::Create, &arrived)]);
    }

    #[test]
    fn metadata_and_artifacts_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        let mut n = EventNormalizer::default();
        let chmod = EventKind::Modify(ModifyKind::Metadata(notify::event::MetadataKind::Permissions));
        assert!(n.push(&event(chmod, &[&file])).is_empty());
        let ds = dir.path().join(".DS_Store");
        assert!(n
            .push(&event(EventKind::Create(CreateKind::File), &[&ds]))
            .is_empty());
        let scratch = dir.path().join("a.txt.dirsync-tmp");
        assert!(n
            .push(&event(EventKind::Remove(RemoveKind::File), &[&scratch]))
            .is_empty());
    }

    #[test]
    fn scratch_file_moved_over_target_is_modify() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("a.txt.dirsync-tmp");
        let target = dir.path().join("a.txt");
        let mut n = EventNormalizer::default();
        let out = n.push(&event(rename(RenameMode::Both), &[&scratch, &target]));
        assert_eq!(out, vec![FsEvent::new(FsOp::Modify, &target)]);
    }

    #[test]
    fn data_changes_become_modify() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        let mut n = EventNormalizer::default();
        let kind = EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Content));
        assert_eq!(
            n.push(&event(kind, &[&file])),
            vec![FsEvent::new(FsOp::Modify, &file)]
        );
        assert_eq!(
            n.push(&event(EventKind::Remove(RemoveKind::Any), &[&file])),
            vec![FsEvent::new(FsOp::Remove, &file)]
        );
    }

    #[test]
    fn queued_modifies_of_one_file_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        let modify = |p: &Path| FsEvent::new(FsOp::Modify, p);

        let mut ready = VecDeque::new();
        enqueue(&mut ready, vec![modify(&a), modify(&a), modify(&b), modify(&a)]);
        assert_eq!(ready, [modify(&a), modify(&b)]);

        // Once delivered, a later write must still be reported.
        ready.clear();
        enqueue(&mut ready, vec![modify(&a)]);
        assert_eq!(ready.len(), 1);

        // A rename in between means the queued Modify no longer covers `a`.
        let c = dir.path().join("c.bin");
        enqueue(&mut ready, vec![FsEvent::rename(&a, &c), modify(&a)]);
        assert_eq!(ready, [modify(&a), FsEvent::rename(&a, &c), modify(&a)]);
    }
}
