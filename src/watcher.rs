use std::{
    io,
    path::{Path, PathBuf},
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    time::Duration,
};

use notify::{
    event::ModifyKind, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    identity::FileIdentity,
    path_utils::{names_same_entry, parent_dir, resolve_absolute},
    record::RecordEmitter,
    tail::{Sinks, StartPosition, TailError, TailOptions, TailReader},
};

/// Notification about the watched directory, reduced to what matters for one target file
#[derive(Debug)]
pub enum WatchEvent {
    /// Target was created or written to
    ContentChanged,
    /// Target was removed, renamed away or had something renamed onto it
    TargetReplaced,
    /// Event about another entry of the directory, or one that cannot change content
    Unrelated,
    /// The notification channel itself failed
    SubscriptionError(notify::Error),
}

impl WatchEvent {
    /// Classify a raw notification for `target`
    pub fn classify(event: &Event, target: &Path) -> Self {
        if !event.paths.iter().any(|path| names_same_entry(path, target)) {
            return WatchEvent::Unrelated;
        }
        match event.kind {
            EventKind::Access(_) => WatchEvent::Unrelated,
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
                WatchEvent::TargetReplaced
            }
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any | EventKind::Other => {
                WatchEvent::ContentChanged
            }
        }
    }
}

/// Non-recursive subscription to change notifications of one directory
pub struct Subscription {
    dir: PathBuf,
    watcher: RecommendedWatcher,
    events: Receiver<notify::Result<Event>>,
}

impl Subscription {
    pub fn new(dir: impl AsRef<Path>) -> notify::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let (tx, events) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        Ok(Self {
            dir,
            watcher,
            events,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Drop and recreate the directory watch
    pub fn resubscribe(&mut self) -> notify::Result<()> {
        if let Err(e) = self.watcher.unwatch(&self.dir) {
            debug!(dir = %self.dir.display(), error = %e, "unwatch before resubscribe failed");
        }
        self.watcher.watch(&self.dir, RecursiveMode::NonRecursive)
    }

    /// Block until the next notification. `None` once the notification source is gone.
    pub fn next_event(&self, target: &Path) -> Option<WatchEvent> {
        self.events.recv().ok().map(|res| Self::reduce(res, target))
    }

    /// Like `next_event`, giving up after `timeout`
    pub fn next_event_timeout(&self, target: &Path, timeout: Duration) -> Option<WatchEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(res) => Some(Self::reduce(res, target)),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    fn reduce(res: notify::Result<Event>, target: &Path) -> WatchEvent {
        match res {
            Ok(event) => WatchEvent::classify(&event, target),
            Err(e) => WatchEvent::SubscriptionError(e),
        }
    }
}

/// Fatal outcomes of starting a watcher
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("couldn't resolve path to trail")]
    Resolve(#[source] io::Error),
    #[error("couldn't watch events of {dir}")]
    Subscribe {
        dir: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("couldn't trail file")]
    Open(#[from] TailError),
}

/// Keeps one `TailReader` pointed at a path across rotation and truncation.
///
/// The parent directory is watched rather than the file itself, since creation, removal and renames are only
/// reported reliably at directory level. On a write the reader checks for truncation and drains new content. When
/// the file is removed, renamed away or replaced, the old reader is drained to its end and closed, and a new one is
/// opened from the beginning of whatever file now sits at the path. If the path is missing at that moment, the
/// watcher waits for the next notification naming it.
pub struct RotationWatcher {
    path: PathBuf,
    emitter: RecordEmitter,
    sinks: Sinks,
    options: TailOptions,
    subscription: Subscription,
    reader: Option<TailReader>,
}

impl RotationWatcher {
    /// Subscribes to the parent directory of `path` and opens it in tail mode.
    ///
    /// Content that accumulated since a previous run (per the sidecar) is drained right away.
    pub fn start(
        path: impl AsRef<Path>,
        emitter: RecordEmitter,
        sinks: Sinks,
        options: TailOptions,
    ) -> Result<Self, WatchError> {
        let path = resolve_absolute(path).map_err(WatchError::Resolve)?;
        let dir = parent_dir(&path);
        info!(dir = %dir.display(), "watching events of directory");
        let subscription = Subscription::new(&dir).map_err(|source| WatchError::Subscribe {
            dir: dir.clone(),
            source,
        })?;

        info!(path = %path.display(), "trying to trail file");
        let reader = TailReader::open(
            &path,
            emitter.clone(),
            sinks.clone(),
            options.clone(),
            StartPosition::Tail,
        )?;
        let mut watcher = Self {
            path,
            emitter,
            sinks,
            options,
            subscription,
            reader: Some(reader),
        };
        watcher.drain_current()?;
        Ok(watcher)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reader currently attached to the path, `None` while waiting for the path to reappear
    pub fn reader(&self) -> Option<&TailReader> {
        self.reader.as_ref()
    }

    /// Handle notifications until the record queue is closed or the notification source disappears
    pub fn run(mut self) {
        while let Some(event) = self.subscription.next_event(&self.path) {
            if self.handle(event).is_err() {
                info!(path = %self.path.display(), "record queue closed, stop trailing");
                return;
            }
        }
        warn!(path = %self.path.display(), "notification source is gone, stop trailing");
    }

    /// Handle at most one notification, waiting up to `timeout` for it.
    ///
    /// Returns whether a notification was handled.
    pub fn poll(&mut self, timeout: Duration) -> Result<bool, TailError> {
        match self.subscription.next_event_timeout(&self.path, timeout) {
            Some(event) => self.handle(event).map(|_| true),
            None => Ok(false),
        }
    }

    /// Only a closed record queue is returned as an error; everything else is logged and absorbed.
    fn handle(&mut self, event: WatchEvent) -> Result<(), TailError> {
        match event {
            WatchEvent::Unrelated => Ok(()),
            WatchEvent::ContentChanged => self.on_content_changed(),
            WatchEvent::TargetReplaced => self.on_replaced(),
            WatchEvent::SubscriptionError(e) => {
                warn!(dir = %self.subscription.dir().display(), error = %e, "watch error, resubscribing");
                if let Err(e) = self.subscription.resubscribe() {
                    error!(dir = %self.subscription.dir().display(), error = %e, "resubscribe failed");
                }
                Ok(())
            }
        }
    }

    fn on_content_changed(&mut self) -> Result<(), TailError> {
        let Some(current) = self.reader.as_ref().map(TailReader::identity) else {
            return self.reopen();
        };
        if matches!(FileIdentity::of_path(&self.path), Ok(live) if live != current) {
            return self.rotate();
        }
        if let Some(reader) = self.reader.as_mut() {
            let truncated = reader.restrict_to_current_size();
            absorb(&self.path, truncated)?;
        }
        self.drain_current()
    }

    fn on_replaced(&mut self) -> Result<(), TailError> {
        let current = self.reader.as_ref().map(TailReader::identity);
        match (current, FileIdentity::of_path(&self.path)) {
            // already following the file that now sits at the path
            (Some(current), Ok(live)) if live == current => self.on_content_changed(),
            _ => self.rotate(),
        }
    }

    fn rotate(&mut self) -> Result<(), TailError> {
        if let Some(mut reader) = self.reader.take() {
            info!(
                path = %self.path.display(),
                identity = %reader.identity(),
                "file was rotated, draining it before reopening"
            );
            let drained = reader
                .drain()
                .and_then(|_| reader.flush_pending().map(|_| ()));
            absorb(&self.path, drained)?;
            absorb(&self.path, reader.close())?;
        }
        self.reopen()
    }

    fn reopen(&mut self) -> Result<(), TailError> {
        let opened = TailReader::open(
            &self.path,
            self.emitter.clone(),
            self.sinks.clone(),
            self.options.clone(),
            StartPosition::Head,
        );
        match opened {
            Ok(reader) => {
                self.reader = Some(reader);
                self.drain_current()
            }
            Err(e) => {
                info!(path = %self.path.display(), error = %e, "file is not available, waiting for it");
                Ok(())
            }
        }
    }

    fn drain_current(&mut self) -> Result<(), TailError> {
        if let Some(reader) = self.reader.as_mut() {
            let drained = reader.drain();
            absorb(&self.path, drained)?;
        }
        Ok(())
    }
}

/// Log a failed step and carry on, unless the record queue is gone
fn absorb<T>(path: &Path, result: Result<T, TailError>) -> Result<Option<T>, TailError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(TailError::SinkClosed) => Err(TailError::SinkClosed),
        Err(e) => {
            error!(path = %path.display(), error = %e, "tailing step failed");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs::OpenOptions,
        io::Write,
        sync::mpsc::Receiver,
        time::Instant,
    };

    use notify::event::{CreateKind, DataChange, RemoveKind, RenameMode};
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;
    use crate::record::{Format, Record};

    const TARGET: &str = "/var/log/app.log";

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |event, path| event.add_path(PathBuf::from(path)))
    }

    #[rstest]
    #[case(EventKind::Modify(ModifyKind::Data(DataChange::Any)), &[TARGET], "changed")]
    #[case(EventKind::Create(CreateKind::File), &[TARGET], "changed")]
    #[case(EventKind::Any, &[TARGET], "changed")]
    #[case(EventKind::Remove(RemoveKind::File), &[TARGET], "replaced")]
    #[case(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &[TARGET], "replaced")]
    #[case(EventKind::Modify(ModifyKind::Name(RenameMode::To)), &[TARGET], "replaced")]
    #[case(
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
        &[TARGET, "/var/log/app.log.1"],
        "replaced"
    )]
    #[case(EventKind::Modify(ModifyKind::Data(DataChange::Any)), &["/var/log/other.log"], "unrelated")]
    #[case(EventKind::Remove(RemoveKind::File), &["/var/log/app.log.pos"], "unrelated")]
    #[case(EventKind::Access(notify::event::AccessKind::Any), &[TARGET], "unrelated")]
    fn notifications_are_classified(
        #[case] kind: EventKind,
        #[case] paths: &[&str],
        #[case] expected: &str,
    ) {
        let classified = WatchEvent::classify(&event(kind, paths), Path::new(TARGET));
        let name = match classified {
            WatchEvent::ContentChanged => "changed",
            WatchEvent::TargetReplaced => "replaced",
            WatchEvent::Unrelated => "unrelated",
            WatchEvent::SubscriptionError(_) => "error",
        };
        assert_eq!(name, expected);
    }

    struct Scratch {
        dir: TempDir,
        path: PathBuf,
        records: Receiver<Record>,
    }

    impl Scratch {
        fn new(initial: &[u8]) -> (Self, RotationWatcher) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("app.log");
            std::fs::write(&path, initial).unwrap();
            let (sinks, records, _status) = Sinks::unbounded();
            let emitter = RecordEmitter::new("test", "message", Format::None);
            let watcher =
                RotationWatcher::start(&path, emitter, sinks, TailOptions::default()).unwrap();
            (Self { dir, path, records }, watcher)
        }

        fn append(&self, content: &[u8]) {
            let mut file = OpenOptions::new().append(true).open(&self.path).unwrap();
            file.write_all(content).unwrap();
        }

        fn emitted(&self) -> Vec<String> {
            self.records
                .try_iter()
                .map(|record| record.fields["message"].as_str().unwrap().to_string())
                .collect()
        }

        /// Handle notifications until `count` lines were emitted or a deadline passes
        fn collect(&self, watcher: &mut RotationWatcher, count: usize) -> Vec<String> {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut lines = vec![];
            while lines.len() < count && Instant::now() < deadline {
                watcher.poll(Duration::from_millis(100)).unwrap();
                lines.extend(self.emitted());
            }
            lines
        }
    }

    #[test]
    fn existing_content_is_skipped_and_appends_are_emitted() {
        let (scratch, mut watcher) = Scratch::new(b"old\n");
        assert_eq!(watcher.reader().unwrap().position(), 4);
        scratch.append(b"new\nnewer\n");
        assert_eq!(scratch.collect(&mut watcher, 2), vec!["new", "newer"]);
    }

    #[test]
    fn rotation_drains_old_file_and_follows_new_one() {
        let (scratch, mut watcher) = Scratch::new(b"");
        let old_identity = watcher.reader().unwrap().identity();
        scratch.append(b"before\n");
        std::fs::rename(&scratch.path, scratch.dir.path().join("app.log.1")).unwrap();
        std::fs::write(&scratch.path, b"after\n").unwrap();

        assert_eq!(scratch.collect(&mut watcher, 2), vec!["before", "after"]);
        let reader = watcher.reader().unwrap();
        assert_ne!(reader.identity(), old_identity);
        assert_eq!(reader.position(), 6);
    }

    #[test]
    fn removed_file_is_picked_up_when_recreated() {
        let (scratch, mut watcher) = Scratch::new(b"");
        std::fs::remove_file(&scratch.path).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while watcher.reader().is_some() && Instant::now() < deadline {
            watcher.poll(Duration::from_millis(100)).unwrap();
        }
        assert!(watcher.reader().is_none());

        std::fs::write(&scratch.path, b"reborn\n").unwrap();
        assert_eq!(scratch.collect(&mut watcher, 1), vec!["reborn"]);
    }

    #[test]
    fn subscription_error_keeps_reader_state() {
        let (scratch, mut watcher) = Scratch::new(b"");
        scratch.append(b"partial");
        let deadline = Instant::now() + Duration::from_secs(5);
        while watcher.reader().unwrap().position() < 7 && Instant::now() < deadline {
            watcher.poll(Duration::from_millis(100)).unwrap();
        }
        assert_eq!(watcher.reader().unwrap().position(), 7);
        watcher
            .handle(WatchEvent::SubscriptionError(notify::Error::generic("boom")))
            .unwrap();
        scratch.append(b" line\n");
        assert_eq!(scratch.collect(&mut watcher, 1), vec!["partial line"]);
    }

    #[test]
    fn truncated_file_is_followed_from_its_new_end() {
        let (scratch, mut watcher) = Scratch::new(b"");
        scratch.append(b"aaaa\nbbbb\n");
        assert_eq!(scratch.collect(&mut watcher, 2), vec!["aaaa", "bbbb"]);

        OpenOptions::new()
            .write(true)
            .open(&scratch.path)
            .unwrap()
            .set_len(5)
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while watcher.reader().unwrap().position() != 5 && Instant::now() < deadline {
            watcher.poll(Duration::from_millis(100)).unwrap();
        }
        assert_eq!(watcher.reader().unwrap().position(), 5);

        scratch.append(b"c\n");
        assert_eq!(scratch.collect(&mut watcher, 1), vec!["c"]);
        assert_eq!(watcher.reader().unwrap().position(), 7);
    }

    #[test]
    fn content_change_on_replaced_file_is_a_rotation() {
        let (scratch, mut watcher) = Scratch::new(b"");
        let old_identity = watcher.reader().unwrap().identity();
        scratch.append(b"before\n");
        std::fs::rename(&scratch.path, scratch.dir.path().join("app.log.1")).unwrap();
        std::fs::write(&scratch.path, b"after\n").unwrap();

        watcher.handle(WatchEvent::ContentChanged).unwrap();
        assert_eq!(scratch.emitted(), vec!["before", "after"]);
        let reader = watcher.reader().unwrap();
        assert_ne!(reader.identity(), old_identity);
        assert_eq!(reader.identity(), FileIdentity::of_path(&scratch.path).unwrap());
        assert_eq!(reader.position(), 6);
    }

    #[test]
    fn rename_event_for_unchanged_file_only_drains() {
        let (scratch, mut watcher) = Scratch::new(b"");
        let identity = watcher.reader().unwrap().identity();
        scratch.append(b"same\n");

        watcher.handle(WatchEvent::TargetReplaced).unwrap();
        assert_eq!(scratch.emitted(), vec!["same"]);
        let reader = watcher.reader().unwrap();
        assert_eq!(reader.identity(), identity);
        assert_eq!(reader.position(), 5);
    }

    #[test]
    fn backlog_from_previous_run_is_drained_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"seen\nunseen\n").unwrap();
        let identity = FileIdentity::of_path(&path).unwrap();
        std::fs::write(
            crate::path_utils::position_path(&path),
            format!("{identity}\t5\n"),
        )
        .unwrap();

        let (sinks, records, _status) = Sinks::unbounded();
        let emitter = RecordEmitter::new("test", "message", Format::None);
        let _watcher =
            RotationWatcher::start(&path, emitter, sinks, TailOptions::default()).unwrap();
        let lines: Vec<_> = records
            .try_iter()
            .map(|record| record.fields["message"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(lines, vec!["unseen"]);
    }

    #[test]
    fn missing_directory_aborts_start() {
        let (sinks, _records, _status) = Sinks::unbounded();
        let emitter = RecordEmitter::new("test", "message", Format::None);
        let result = RotationWatcher::start(
            "/nonexistent/filetrail/app.log",
            emitter,
            sinks,
            TailOptions::default(),
        );
        assert!(matches!(result, Err(WatchError::Subscribe { .. })));
    }
}
