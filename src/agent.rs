use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::mpsc::Receiver,
    thread::{self, JoinHandle},
};

use thiserror::Error;
use tracing::{error, info};

use crate::{
    config::{Config, ConfigError},
    record::{Record, StatusReport},
    tail::Sinks,
    watcher::RotationWatcher,
};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("couldn't spawn trailing thread for {path}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Set of trailing threads, one per configured file.
///
/// All threads deliver into the same pair of queues. A thread ends once the record receiver is dropped and its file
/// sees another event, so dropping the receivers and then joining shuts the agent down.
pub struct Agent {
    handles: Vec<(PathBuf, JoinHandle<()>)>,
}

impl Agent {
    pub fn start(config: &Config) -> Result<(Self, Receiver<Record>, Receiver<StatusReport>), AgentError> {
        config.validate()?;
        let options = config.tail_options();
        let (sinks, records, status) = Sinks::unbounded();

        let mut handles = Vec::with_capacity(config.logs.len());
        for log in &config.logs {
            let emitter = log.emitter(&config.field_name)?;
            let path = log.file.clone();
            let sinks = sinks.clone();
            let options = options.clone();
            let handle = thread::Builder::new()
                .name(format!("trail:{}", log.tag))
                .spawn({
                    let path = path.clone();
                    move || match RotationWatcher::start(&path, emitter, sinks, options) {
                        Ok(watcher) => watcher.run(),
                        Err(e) => error!(path = %path.display(), error = ?e, "couldn't start trailing"),
                    }
                })
                .map_err(|source| AgentError::Spawn {
                    path: path.clone(),
                    source,
                })?;
            info!(path = %path.display(), tag = %log.tag, "started trailing thread");
            handles.push((path, handle));
        }
        Ok((Self { handles }, records, status))
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every trailing thread to stop
    pub fn join(self) {
        for (path, handle) in self.handles {
            if handle.join().is_err() {
                error!(path = %path.display(), "trailing thread panicked");
            }
        }
    }
}

/// Latest reported position of every tailed file
#[derive(Debug, Default, Clone)]
pub struct StatusBoard {
    positions: BTreeMap<(PathBuf, String), u64>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, report: StatusReport) {
        self.positions.insert((report.path, report.tag), report.position);
    }

    pub fn position(&self, path: &Path, tag: &str) -> Option<u64> {
        self.positions
            .get(&(path.to_path_buf(), tag.to_string()))
            .copied()
    }

    /// Consume reports until every sender is gone
    pub fn follow(&mut self, reports: &Receiver<StatusReport>) {
        for report in reports {
            self.update(report);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &str, u64)> {
        self.positions
            .iter()
            .map(|((path, tag), position)| (path.as_path(), tag.as_str(), *position))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs::{File, OpenOptions},
        io::Write,
        time::Duration,
    };

    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;
    use crate::{cursor::CursorStore, identity::FileIdentity};

    fn report(path: &str, tag: &str, position: u64) -> StatusReport {
        StatusReport {
            path: PathBuf::from(path),
            tag: tag.to_string(),
            position,
        }
    }

    #[test]
    fn board_keeps_latest_position() {
        let mut board = StatusBoard::new();
        board.update(report("/a.log", "a", 10));
        board.update(report("/b.log", "b", 3));
        board.update(report("/a.log", "a", 25));
        assert_eq!(board.position(Path::new("/a.log"), "a"), Some(25));
        assert_eq!(board.position(Path::new("/b.log"), "b"), Some(3));
        assert_eq!(board.position(Path::new("/c.log"), "c"), None);
        assert_eq!(board.iter().count(), 2);
    }

    #[rstest]
    #[case("a", Some(7))]
    #[case("other", Some(1))]
    #[case("unknown", None)]
    fn same_path_with_different_tags_is_tracked_apart(#[case] tag: &str, #[case] expected: Option<u64>) {
        let mut board = StatusBoard::new();
        board.update(report("/a.log", "a", 7));
        board.update(report("/a.log", "other", 1));
        assert_eq!(board.position(Path::new("/a.log"), tag), expected);
    }

    #[test]
    fn board_follows_until_senders_are_gone() {
        let (sinks, _records, status) = Sinks::unbounded();
        sinks.status.send(report("/a.log", "a", 4)).unwrap();
        sinks.status.send(report("/a.log", "a", 9)).unwrap();
        drop(sinks);
        let mut board = StatusBoard::new();
        board.follow(&status);
        assert_eq!(board.position(Path::new("/a.log"), "a"), Some(9));
    }

    #[test]
    fn invalid_config_is_rejected_before_spawning() {
        let config = Config::from_args("t", &[], "message");
        assert!(matches!(
            Agent::start(&config),
            Err(AgentError::Config(ConfigError::NoLogs))
        ));
    }

    #[test]
    fn records_of_configured_files_are_delivered() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("app.log");
        File::create(&path)?.write_all(b"old\n")?;
        // a sidecar at offset 0 makes the existing content a backlog to ship on start
        CursorStore::open(&path, FileIdentity::of_path(&path)?)?;

        let config = Config::from_args("app", &[path.clone()], "message");
        let (agent, records, status) = Agent::start(&config)?;
        assert_eq!(agent.len(), 1);

        let record = records.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(record.tag, "app");
        assert_eq!(record.fields["message"], "old");

        OpenOptions::new().append(true).open(&path)?.write_all(b"new\n")?;
        let record = records.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(record.fields["message"], "new");

        let mut last = 0;
        while let Ok(report) = status.try_recv() {
            last = report.position;
        }
        assert!(last >= 4);
        Ok(())
    }
}
