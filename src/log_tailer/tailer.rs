use log::{debug, error, info, trace, warn};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs::{File, Metadata};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::error_handling::types::TailError;
use crate::log_parsing::{LineWindow, LogParser, LogRecord};

/// Device and inode of the followed file, used to detect replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(metadata: &Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    #[cfg(not(unix))]
    fn of(_metadata: &Metadata) -> Option<Self> {
        None
    }
}

/// Follows a live relay log and turns appended lines into [`LogRecord`]s.
///
/// Reading starts at the end of the file; nothing written before
/// [`LogTailer::open`] is replayed. A trailing line without its newline is
/// kept until the rest of it arrives.
///
/// The tailer gives up with [`TailError::FileUnavailable`] when the file is
/// deleted, replaced or truncated: the relay started a new log and the
/// caller has to locate it again.
pub struct LogTailer {
    path: PathBuf,
    file: File,
    identity: Option<FileIdentity>,
    position: u64,
    /// Bytes of the unfinished last line, decoded once its newline arrives.
    partial: Vec<u8>,
    window: LineWindow,
    parser: LogParser,
}

impl LogTailer {
    pub fn open(path: impl Into<PathBuf>, parser: LogParser) -> Result<Self, TailError> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| {
            error!("Unable to open log file {}: {}", path.display(), e);
            TailError::LogFileNotFound(format!("{}: {}", path.display(), e))
        })?;
        let metadata = file.metadata()?;
        let position = metadata.len();

        info!("Following {} from offset {}", path.display(), position);
        Ok(Self {
            path,
            file,
            identity: FileIdentity::of(&metadata),
            position,
            partial: Vec::new(),
            window: LineWindow::default(),
            parser,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Complete lines appended since the previous call.
    pub fn read_new_lines(&mut self) -> Result<Vec<String>, TailError> {
        self.check_available()?;

        self.file.seek(SeekFrom::Start(self.position))?;
        let mut buffer = Vec::new();
        let read = self.file.read_to_end(&mut buffer)?;
        if read == 0 {
            return Ok(Vec::new());
        }
        self.position += read as u64;
        self.partial.extend_from_slice(&buffer);

        let Some(last_newline) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        let unfinished = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, unfinished);

        let lines: Vec<String> = complete[..last_newline]
            .split(|b| *b == b'\n')
            .map(|line| {
                String::from_utf8_lossy(line)
                    .trim_end_matches('\r')
                    .to_string()
            })
            .collect();
        trace!("Read {} new line(s) from {}", lines.len(), self.path.display());
        Ok(lines)
    }

    /// Parses the lines appended since the previous call.
    pub fn poll(&mut self) -> Result<Vec<LogRecord>, TailError> {
        let mut records = Vec::new();
        for line in self.read_new_lines()? {
            let record = self.window.push(&line);
            if let Some(parsed) = self.parser.parse_record(&record) {
                debug!("Log event {}: {}", parsed.event.kind(), parsed.raw);
                records.push(parsed);
            }
        }
        Ok(records)
    }

    /// Forwards records until `shutdown` flips or the file goes away.
    ///
    /// File notifications trigger immediate reads; `poll_interval` bounds the
    /// latency when notifications are missed or unavailable.
    pub async fn run(
        mut self,
        records: mpsc::Sender<LogRecord>,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TailError> {
        let (watcher_tx, mut watcher_rx) = mpsc::channel::<Result<Event, notify::Error>>(100);
        let _watcher = match self.watch(watcher_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("File watcher unavailable, polling only: {}", e);
                None
            }
        };

        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(res) = watcher_rx.recv() => {
                    match res {
                        Ok(event) if self.concerns(&event) => self.forward(&records).await?,
                        Ok(_) => {}
                        Err(e) => warn!("File watcher error: {}", e),
                    }
                }
                _ = ticker.tick() => self.forward(&records).await?,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Stopped following {}", self.path.display());
        Ok(())
    }

    fn watch(
        &self,
        tx: mpsc::Sender<Result<Event, notify::Error>>,
    ) -> Result<RecommendedWatcher, TailError> {
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                // a missed notification is covered by the next poll
                let _ = tx.try_send(res);
            },
            Config::default(),
        )?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        debug!("Watching directory {}", dir.display());
        Ok(watcher)
    }

    fn concerns(&self, event: &Event) -> bool {
        let name = self.path.file_name();
        event
            .paths
            .iter()
            .any(|p| p == &self.path || (name.is_some() && p.file_name() == name))
    }

    async fn forward(&mut self, records: &mpsc::Sender<LogRecord>) -> Result<(), TailError> {
        for record in self.poll()? {
            records
                .send(record)
                .await
                .map_err(|_| TailError::ChannelClosed)?;
        }
        Ok(())
    }

    fn check_available(&self) -> Result<(), TailError> {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) => {
                error!("Log file {} disappeared: {}", self.path.display(), e);
                return Err(TailError::FileUnavailable(self.path.clone()));
            }
        };

        if FileIdentity::of(&metadata) != self.identity {
            error!("Log file {} was replaced", self.path.display());
            return Err(TailError::FileUnavailable(self.path.clone()));
        }
        if metadata.len() < self.position {
            error!("Log file {} was truncated", self.path.display());
            return Err(TailError::FileUnavailable(self.path.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_parsing::LogEvent;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    const USAGE: &str = "session 001: usage: realm=<testrealm>, username=<alice>, rp=1, rb=2, sp=3, sb=4\n";

    fn append(path: &Path, text: &str) {
        append_bytes(path, text.as_bytes());
    }

    fn append_bytes(path: &Path, bytes: &[u8]) {
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
    }

    fn tailer_for(dir: &TempDir, history: &str) -> (PathBuf, LogTailer) {
        let path = dir.path().join("turn_1234_2024-01-01.log");
        std::fs::write(&path, history).unwrap();
        let tailer = LogTailer::open(&path, LogParser::new().unwrap()).unwrap();
        (path, tailer)
    }

    #[test]
    fn test_history_is_not_replayed() {
        let dir = TempDir::new().unwrap();
        let (_path, mut tailer) = tailer_for(&dir, USAGE);

        assert!(tailer.poll().unwrap().is_empty());
    }

    #[test]
    fn test_appended_lines_become_records() {
        let dir = TempDir::new().unwrap();
        let (path, mut tailer) = tailer_for(&dir, "startup noise\n");

        append(&path, "more noise\n");
        append(&path, USAGE);
        let records = tailer.poll().unwrap();

        assert_eq!(records.len(), 1);
        assert!(matches!(records[0].event, LogEvent::Usage { .. }));
    }

    #[test]
    fn test_partial_line_waits_for_newline() {
        let dir = TempDir::new().unwrap();
        let (path, mut tailer) = tailer_for(&dir, "");

        let (head, tail) = USAGE.split_at(20);
        append(&path, head);
        assert!(tailer.read_new_lines().unwrap().is_empty());

        append(&path, tail);
        let lines = tailer.read_new_lines().unwrap();
        assert_eq!(lines, vec![USAGE.trim_end().to_string()]);
    }

    #[test]
    fn test_character_split_across_reads_survives() {
        let dir = TempDir::new().unwrap();
        let (path, mut tailer) = tailer_for(&dir, "");
        let line = "session 001: usage: realm=<café>, username=<zoé>, rp=1, rb=2, sp=3, sb=4\n";
        let bytes = line.as_bytes();
        // cut inside the two-byte encoding of the first é
        let cut = line.find('é').unwrap() + 1;

        append_bytes(&path, &bytes[..cut]);
        assert!(tailer.poll().unwrap().is_empty());
        append_bytes(&path, &bytes[cut..]);
        let records = tailer.poll().unwrap();

        assert_eq!(records.len(), 1);
        match &records[0].event {
            LogEvent::Usage { realm, user, .. } => {
                assert_eq!(realm, "café");
                assert_eq!(user, "zoé");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_multi_line_record_across_polls() {
        let dir = TempDir::new().unwrap();
        let (path, mut tailer) = tailer_for(&dir, "");

        append(
            &path,
            "IPv4. New UDP endpoint: local addr 10.0.0.1:3478, remote addr 203.0.113.5:54321\n",
        );
        assert!(tailer.poll().unwrap().is_empty());

        append(
            &path,
            "session 001: realm <testrealm> user <>: incoming packet message processed, error 401: Unauthorized\n",
        );
        let records = tailer.poll().unwrap();

        assert_eq!(
            records.into_iter().map(|r| r.event).collect::<Vec<_>>(),
            vec![LogEvent::Client {
                realm: "testrealm".into(),
                ip: "203.0.113.5".into()
            }]
        );
    }

    #[test]
    fn test_deleted_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (path, mut tailer) = tailer_for(&dir, "");

        std::fs::remove_file(&path).unwrap();

        assert!(matches!(
            tailer.poll(),
            Err(TailError::FileUnavailable(_))
        ));
    }

    #[test]
    fn test_truncated_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (path, mut tailer) = tailer_for(&dir, "a fairly long history line\n");

        std::fs::write(&path, "").unwrap();

        assert!(matches!(
            tailer.poll(),
            Err(TailError::FileUnavailable(_))
        ));
    }

    #[test]
    fn test_missing_file_cannot_be_opened() {
        let dir = TempDir::new().unwrap();
        let result = LogTailer::open(dir.path().join("turn_1.log"), LogParser::new().unwrap());
        assert!(matches!(result, Err(TailError::LogFileNotFound(_))));
    }

    #[tokio::test]
    async fn test_run_streams_records_and_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let (path, tailer) = tailer_for(&dir, USAGE);
        let (tx, mut rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(tailer.run(tx, Duration::from_millis(20), stop_rx));

        append(&path, USAGE);
        let record = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no record received")
            .unwrap();
        assert!(matches!(record.event, LogEvent::Usage { .. }));

        stop_tx.send(true).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_run_reports_deleted_file() {
        let dir = TempDir::new().unwrap();
        let (path, tailer) = tailer_for(&dir, "");
        let (tx, _rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(tailer.run(tx, Duration::from_millis(20), stop_rx));
        std::fs::remove_file(&path).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("tailer kept running")
            .unwrap();
        assert!(matches!(result, Err(TailError::FileUnavailable(_))));
    }
}
