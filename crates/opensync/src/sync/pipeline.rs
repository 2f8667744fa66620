//! Directory-polling sync pipeline.
//!
//! The storage card shows up as a directory. Every poll lists the flight
//! logs in it; a log is sent once its size has not changed between two
//! polls, since the avionics unit keeps appending to the active log for the
//! whole flight.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::note::UNKNOWN_ORIGIN;
use super::{FlightNote, LogNamePattern, TransferGate, Uplink};
use crate::error::Result;
use crate::storage::Storage;

/// Default time between directory polls.
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(10);

/// A flight log seen on a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    name: String,
    path: PathBuf,
    size: u64,
}

/// Outcome of [`FileSyncPipeline::send_paths`], by file name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SendSummary {
    /// Logs handed to the uplink.
    pub sent: Vec<String>,
    /// Logs the ledger already had.
    pub skipped: Vec<String>,
    /// Logs or paths that could not be sent.
    pub failed: Vec<String>,
}

/// Watches a directory and forwards finished flight logs over an uplink.
#[derive(Debug)]
pub struct FileSyncPipeline {
    watch_dir: PathBuf,
    pattern: LogNamePattern,
    poll_period: Duration,
    force: bool,
    ledger: Storage,
    uplink: Arc<dyn Uplink>,
    gate: Arc<TransferGate>,
    /// Last observed size of each unsent log.
    pending: HashMap<String, u64>,
    /// Logs re-sent in this run when `force` is set.
    resent: HashSet<String>,
}

impl FileSyncPipeline {
    /// Create a pipeline over `watch_dir`.
    #[must_use]
    pub fn new(
        watch_dir: impl Into<PathBuf>,
        pattern: LogNamePattern,
        ledger: Storage,
        uplink: Arc<dyn Uplink>,
    ) -> Self {
        Self {
            watch_dir: watch_dir.into(),
            pattern,
            poll_period: DEFAULT_POLL_PERIOD,
            force: false,
            ledger,
            uplink,
            gate: Arc::new(TransferGate::new()),
            pending: HashMap::new(),
            resent: HashSet::new(),
        }
    }

    /// Set the time between polls.
    #[must_use]
    pub fn with_poll_period(mut self, poll_period: Duration) -> Self {
        self.poll_period = poll_period;
        self
    }

    /// Send every log once more in this run, even if the ledger has it.
    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// The admission gate, which is also the pipeline's control surface.
    #[must_use]
    pub fn gate(&self) -> Arc<TransferGate> {
        self.gate.clone()
    }

    /// The transfer ledger.
    #[must_use]
    pub fn ledger(&self) -> &Storage {
        &self.ledger
    }

    /// Watched directory.
    #[must_use]
    pub fn watch_dir(&self) -> &Path {
        &self.watch_dir
    }

    fn needs_send(&self, name: &str) -> Result<bool> {
        if self.force {
            return Ok(!self.resent.contains(name));
        }
        Ok(!self.ledger.is_sent(name)?)
    }

    /// Poll the directory once and send every log whose size has settled.
    ///
    /// Returns the number of logs sent. A failed transfer is logged and
    /// retried on a later poll.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed or the ledger
    /// cannot be queried.
    pub async fn poll_once(&mut self) -> Result<usize> {
        if self.gate.is_paused() {
            return Ok(0);
        }

        let candidates = scan(&self.watch_dir, &self.pattern).await?;
        self.pending
            .retain(|name, _| candidates.iter().any(|c| &c.name == name));
        debug!(
            files = candidates.len(),
            pending = self.pending.len(),
            "polled watch directory"
        );

        let mut sent = 0;
        for candidate in candidates {
            if !self.needs_send(&candidate.name)? {
                self.pending.remove(&candidate.name);
                continue;
            }

            match self.pending.insert(candidate.name.clone(), candidate.size) {
                Some(previous) if previous == candidate.size => {}
                Some(previous) => {
                    debug!(
                        file = %candidate.name,
                        previous,
                        size = candidate.size,
                        "flight log still growing"
                    );
                    continue;
                }
                None => {
                    debug!(file = %candidate.name, size = candidate.size, "new flight log");
                    continue;
                }
            }

            let Some(permit) = self.gate.begin() else {
                debug!("sync pipeline paused, not starting new transfers");
                break;
            };
            match self.transfer(&candidate).await {
                Ok(()) => {
                    self.pending.remove(&candidate.name);
                    sent += 1;
                }
                Err(e) => warn!(file = %candidate.name, error = %e, "transfer failed, will retry"),
            }
            drop(permit);
        }
        Ok(sent)
    }

    async fn transfer(&mut self, candidate: &Candidate) -> Result<()> {
        let payload = tokio::fs::read(&candidate.path).await?;
        let origin = self
            .pattern
            .origin(&candidate.name)
            .unwrap_or_else(|| UNKNOWN_ORIGIN.to_string());
        let note = FlightNote::new(&candidate.name, origin, &payload);

        info!(
            file = %note.file_name,
            origin = %note.origin,
            size = note.size_bytes,
            hash = note.short_hash(),
            "sending flight log"
        );
        self.uplink.send(&note, &payload).await?;
        self.ledger.mark_sent(&note)?;
        if self.force {
            self.resent.insert(note.file_name);
        }
        Ok(())
    }

    /// Send the given files, and the flight logs inside the given
    /// directories, right away.
    ///
    /// Offline mode for logs copied off the card by hand: there is no size
    /// settling and the gate is not consulted. Files named explicitly are
    /// sent even if their name does not match the pattern; their origin is
    /// then unknown. The ledger still suppresses repeats unless `force` is
    /// set.
    ///
    /// # Errors
    ///
    /// Returns an error only if the ledger cannot be queried. Unreadable
    /// paths and failed transfers are reported in the summary.
    pub async fn send_paths(&mut self, paths: &[PathBuf]) -> Result<SendSummary> {
        let mut summary = SendSummary::default();
        let mut candidates = Vec::new();

        for path in paths {
            match tokio::fs::metadata(path).await {
                Ok(metadata) if metadata.is_dir() => match scan(path, &self.pattern).await {
                    Ok(found) => candidates.extend(found),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "cannot list directory");
                        summary.failed.push(path.display().to_string());
                    }
                },
                Ok(metadata) => match path.file_name().and_then(|n| n.to_str()) {
                    Some(name) => candidates.push(Candidate {
                        name: name.to_string(),
                        path: path.clone(),
                        size: metadata.len(),
                    }),
                    None => summary.failed.push(path.display().to_string()),
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot read path");
                    summary.failed.push(path.display().to_string());
                }
            }
        }
        candidates.sort_by(|a, b| a.name.cmp(&b.name));

        for candidate in candidates {
            if !self.needs_send(&candidate.name)? {
                info!(file = %candidate.name, "already sent");
                summary.skipped.push(candidate.name);
                continue;
            }
            match self.transfer(&candidate).await {
                Ok(()) => summary.sent.push(candidate.name),
                Err(e) => {
                    warn!(file = %candidate.name, error = %e, "transfer failed");
                    summary.failed.push(candidate.name);
                }
            }
        }
        Ok(summary)
    }

    /// Poll until the gate is paused.
    ///
    /// # Errors
    ///
    /// Poll errors are logged, not returned; the signature leaves room for
    /// startup failures.
    pub async fn run(mut self) -> Result<()> {
        info!(
            dir = %self.watch_dir.display(),
            period_secs = self.poll_period.as_secs(),
            force = self.force,
            "Starting sync pipeline"
        );

        let gate = self.gate.clone();
        let mut ticker = interval(self.poll_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = gate.paused() => break,
            }
            match self.poll_once().await {
                Ok(0) => {}
                Ok(sent) => info!(sent, "flight logs sent"),
                Err(e) => warn!(error = %e, "poll failed"),
            }
        }

        info!("Sync pipeline stopped");
        Ok(())
    }
}

/// List the flight logs in `dir`, sorted by name. A missing directory is
/// an unmounted card, not an error.
async fn scan(dir: &Path, pattern: &LogNamePattern) -> Result<Vec<Candidate>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "watch directory not mounted");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !pattern.matches(&name) {
            continue;
        }
        let metadata = entry.metadata().await?;
        if metadata.is_file() {
            found.push(Candidate {
                name,
                path: entry.path(),
                size: metadata.len(),
            });
        }
    }
    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::sync::{DrainOutcome, DrainRequest, SyncControl};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    const PATTERN: &str = r"log_\d+_\d+_(.*)\.csv";

    #[derive(Debug, Default)]
    struct RecordingUplink {
        sent: Mutex<Vec<FlightNote>>,
        delay: Duration,
        failures: AtomicU32,
    }

    impl RecordingUplink {
        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        fn names(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|n| n.file_name.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Uplink for RecordingUplink {
        async fn send(&self, note: &FlightNote, _payload: &[u8]) -> Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::uplink(&note.file_name, "notecard busy"));
            }
            self.sent.lock().unwrap().push(note.clone());
            Ok(())
        }
    }

    struct Scratch(PathBuf);

    impl Scratch {
        fn new(name: &str) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "opensync-pipeline-{name}-{}",
                std::process::id()
            ));
            let _ = std::fs::remove_dir_all(&dir);
            std::fs::create_dir_all(&dir).unwrap();
            Self(dir)
        }

        fn write(&self, name: &str, contents: &str) {
            std::fs::write(self.0.join(name), contents).unwrap();
        }
    }

    impl Drop for Scratch {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    fn pipeline(dir: &Scratch, uplink: Arc<RecordingUplink>) -> FileSyncPipeline {
        FileSyncPipeline::new(
            &dir.0,
            LogNamePattern::new(PATTERN).unwrap(),
            Storage::open_in_memory().unwrap(),
            uplink,
        )
    }

    #[tokio::test]
    async fn test_sent_after_size_settles() {
        let dir = Scratch::new("settle");
        dir.write("log_230514_093012_KBED.csv", "a,b\n");
        let uplink = Arc::new(RecordingUplink::default());
        let mut p = pipeline(&dir, uplink.clone());

        assert_eq!(p.poll_once().await.unwrap(), 0);
        assert_eq!(p.poll_once().await.unwrap(), 1);

        assert_eq!(uplink.names(), vec!["log_230514_093012_KBED.csv"]);
        assert!(p.ledger().is_sent("log_230514_093012_KBED.csv").unwrap());
        let record = p.ledger().get("log_230514_093012_KBED.csv").unwrap().unwrap();
        assert_eq!(record.origin, "KBED");
    }

    #[tokio::test]
    async fn test_growing_log_waits() {
        let dir = Scratch::new("growing");
        dir.write("log_1_1_KBOS.csv", "a\n");
        let uplink = Arc::new(RecordingUplink::default());
        let mut p = pipeline(&dir, uplink.clone());

        p.poll_once().await.unwrap();
        dir.write("log_1_1_KBOS.csv", "a\nb\n");
        assert_eq!(p.poll_once().await.unwrap(), 0);
        assert_eq!(p.poll_once().await.unwrap(), 1);
        assert_eq!(uplink.sent.lock().unwrap()[0].size_bytes, 4);
    }

    #[tokio::test]
    async fn test_sent_logs_not_resent() {
        let dir = Scratch::new("resend");
        dir.write("log_1_1_KBOS.csv", "a\n");
        let uplink = Arc::new(RecordingUplink::default());
        let mut p = pipeline(&dir, uplink.clone());

        for _ in 0..5 {
            p.poll_once().await.unwrap();
        }
        assert_eq!(uplink.names().len(), 1);
    }

    #[tokio::test]
    async fn test_force_resends_once() {
        let dir = Scratch::new("force");
        dir.write("log_1_1_KBOS.csv", "a\n");
        let uplink = Arc::new(RecordingUplink::default());
        let mut p = pipeline(&dir, uplink.clone()).with_force(true);
        p.ledger()
            .mark_sent(&FlightNote::new("log_1_1_KBOS.csv", "KBOS", b"a\n"))
            .unwrap();

        for _ in 0..5 {
            p.poll_once().await.unwrap();
        }
        assert_eq!(uplink.names().len(), 1);
    }

    #[tokio::test]
    async fn test_other_files_ignored() {
        let dir = Scratch::new("ignored");
        dir.write("airframe_info.csv", "x\n");
        dir.write("log_1_1_KBOS.csv.partial", "x\n");
        std::fs::create_dir(dir.0.join("log_1_2_KBOS.csv")).unwrap();
        let uplink = Arc::new(RecordingUplink::default());
        let mut p = pipeline(&dir, uplink.clone());

        p.poll_once().await.unwrap();
        p.poll_once().await.unwrap();
        assert!(uplink.names().is_empty());
    }

    #[tokio::test]
    async fn test_send_paths_directory_and_file() {
        let dir = Scratch::new("offline");
        dir.write("log_1_2_KBOS.csv", "b\n");
        dir.write("log_1_1_KBED.csv", "a\n");
        dir.write("notes.txt", "x\n");
        let loose = Scratch::new("offline-loose");
        loose.write("flight.csv", "c\n");
        let uplink = Arc::new(RecordingUplink::default());
        let mut p = pipeline(&dir, uplink.clone());

        let summary = p
            .send_paths(&[dir.0.clone(), loose.0.join("flight.csv")])
            .await
            .unwrap();

        assert_eq!(
            summary.sent,
            vec!["flight.csv", "log_1_1_KBED.csv", "log_1_2_KBOS.csv"]
        );
        assert!(summary.skipped.is_empty());
        assert!(summary.failed.is_empty());
        let record = p.ledger().get("flight.csv").unwrap().unwrap();
        assert_eq!(record.origin, UNKNOWN_ORIGIN);
        assert_eq!(uplink.names().len(), 3);
    }

    #[tokio::test]
    async fn test_send_paths_skips_sent_unless_forced() {
        let dir = Scratch::new("offline-force");
        dir.write("log_1_1_KBED.csv", "a\n");
        let uplink = Arc::new(RecordingUplink::default());
        let mut p = pipeline(&dir, uplink.clone());
        p.ledger()
            .mark_sent(&FlightNote::new("log_1_1_KBED.csv", "KBED", b"a\n"))
            .unwrap();

        let summary = p.send_paths(&[dir.0.clone()]).await.unwrap();
        assert_eq!(summary.skipped, vec!["log_1_1_KBED.csv"]);
        assert!(uplink.names().is_empty());

        let mut p = p.with_force(true);
        let summary = p.send_paths(&[dir.0.clone()]).await.unwrap();
        assert_eq!(summary.sent, vec!["log_1_1_KBED.csv"]);
    }

    #[tokio::test]
    async fn test_send_paths_reports_failures() {
        let dir = Scratch::new("offline-fail");
        dir.write("log_1_1_KBED.csv", "a\n");
        let uplink = Arc::new(RecordingUplink::default());
        uplink.failures.store(1, Ordering::SeqCst);
        let mut p = pipeline(&dir, uplink.clone());
        let missing = dir.0.join("nope.csv");

        let summary = p
            .send_paths(&[missing.clone(), dir.0.join("log_1_1_KBED.csv")])
            .await
            .unwrap();
        assert_eq!(
            summary.failed,
            vec![missing.display().to_string(), "log_1_1_KBED.csv".to_string()]
        );
        assert!(!p.ledger().is_sent("log_1_1_KBED.csv").unwrap());
    }

    #[tokio::test]
    async fn test_missing_watch_dir_is_not_an_error() {
        let dir = Scratch::new("missing");
        let uplink = Arc::new(RecordingUplink::default());
        let mut p = FileSyncPipeline::new(
            dir.0.join("not-mounted"),
            LogNamePattern::new(PATTERN).unwrap(),
            Storage::open_in_memory().unwrap(),
            uplink,
        );
        assert_eq!(p.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_transfer_retried() {
        let dir = Scratch::new("retry");
        dir.write("log_1_1_KBOS.csv", "a\n");
        let uplink = Arc::new(RecordingUplink::default());
        uplink.failures.store(1, Ordering::SeqCst);
        let mut p = pipeline(&dir, uplink.clone());

        p.poll_once().await.unwrap();
        assert_eq!(p.poll_once().await.unwrap(), 0);
        assert!(!p.ledger().is_sent("log_1_1_KBOS.csv").unwrap());
        assert_eq!(p.poll_once().await.unwrap(), 1);
        assert_eq!(p.gate().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_paused_pipeline_starts_nothing() {
        let dir = Scratch::new("paused");
        dir.write("log_1_1_KBOS.csv", "a\n");
        let uplink = Arc::new(RecordingUplink::default());
        let mut p = pipeline(&dir, uplink.clone());

        p.poll_once().await.unwrap();
        p.gate().pause().await;
        assert_eq!(p.poll_once().await.unwrap(), 0);
        assert!(uplink.names().is_empty());
    }

    #[tokio::test]
    async fn test_drain_waits_for_transfer() {
        let dir = Scratch::new("drain");
        dir.write("log_1_1_KBOS.csv", "a\n");
        dir.write("log_1_2_KBOS.csv", "b\n");
        let uplink = Arc::new(RecordingUplink::slow(Duration::from_millis(200)));
        let mut p = pipeline(&dir, uplink.clone());
        let gate = p.gate();

        p.poll_once().await.unwrap();
        let task = tokio::spawn(async move {
            let sent = p.poll_once().await.unwrap();
            (p, sent)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gate.in_flight(), 1);

        let outcome = gate
            .drain(DrainRequest::within(Duration::from_secs(5)))
            .await;
        assert_eq!(outcome, DrainOutcome::Completed);

        let (p, sent) = task.await.unwrap();
        // The transfer in progress finished, the second log was never started.
        assert_eq!(sent, 1);
        assert!(p.ledger().is_sent("log_1_1_KBOS.csv").unwrap());
        assert!(!p.ledger().is_sent("log_1_2_KBOS.csv").unwrap());
    }

    #[tokio::test]
    async fn test_drain_times_out_on_stuck_uplink() {
        let dir = Scratch::new("stuck");
        dir.write("log_1_1_KBOS.csv", "a\n");
        let uplink = Arc::new(RecordingUplink::slow(Duration::from_secs(30)));
        let mut p = pipeline(&dir, uplink);
        let gate = p.gate();

        p.poll_once().await.unwrap();
        let task = tokio::spawn(async move { p.poll_once().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outcome = gate
            .drain(DrainRequest::within(Duration::from_millis(100)))
            .await;
        assert_eq!(outcome, DrainOutcome::TimedOut { in_flight: 1 });
        task.abort();
    }

    #[tokio::test]
    async fn test_run_stops_when_paused() {
        let dir = Scratch::new("run");
        let uplink = Arc::new(RecordingUplink::default());
        let p = pipeline(&dir, uplink).with_poll_period(Duration::from_millis(20));
        let gate = p.gate();
        let task = tokio::spawn(p.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.pause().await;
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
