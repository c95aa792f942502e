//! Pipeline worker.
//!
//! A dedicated thread owns the detector and the [`AggregationSession`].
//! Everything else talks to it through a bounded command channel and reads
//! results from a status channel or a shared snapshot. Report generation and
//! dispatch run on a separate worker thread, one cycle at a time, so a slow
//! HTTP or SMTP call never stalls frame processing.

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::aggregate::ClassSummary;
use crate::detect::DetectionAdapter;
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::ingest::FrameSink;
use crate::notify::NotificationDispatcher;
use crate::report::{Report, ReportGenerator};
use crate::session::{AggregationSession, SessionSnapshot};

const COMMAND_CAPACITY: usize = 1;

#[derive(Clone, Debug, Default)]
pub struct PipelineOptions {
    /// Start a report cycle as soon as a frame is significant.
    pub auto_report: bool,
    pub subject_prefix: String,
}

/// What the pipeline tells its observers.
#[derive(Debug)]
pub enum StatusUpdate {
    FrameProcessed {
        summary: Vec<ClassSummary>,
        significant: bool,
        evidence: Option<PathBuf>,
    },
    /// Non-fatal problem; the pipeline keeps running.
    Warning(PipelineError),
    ReportStarted {
        attachments: usize,
    },
    /// Narrative generated; `dispatched` tells whether it was mailed.
    ReportCompleted {
        report: Report,
        dispatched: bool,
    },
    ReportFailed(PipelineError),
    /// A report was requested while another cycle was still running.
    ReportBusy,
    EpisodeReset {
        episode: u32,
    },
    SourceFailed(PipelineError),
    Stopped,
}

enum Message {
    Frame(Frame),
    Report { dispatch: bool },
    Reset,
    SourceFailed(PipelineError),
    ReportFinished {
        episode: u32,
        dispatched: bool,
        result: Result<Report, PipelineError>,
    },
    Shutdown,
}

pub struct Pipeline {
    adapter: DetectionAdapter,
    session: AggregationSession,
    reporter: Arc<ReportGenerator>,
    dispatcher: Option<Arc<NotificationDispatcher>>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        adapter: DetectionAdapter,
        session: AggregationSession,
        reporter: ReportGenerator,
        dispatcher: Option<NotificationDispatcher>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            adapter,
            session,
            reporter: Arc::new(reporter),
            dispatcher: dispatcher.map(Arc::new),
            options,
        }
    }

    /// Start the worker thread.
    pub fn spawn(self) -> (PipelineHandle, Receiver<StatusUpdate>) {
        let (tx, rx) = mpsc::sync_channel(COMMAND_CAPACITY);
        let (status_tx, status_rx) = mpsc::channel();
        let snapshot = Arc::new(Mutex::new(self.session.snapshot()));
        let report_in_flight = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            pipeline: self,
            tx: tx.clone(),
            status: status_tx,
            snapshot: snapshot.clone(),
            report_in_flight: report_in_flight.clone(),
            report_thread: None,
        };
        let join = std::thread::spawn(move || worker.run(rx));

        let handle = PipelineHandle {
            intake: FrameIntake { tx, dropped },
            snapshot,
            report_in_flight,
            join: Some(join),
        };
        (handle, status_rx)
    }
}

/// Non-blocking frame entry point; clone it into capture threads.
#[derive(Clone)]
pub struct FrameIntake {
    tx: SyncSender<Message>,
    dropped: Arc<AtomicU64>,
}

impl FrameIntake {
    /// Hand a frame over unless the pipeline is busy, in which case the frame
    /// is dropped. Returns `false` once the pipeline has stopped.
    pub fn offer(&self, frame: Frame) -> bool {
        match self.tx.try_send(Message::Frame(frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FrameSink for FrameIntake {
    fn offer(&self, frame: Frame) -> bool {
        FrameIntake::offer(self, frame)
    }

    fn source_failed(&self, err: PipelineError) {
        let _ = self.tx.send(Message::SourceFailed(err));
    }
}

pub struct PipelineHandle {
    intake: FrameIntake,
    snapshot: Arc<Mutex<SessionSnapshot>>,
    report_in_flight: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn intake(&self) -> FrameIntake {
        self.intake.clone()
    }

    /// Queue a frame, waiting for room. Use for inputs that must not be lost.
    pub fn submit(&self, frame: Frame) -> Result<()> {
        self.command(Message::Frame(frame))
    }

    pub fn offer(&self, frame: Frame) -> bool {
        self.intake.offer(frame)
    }

    /// Generate a report and mail it with the episode's evidence.
    pub fn send_report(&self) -> Result<()> {
        self.command(Message::Report { dispatch: true })
    }

    /// Generate a report without dispatching it.
    pub fn request_report(&self) -> Result<()> {
        self.command(Message::Report { dispatch: false })
    }

    pub fn reset(&self) -> Result<()> {
        self.command(Message::Reset)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn report_in_flight(&self) -> bool {
        self.report_in_flight.load(Ordering::SeqCst)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.intake.frames_dropped()
    }

    /// Stop the worker after in-flight work completes.
    pub fn shutdown(mut self) -> Result<()> {
        let _ = self.intake.tx.send(Message::Shutdown);
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| anyhow!("pipeline worker thread panicked")),
            None => Ok(()),
        }
    }

    fn command(&self, message: Message) -> Result<()> {
        self.intake
            .tx
            .send(message)
            .map_err(|_| anyhow!("pipeline worker has stopped"))
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = self.intake.tx.send(Message::Shutdown);
            let _ = join.join();
        }
    }
}

struct Worker {
    pipeline: Pipeline,
    tx: SyncSender<Message>,
    status: Sender<StatusUpdate>,
    snapshot: Arc<Mutex<SessionSnapshot>>,
    report_in_flight: Arc<AtomicBool>,
    report_thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn run(mut self, rx: Receiver<Message>) {
        log::info!(
            "pipeline worker started (detector: {})",
            self.pipeline.adapter.backend_name()
        );
        if let Err(err) = self.pipeline.adapter.warm_up() {
            self.emit(StatusUpdate::Warning(err));
        }

        while let Ok(message) = rx.recv() {
            match message {
                Message::Frame(frame) => self.handle_frame(frame),
                Message::Report { dispatch } => self.start_report(dispatch),
                Message::Reset => {
                    self.pipeline.session.reset();
                    let episode = self.pipeline.session.evidence().episode();
                    log::info!("episode reset; now episode {}", episode);
                    self.publish_snapshot();
                    self.emit(StatusUpdate::EpisodeReset { episode });
                }
                Message::SourceFailed(err) => {
                    log::error!("{}", err);
                    self.emit(StatusUpdate::SourceFailed(err));
                }
                Message::ReportFinished {
                    episode,
                    dispatched,
                    result,
                } => self.finish_report(episode, dispatched, result),
                Message::Shutdown => break,
            }
        }

        // Let an in-flight cycle land before reporting that we stopped.
        if let Some(thread) = self.report_thread.take() {
            while self.in_flight() {
                match rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(Message::ReportFinished {
                        episode,
                        dispatched,
                        result,
                    }) => self.finish_report(episode, dispatched, result),
                    Ok(_) => {}
                    Err(RecvTimeoutError::Timeout) if thread.is_finished() => break,
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            if thread.join().is_err() {
                log::error!("report worker thread panicked");
            }
        }
        self.emit(StatusUpdate::Stopped);
        log::info!("pipeline worker stopped");
    }

    fn handle_frame(&mut self, frame: Frame) {
        let inference = match self.pipeline.adapter.infer(&frame) {
            Ok(inference) => inference,
            Err(err) => {
                log::warn!("{}", err);
                self.emit(StatusUpdate::Warning(err));
                return;
            }
        };

        let outcome = self.pipeline.session.process(&frame, &inference);
        for warning in outcome.warnings {
            self.emit(StatusUpdate::Warning(warning));
        }
        let significant = outcome.significant;
        self.publish_snapshot();
        self.emit(StatusUpdate::FrameProcessed {
            summary: outcome.summary,
            significant,
            evidence: outcome.evidence,
        });

        if significant && self.pipeline.options.auto_report && !self.in_flight() {
            let dispatch = self.pipeline.dispatcher.is_some();
            self.start_report(dispatch);
        }
    }

    fn start_report(&mut self, dispatch: bool) {
        if self.in_flight() {
            self.emit(StatusUpdate::ReportBusy);
            return;
        }
        let dispatcher = match (dispatch, &self.pipeline.dispatcher) {
            (true, Some(dispatcher)) => Some(dispatcher.clone()),
            (true, None) => {
                self.emit(StatusUpdate::ReportFailed(PipelineError::Configuration(
                    "mail is not configured; cannot dispatch the report".to_string(),
                )));
                return;
            }
            (false, _) => None,
        };
        if let Some(thread) = self.report_thread.take() {
            let _ = thread.join();
        }

        let session = &self.pipeline.session;
        let episode = session.evidence().episode();
        let summary = session.reportable_summary().to_vec();
        let attachments = session.evidence().list();
        let reporter = self.pipeline.reporter.clone();
        let prefix = self.pipeline.options.subject_prefix.clone();
        let tx = self.tx.clone();

        self.emit(StatusUpdate::ReportStarted {
            attachments: attachments.len(),
        });
        self.report_in_flight.store(true, Ordering::SeqCst);
        self.report_thread = Some(std::thread::spawn(move || {
            let result = run_report_cycle(
                &reporter,
                dispatcher.as_deref(),
                &prefix,
                &summary,
                attachments,
            );
            let _ = tx.send(Message::ReportFinished {
                episode,
                dispatched: dispatcher.is_some(),
                result,
            });
        }));
    }

    fn finish_report(
        &mut self,
        episode: u32,
        dispatched: bool,
        result: Result<Report, PipelineError>,
    ) {
        self.report_in_flight.store(false, Ordering::SeqCst);
        if let (true, Ok(report)) = (dispatched, &result) {
            if self.pipeline.session.evidence().episode() == episode {
                self.pipeline.session.acknowledge(report);
            } else {
                log::info!("episode {} was reset while its report was in flight", episode);
            }
        }
        self.publish_snapshot();
        match result {
            Ok(report) => {
                self.emit(StatusUpdate::ReportCompleted { report, dispatched });
            }
            Err(err) => {
                log::error!("report cycle failed: {}", err);
                self.emit(StatusUpdate::ReportFailed(err));
            }
        }
    }

    fn in_flight(&self) -> bool {
        self.report_in_flight.load(Ordering::SeqCst)
    }

    fn emit(&self, update: StatusUpdate) {
        let _ = self.status.send(update);
    }

    fn publish_snapshot(&self) {
        let snapshot = self.pipeline.session.snapshot();
        *self
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot;
    }
}

fn run_report_cycle(
    reporter: &ReportGenerator,
    dispatcher: Option<&NotificationDispatcher>,
    subject_prefix: &str,
    summary: &[ClassSummary],
    attachments: Vec<PathBuf>,
) -> Result<Report, PipelineError> {
    let narrative = reporter.generate(summary)?;
    let report = Report::compose(subject_prefix, summary, narrative, attachments);
    if let Some(dispatcher) = dispatcher {
        dispatcher.send(&report)?;
    }
    Ok(report)
}
