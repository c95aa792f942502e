//! Pipeline worker thread: frame intake, report cycles, evidence clearing.

use anyhow::{anyhow, Result};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crackwatch::config::ReportSettings;
use crackwatch::detect::ScriptedDetector;
use crackwatch::notify::MailSender;
use crackwatch::report::{Credential, NarrativeRequest};
use crackwatch::{
    AggregationSession, ClassNames, Detection, DetectionAdapter, EpisodePolicy, EvidenceStore,
    Frame, NarrativeGenerator, NotificationDispatcher, OutgoingMail, Pipeline, PipelineError,
    PipelineHandle, PipelineOptions, ReportGenerator, StatusUpdate,
};

const WAIT: Duration = Duration::from_secs(10);

struct CannedNarrative;

impl NarrativeGenerator for CannedNarrative {
    fn complete(&self, _api_key: &str, _request: &NarrativeRequest) -> Result<String> {
        Ok("Risk level: 90%".to_string())
    }
}

/// Blocks every request until the test releases it.
struct GatedNarrative {
    gate: Mutex<Receiver<()>>,
}

impl NarrativeGenerator for GatedNarrative {
    fn complete(&self, _api_key: &str, _request: &NarrativeRequest) -> Result<String> {
        self.gate
            .lock()
            .unwrap()
            .recv_timeout(WAIT)
            .map_err(|_| anyhow!("gate never opened"))?;
        Ok("Risk level: 40%".to_string())
    }
}

#[derive(Clone, Default)]
struct Outbox {
    sent: Arc<Mutex<Vec<OutgoingMail>>>,
    fail: bool,
}

impl MailSender for Outbox {
    fn send(&self, mail: &OutgoingMail) -> Result<()> {
        if self.fail {
            return Err(anyhow!("454 TLS not available"));
        }
        self.sent.lock().unwrap().push(mail.clone());
        Ok(())
    }
}

fn spawn(
    dir: &std::path::Path,
    narrative: Arc<dyn NarrativeGenerator>,
    outbox: Option<Outbox>,
    auto_report: bool,
) -> Result<(PipelineHandle, Receiver<StatusUpdate>)> {
    let adapter = DetectionAdapter::from_backend(ScriptedDetector::new(
        ClassNames::from_list(["crack", "spalling"]),
        vec![vec![Detection::new(0, 0.7), Detection::new(1, 0.95)]],
    ));
    let session = AggregationSession::new(EpisodePolicy::new(0.5)?, EvidenceStore::new(dir));
    let reporter = ReportGenerator::new(narrative, &ReportSettings::default())
        .with_credential(Credential::Provided("sk-test".to_string()));
    let dispatcher = outbox.map(|outbox| {
        NotificationDispatcher::new(
            Box::new(outbox),
            "watch@example.com",
            vec!["ops@example.com".to_string()],
        )
    });
    let options = PipelineOptions {
        auto_report,
        subject_prefix: "[test]".to_string(),
    };
    Ok(Pipeline::new(adapter, session, reporter, dispatcher, options).spawn())
}

/// Receive updates until one matches.
fn wait_for<F>(status: &Receiver<StatusUpdate>, mut matches: F) -> Result<StatusUpdate>
where
    F: FnMut(&StatusUpdate) -> bool,
{
    loop {
        let update = status
            .recv_timeout(WAIT)
            .map_err(|_| anyhow!("timed out waiting for pipeline status"))?;
        if matches(&update) {
            return Ok(update);
        }
    }
}

fn frame() -> Frame {
    Frame::filled(32, 24, [128, 128, 128])
}

#[test]
fn auto_report_dispatches_and_clears_evidence() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let outbox = Outbox::default();
    let (handle, status) = spawn(
        dir.path(),
        Arc::new(CannedNarrative),
        Some(outbox.clone()),
        true,
    )?;

    handle.submit(frame())?;
    let update = wait_for(&status, |u| {
        matches!(
            u,
            StatusUpdate::ReportCompleted { .. } | StatusUpdate::ReportFailed(_)
        )
    })?;
    match update {
        StatusUpdate::ReportCompleted { report, dispatched } => {
            assert!(dispatched);
            assert_eq!(
                report.subject,
                "[test] [HIGH RISK] structural defect report: 1 crack, 1 spalling"
            );
            assert_eq!(report.attachments.len(), 1);
        }
        other => return Err(anyhow!("unexpected update {:?}", other)),
    }

    assert!(handle.snapshot().evidence.is_empty());
    assert_eq!(handle.snapshot().episode, 2);
    assert_eq!(outbox.sent.lock().unwrap().len(), 1);
    handle.shutdown()?;
    Ok(())
}

#[test]
fn failed_dispatch_keeps_evidence() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let outbox = Outbox {
        fail: true,
        ..Outbox::default()
    };
    let (handle, status) = spawn(dir.path(), Arc::new(CannedNarrative), Some(outbox), false)?;

    handle.submit(frame())?;
    wait_for(&status, |u| matches!(u, StatusUpdate::FrameProcessed { .. }))?;
    handle.send_report()?;
    let update = wait_for(&status, |u| {
        matches!(
            u,
            StatusUpdate::ReportCompleted { .. } | StatusUpdate::ReportFailed(_)
        )
    })?;
    assert!(matches!(
        update,
        StatusUpdate::ReportFailed(PipelineError::Dispatch(_))
    ));

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.evidence.len(), 1);
    assert_eq!(snapshot.episode, 1);
    handle.shutdown()?;
    Ok(())
}

#[test]
fn send_without_mail_is_a_configuration_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (handle, status) = spawn(dir.path(), Arc::new(CannedNarrative), None, false)?;

    handle.submit(frame())?;
    wait_for(&status, |u| matches!(u, StatusUpdate::FrameProcessed { .. }))?;
    handle.send_report()?;
    let update = wait_for(&status, |u| matches!(u, StatusUpdate::ReportFailed(_)))?;
    assert!(matches!(
        update,
        StatusUpdate::ReportFailed(PipelineError::Configuration(_))
    ));
    assert_eq!(handle.snapshot().evidence.len(), 1);
    handle.shutdown()?;
    Ok(())
}

#[test]
fn narrative_only_report_keeps_evidence() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (handle, status) = spawn(dir.path(), Arc::new(CannedNarrative), None, true)?;

    handle.submit(frame())?;
    let update = wait_for(&status, |u| matches!(u, StatusUpdate::ReportCompleted { .. }))?;
    assert!(matches!(
        update,
        StatusUpdate::ReportCompleted {
            dispatched: false,
            ..
        }
    ));
    assert_eq!(handle.snapshot().evidence.len(), 1);
    handle.shutdown()?;
    Ok(())
}

#[test]
fn evidence_captured_during_a_report_survives_it() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (open_gate, gate) = mpsc::channel();
    let narrative = Arc::new(GatedNarrative {
        gate: Mutex::new(gate),
    });
    let (handle, status) = spawn(dir.path(), narrative, Some(Outbox::default()), false)?;

    handle.submit(frame())?;
    wait_for(&status, |u| matches!(u, StatusUpdate::FrameProcessed { .. }))?;
    handle.send_report()?;
    wait_for(&status, |u| {
        matches!(u, StatusUpdate::ReportStarted { attachments: 1 })
    })?;

    handle.submit(frame())?;
    let late = match wait_for(&status, |u| matches!(u, StatusUpdate::FrameProcessed { .. }))? {
        StatusUpdate::FrameProcessed {
            evidence: Some(path),
            ..
        } => path,
        other => return Err(anyhow!("expected captured frame, got {:?}", other)),
    };

    // A second request while the first is running is refused.
    handle.send_report()?;
    wait_for(&status, |u| matches!(u, StatusUpdate::ReportBusy))?;

    open_gate.send(())?;
    wait_for(&status, |u| matches!(u, StatusUpdate::ReportCompleted { .. }))?;

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.evidence, vec![late]);
    assert_eq!(snapshot.episode, 1);
    handle.shutdown()?;
    Ok(())
}

#[test]
fn reset_during_report_keeps_new_episode_evidence() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (open_gate, gate) = mpsc::channel();
    let narrative = Arc::new(GatedNarrative {
        gate: Mutex::new(gate),
    });
    let outbox = Outbox::default();
    let (handle, status) = spawn(dir.path(), narrative, Some(outbox.clone()), false)?;

    handle.submit(frame())?;
    wait_for(&status, |u| matches!(u, StatusUpdate::FrameProcessed { .. }))?;
    handle.send_report()?;
    wait_for(&status, |u| {
        matches!(u, StatusUpdate::ReportStarted { attachments: 1 })
    })?;

    handle.reset()?;
    wait_for(&status, |u| {
        matches!(u, StatusUpdate::EpisodeReset { episode: 2 })
    })?;
    handle.submit(frame())?;
    let fresh = match wait_for(&status, |u| matches!(u, StatusUpdate::FrameProcessed { .. }))? {
        StatusUpdate::FrameProcessed {
            evidence: Some(path),
            ..
        } => path,
        other => return Err(anyhow!("expected captured frame, got {:?}", other)),
    };
    assert!(fresh.ends_with("episode-0002-frame-0001.jpg"));

    open_gate.send(())?;
    let update = wait_for(&status, |u| matches!(u, StatusUpdate::ReportCompleted { .. }))?;
    assert!(matches!(
        update,
        StatusUpdate::ReportCompleted {
            dispatched: true,
            ..
        }
    ));

    // The episode 1 report went out, but episode 2 is left alone.
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.episode, 2);
    assert_eq!(snapshot.evidence, vec![fresh]);
    assert_eq!(outbox.sent.lock().unwrap().len(), 1);
    handle.shutdown()?;
    Ok(())
}

#[test]
fn requested_report_is_not_mailed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let outbox = Outbox::default();
    let (handle, status) = spawn(
        dir.path(),
        Arc::new(CannedNarrative),
        Some(outbox.clone()),
        false,
    )?;

    handle.submit(frame())?;
    wait_for(&status, |u| matches!(u, StatusUpdate::FrameProcessed { .. }))?;
    handle.request_report()?;
    let update = wait_for(&status, |u| {
        matches!(
            u,
            StatusUpdate::ReportCompleted { .. } | StatusUpdate::ReportFailed(_)
        )
    })?;
    assert!(matches!(
        update,
        StatusUpdate::ReportCompleted {
            dispatched: false,
            ..
        }
    ));
    assert!(outbox.sent.lock().unwrap().is_empty());
    assert_eq!(handle.snapshot().evidence.len(), 1);
    handle.shutdown()?;
    Ok(())
}

#[test]
fn reset_advances_the_episode() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (handle, status) = spawn(dir.path(), Arc::new(CannedNarrative), None, false)?;

    handle.submit(frame())?;
    wait_for(&status, |u| matches!(u, StatusUpdate::FrameProcessed { .. }))?;
    handle.reset()?;
    let update = wait_for(&status, |u| matches!(u, StatusUpdate::EpisodeReset { .. }))?;
    assert!(matches!(update, StatusUpdate::EpisodeReset { episode: 2 }));

    let snapshot = handle.snapshot();
    assert!(snapshot.evidence.is_empty());
    assert!(snapshot.summary.is_empty());
    assert_eq!(snapshot.frames_processed, 1);
    handle.shutdown()?;
    Ok(())
}

#[test]
fn shutdown_emits_stopped_and_refuses_commands() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (handle, status) = spawn(dir.path(), Arc::new(CannedNarrative), None, false)?;
    let intake = handle.intake();
    handle.shutdown()?;

    wait_for(&status, |u| matches!(u, StatusUpdate::Stopped))?;
    assert!(!intake.offer(frame()));
    Ok(())
}
