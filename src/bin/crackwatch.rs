//! crackwatch - structural defect inspection
//!
//! `inspect` runs one image through the pipeline and reports on it.
//! `watch` polls a camera and reports on operator request.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, IsTerminal};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use crackwatch::config::CrackwatchConfig;
use crackwatch::detect::build_detector;
use crackwatch::ingest::{open_source, CameraPoller};
use crackwatch::notify::SmtpMailer;
use crackwatch::report::ChatCompletionsClient;
use crackwatch::{
    AggregationSession, DetectionAdapter, EpisodePolicy, EvidenceStore, Frame,
    NotificationDispatcher, Pipeline, PipelineError, PipelineHandle, PipelineOptions,
    ReportGenerator, StatusUpdate,
};

#[path = "../ui.rs"]
mod ui;

const CONTROL_TICK: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(author, version, about = "Detect cracks and spalling, report on defect episodes")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Override the significance threshold in [0, 1].
    #[arg(long, global = true)]
    threshold: Option<f32>,

    /// UI mode for stderr progress (auto|plain|pretty).
    #[arg(long, global = true, default_value = "auto", value_name = "MODE")]
    ui: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect a single image.
    Inspect {
        image: PathBuf,
        /// Mail the report even if the image is not significant.
        #[arg(long)]
        send: bool,
        /// Only print the summary; never contact the report service.
        #[arg(long, conflicts_with = "send")]
        no_report: bool,
    },
    /// Poll a camera. Reads `send`, `report`, `reset`, `status`, `quit` from stdin.
    Watch {
        /// Camera device or `stub://` source (defaults to the configured one).
        #[arg(long)]
        device: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Control {
    Send,
    Report,
    Reset,
    Status,
    Quit,
}

impl Control {
    fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "send" | "s" => Some(Self::Send),
            "report" | "p" => Some(Self::Report),
            "reset" | "r" => Some(Self::Reset),
            "status" => Some(Self::Status),
            "quit" | "q" | "exit" => Some(Self::Quit),
            _ => None,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let mut config = {
        let _stage = ui.stage("Load configuration");
        CrackwatchConfig::load()?
    };
    if let Some(threshold) = args.threshold {
        config.policy.threshold = threshold;
    }

    match args.command {
        Command::Inspect {
            image,
            send,
            no_report,
        } => inspect(&ui, &config, image, send, no_report),
        Command::Watch { device } => {
            let device = device.unwrap_or_else(|| config.camera.device.clone());
            watch(&ui, &config, &device)
        }
    }
}

fn build_pipeline(
    ui: &ui::Ui,
    config: &CrackwatchConfig,
    auto_report: bool,
) -> Result<(PipelineHandle, Receiver<StatusUpdate>, bool)> {
    let adapter = {
        let _stage = ui.stage("Load detector");
        DetectionAdapter::new(build_detector(&config.detector)?)
    };
    let policy = EpisodePolicy::new(config.policy.threshold)?;
    let session = AggregationSession::new(policy, EvidenceStore::new(&config.evidence_dir))
        .capture_annotated(config.policy.capture_annotated);

    let client = ChatCompletionsClient::from_settings(&config.report);
    let reporter = ReportGenerator::new(Arc::new(client), &config.report);

    let dispatcher = match &config.mail {
        Some(mail) => match SmtpMailer::from_settings(mail) {
            Ok(mailer) => Some(NotificationDispatcher::new(
                Box::new(mailer),
                mail.from.clone(),
                mail.to.clone(),
            )),
            Err(err) => {
                log::warn!("mail dispatch unavailable: {}", err);
                None
            }
        },
        None => {
            log::info!("no mail relay configured; reports are printed only");
            None
        }
    };
    let can_dispatch = dispatcher.is_some();

    let options = PipelineOptions {
        auto_report,
        subject_prefix: config.report.subject_prefix.clone(),
    };
    let (handle, status) =
        Pipeline::new(adapter, session, reporter, dispatcher, options).spawn();
    Ok((handle, status, can_dispatch))
}

fn inspect(
    ui: &ui::Ui,
    config: &CrackwatchConfig,
    image: PathBuf,
    send: bool,
    no_report: bool,
) -> Result<()> {
    let frame = Frame::load(&image)?;
    let auto_report = config.report.auto_on_detection && !no_report && !send;
    let (handle, status, can_dispatch) = build_pipeline(ui, config, auto_report)?;
    if send && !can_dispatch {
        return Err(anyhow!(
            "--send needs a mail relay: configure [mail] or CRACKWATCH_SMTP_HOST and the SMTP password"
        ));
    }

    let mut stage = ui.stage("Run detection");
    handle.submit(frame)?;

    let mut failure: Option<anyhow::Error> = None;
    while let Ok(update) = status.recv() {
        match update {
            StatusUpdate::FrameProcessed {
                summary,
                significant,
                evidence,
            } => {
                drop(stage);
                stage = ui.stage("Summarize");
                ui.summary(&summary);
                if let Some(path) = evidence {
                    ui.status(&format!("evidence saved: {}", path.display()));
                }
                let awaiting_report = if send {
                    handle.send_report()?;
                    true
                } else {
                    auto_report && significant
                };
                if !awaiting_report {
                    break;
                }
            }
            StatusUpdate::Warning(PipelineError::Detection(err)) => {
                stage.fail();
                failure = Some(anyhow!("detection failed for {}: {}", image.display(), err));
                break;
            }
            StatusUpdate::Warning(err) => ui.status(&format!("warning: {}", err)),
            StatusUpdate::ReportStarted { attachments } => {
                drop(stage);
                stage = ui.stage(&format!("Generate report ({} attachment(s))", attachments));
            }
            StatusUpdate::ReportCompleted { report, dispatched } => {
                print_report(ui, &report.subject, &report.narrative, dispatched);
                break;
            }
            StatusUpdate::ReportFailed(err) => {
                stage.fail();
                failure = Some(err.into());
                break;
            }
            StatusUpdate::ReportBusy => {}
            StatusUpdate::EpisodeReset { .. } | StatusUpdate::SourceFailed(_) => {}
            StatusUpdate::Stopped => break,
        }
    }
    drop(stage);
    handle.shutdown()?;
    match failure {
        Some(err) => Err(err.context("report cycle failed")),
        None => Ok(()),
    }
}

fn watch(ui: &ui::Ui, config: &CrackwatchConfig, device: &str) -> Result<()> {
    let (handle, status, can_dispatch) = build_pipeline(ui, config, false)?;
    let source = open_source(device, &config.camera)
        .with_context(|| format!("no frame source for {}", device))?;
    let poller = CameraPoller::new(config.camera.poll_interval).spawn(source, handle.intake());
    ui.status(&format!(
        "watching {} every {}ms; commands: send, report, reset, status, quit",
        poller.device(),
        config.camera.poll_interval.as_millis()
    ));
    if !can_dispatch {
        ui.status("mail is not configured; `send` will fail, `report` only prints");
    }

    let (control_tx, control_rx) = mpsc::channel();
    let ctrlc_tx = control_tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(Control::Quit);
    })
    .context("error setting Ctrl-C handler")?;
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match Control::parse(&line) {
                Some(control) => {
                    if control_tx.send(control).is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => eprintln!("unknown command '{}'", line.trim()),
            }
        }
    });

    loop {
        match control_rx.recv_timeout(CONTROL_TICK) {
            Ok(Control::Send) => handle.send_report()?,
            Ok(Control::Report) => handle.request_report()?,
            Ok(Control::Reset) => handle.reset()?,
            Ok(Control::Status) => {
                let snapshot = handle.snapshot();
                ui.status(&format!(
                    "episode {}: {} frame(s) processed, {} dropped, {} evidence file(s){}",
                    snapshot.episode,
                    snapshot.frames_processed,
                    handle.frames_dropped(),
                    snapshot.evidence.len(),
                    if handle.report_in_flight() {
                        ", report in flight"
                    } else {
                        ""
                    }
                ));
                ui.summary(&snapshot.reportable_summary);
            }
            Ok(Control::Quit) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        for update in status.try_iter() {
            print_update(ui, update);
        }
    }

    ui.status("stopping…");
    let exit = poller.stop()?;
    log::info!("camera poller exit: {:?}", exit);
    handle.shutdown()?;
    for update in status.try_iter() {
        print_update(ui, update);
    }
    Ok(())
}

fn print_update(ui: &ui::Ui, update: StatusUpdate) {
    match update {
        StatusUpdate::FrameProcessed {
            summary,
            significant,
            evidence,
        } => {
            if significant {
                ui.summary(&summary);
            }
            if let Some(path) = evidence {
                ui.status(&format!("evidence saved: {}", path.display()));
            }
        }
        StatusUpdate::Warning(err) => ui.status(&format!("warning: {}", err)),
        StatusUpdate::ReportStarted { attachments } => ui.status(&format!(
            "generating report with {} attachment(s)…",
            attachments
        )),
        StatusUpdate::ReportCompleted { report, dispatched } => {
            print_report(ui, &report.subject, &report.narrative, dispatched)
        }
        StatusUpdate::ReportFailed(err) => ui.status(&format!("report failed: {}", err)),
        StatusUpdate::ReportBusy => ui.status("a report is already in progress"),
        StatusUpdate::EpisodeReset { episode } => {
            ui.status(&format!("reset; starting episode {}", episode))
        }
        StatusUpdate::SourceFailed(err) => {
            ui.status(&format!("camera stopped: {}", err));
        }
        StatusUpdate::Stopped => {}
    }
}

fn print_report(ui: &ui::Ui, subject: &str, narrative: &str, dispatched: bool) {
    ui.status(subject);
    ui.status(narrative);
    if dispatched {
        ui.status("report mailed; evidence cleared");
    }
}
