//! Camera polling task.
//!
//! One thread per source: open, pull a frame every tick, hand it to the sink,
//! release. The source is released on every exit path, including a panic in
//! the sink and a dropped handle.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::FrameSource;
use crate::error::PipelineError;
use crate::frame::Frame;

/// Receiver of polled frames.
pub trait FrameSink: Send {
    /// Offer a frame. Returns `false` once the receiver is gone.
    fn offer(&self, frame: Frame) -> bool;
    /// Report a terminal source failure.
    fn source_failed(&self, err: PipelineError);
}

/// Why the polling thread stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollExit {
    Stopped,
    EndOfStream,
    SinkClosed,
    OpenFailed,
    SourceFailed,
}

pub struct CameraPoller {
    interval: Duration,
}

pub struct PollerHandle {
    device: String,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<PollExit>>,
}

impl CameraPoller {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn spawn<S, K>(self, source: S, sink: K) -> PollerHandle
    where
        S: FrameSource + Send + 'static,
        K: FrameSink + 'static,
    {
        let device = source.describe();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let interval = self.interval;
        let join = std::thread::spawn(move || {
            let exit = poll_source(source, &sink, interval, &shutdown_thread);
            log::info!("camera poller stopped: {:?}", exit);
            exit
        });
        PollerHandle {
            device,
            shutdown,
            join: Some(join),
        }
    }
}

impl PollerHandle {
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    /// Signal the thread and wait for the source to be released.
    pub fn stop(mut self) -> Result<PollExit> {
        self.shutdown.store(true, Ordering::SeqCst);
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| anyhow!("camera poller thread panicked")),
            None => Ok(PollExit::Stopped),
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Releases the source when dropped.
struct Opened<S: FrameSource>(S);

impl<S: FrameSource> Drop for Opened<S> {
    fn drop(&mut self) {
        self.0.release();
    }
}

fn poll_source<S: FrameSource>(
    mut source: S,
    sink: &dyn FrameSink,
    interval: Duration,
    shutdown: &AtomicBool,
) -> PollExit {
    if let Err(err) = source.connect() {
        source.release();
        sink.source_failed(PipelineError::CameraOpen {
            device: source.describe(),
            source: err.into(),
        });
        return PollExit::OpenFailed;
    }
    let mut opened = Opened(source);

    loop {
        if shutdown.load(Ordering::SeqCst) {
            return PollExit::Stopped;
        }
        let tick = Instant::now();
        match opened.0.next_frame() {
            Ok(Some(frame)) => {
                if !sink.offer(frame) {
                    return PollExit::SinkClosed;
                }
            }
            Ok(None) => return PollExit::EndOfStream,
            Err(err) => {
                sink.source_failed(PipelineError::Source(err.into()));
                return PollExit::SourceFailed;
            }
        }
        if let Some(remaining) = interval.checked_sub(tick.elapsed()) {
            std::thread::sleep(remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[derive(Clone, Default)]
    struct Probe {
        connects: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
    }

    struct ProbeSource {
        probe: Probe,
        fail_open: bool,
        frames_left: Option<usize>,
    }

    impl FrameSource for ProbeSource {
        fn describe(&self) -> String {
            "probe://camera".to_string()
        }

        fn connect(&mut self) -> Result<()> {
            self.probe.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_open {
                Err(anyhow!("device busy"))
            } else {
                Ok(())
            }
        }

        fn next_frame(&mut self) -> Result<Option<Frame>> {
            match &mut self.frames_left {
                Some(0) => Ok(None),
                Some(left) => {
                    *left -= 1;
                    Ok(Some(Frame::filled(4, 4, [0, 0, 0])))
                }
                None => Ok(Some(Frame::filled(4, 4, [0, 0, 0]))),
            }
        }

        fn release(&mut self) {
            self.probe.releases.fetch_add(1, Ordering::SeqCst);
        }

        fn is_healthy(&self) -> bool {
            true
        }
    }

    fn wait_finished(handle: &PollerHandle) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    struct ChannelSink(mpsc::Sender<std::result::Result<Frame, PipelineError>>);

    impl FrameSink for ChannelSink {
        fn offer(&self, frame: Frame) -> bool {
            self.0.send(Ok(frame)).is_ok()
        }

        fn source_failed(&self, err: PipelineError) {
            let _ = self.0.send(Err(err));
        }
    }

    #[test]
    fn open_failure_is_reported_once() -> Result<()> {
        let probe = Probe::default();
        let (tx, rx) = mpsc::channel();
        let handle = CameraPoller::new(Duration::from_millis(1)).spawn(
            ProbeSource {
                probe: probe.clone(),
                fail_open: true,
                frames_left: None,
            },
            ChannelSink(tx),
        );
        assert_eq!(handle.stop()?, PollExit::OpenFailed);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            Err(PipelineError::CameraOpen { .. })
        ));
        assert_eq!(probe.connects.load(Ordering::SeqCst), 1);
        assert_eq!(probe.releases.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn end_of_stream_releases_source() -> Result<()> {
        let probe = Probe::default();
        let (tx, rx) = mpsc::channel();
        let handle = CameraPoller::new(Duration::from_millis(1)).spawn(
            ProbeSource {
                probe: probe.clone(),
                fail_open: false,
                frames_left: Some(3),
            },
            ChannelSink(tx),
        );
        wait_finished(&handle);
        assert_eq!(handle.stop()?, PollExit::EndOfStream);
        assert_eq!(rx.try_iter().count(), 3);
        assert_eq!(probe.releases.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn dropping_handle_stops_and_releases() {
        let probe = Probe::default();
        let (tx, rx) = mpsc::channel();
        let handle = CameraPoller::new(Duration::from_millis(1)).spawn(
            ProbeSource {
                probe: probe.clone(),
                fail_open: false,
                frames_left: None,
            },
            ChannelSink(tx),
        );
        // Wait for at least one frame so the source is open.
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        drop(handle);
        assert_eq!(probe.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closed_sink_stops_polling() -> Result<()> {
        let probe = Probe::default();
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let handle = CameraPoller::new(Duration::from_millis(1)).spawn(
            ProbeSource {
                probe: probe.clone(),
                fail_open: false,
                frames_left: None,
            },
            ChannelSink(tx),
        );
        wait_finished(&handle);
        assert_eq!(handle.stop()?, PollExit::SinkClosed);
        assert_eq!(probe.releases.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
