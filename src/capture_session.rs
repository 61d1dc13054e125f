use crate::board::{BoardError, BoardInterface, BoardParams, RawEvent, RawEventError};
use crate::event_buffer::{BufferError, EventBuffer, Layout};
use crate::event_stream::{EventStream, PullOutcome, StreamStats};
use crate::pedestal::{PedestalAligner, PedestalError, PedestalTable};
use crate::trigger_config::{
    CadencePolicy, ReadWindow, ReadWindowError, TriggerMode, TriggerScheduler,
    MIN_TRIGGER_INTERVAL,
};
use ndarray::ArrayD;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Event count must be a positive integer, got {0}")]
    InvalidEventCount(usize),

    #[error("Capture interval {period:?} is shorter than the minimum {min:?}")]
    IntervalTooShort { period: Duration, min: Duration },

    #[error("Capture interval {0:?} is too long to derive a pull timeout from")]
    IntervalTooLong(Duration),

    #[error("Pedestal table was built for {actual:?}, the board reports {expected:?}")]
    PedestalGeometry {
        expected: BoardParams,
        actual: BoardParams,
    },

    #[error("Invalid read window: {0}")]
    ReadWindow(#[from] ReadWindowError),

    #[error("Invalid pedestal table: {0}")]
    Pedestal(#[from] PedestalError),
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Capture rejected: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to arm readout: {0}")]
    Arming(#[source] BoardError),

    #[error("Capture aborted after {captured} events: {source}")]
    Fatal {
        captured: usize,
        #[source]
        source: BoardError,
    },

    #[error("Capture canceled early after {captured} events")]
    Cancelled { captured: usize },

    #[error("Failed to align captured events: {0}")]
    Alignment(#[from] RawEventError),

    #[error("Failed to store captured events: {0}")]
    Buffer(#[from] BufferError),
}

impl CaptureError {
    /// Events that made it into the buffer before the run ended.
    pub fn captured(&self) -> usize {
        match self {
            Self::Fatal { captured, .. } | Self::Cancelled { captured } => *captured,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Arming,
    Capturing,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub captured_this_run: usize,
    pub captured_total: usize,
}

/// What to capture in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub target: usize,
    pub mode: TriggerMode,
    pub cadence: CadencePolicy,
    pub read_window: ReadWindow,
}

impl CaptureRequest {
    /// Wait for `target` events triggered by outside equipment.
    pub fn external(target: usize) -> Self {
        Self {
            target,
            mode: TriggerMode::External,
            cadence: CadencePolicy::default(),
            read_window: ReadWindow::default(),
        }
    }

    /// Self-trigger every `period` until `target` events arrived.
    pub fn interval(target: usize, period: Duration) -> Self {
        Self {
            mode: TriggerMode::Interval(period),
            ..Self::external(target)
        }
    }

    pub fn with_cadence(mut self, cadence: CadencePolicy) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn with_read_window(mut self, read_window: ReadWindow) -> Self {
        self.read_window = read_window;
        self
    }

    pub fn validate(&self, params: &BoardParams) -> Result<(), ConfigError> {
        if self.target < 1 {
            return Err(ConfigError::InvalidEventCount(self.target));
        }
        if let TriggerMode::Interval(period) = self.mode {
            if period < MIN_TRIGGER_INTERVAL {
                return Err(ConfigError::IntervalTooShort {
                    period,
                    min: MIN_TRIGGER_INTERVAL,
                });
            }
            if self.mode.checked_pull_timeout().is_none() {
                return Err(ConfigError::IntervalTooLong(period));
            }
        }
        self.read_window.validate(params)?;
        Ok(())
    }
}

/// Outcome of a run that reached its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSummary {
    pub captured: usize,
    pub total: usize,
    pub stream: StreamStats,
    pub triggers: u64,
    pub elapsed: Duration,
}

#[derive(Debug)]
struct Shared {
    cancelled: AtomicBool,
    state: Mutex<SessionState>,
    captured_this_run: AtomicUsize,
    /// Pulled this run but not yet aligned into the buffer.
    pending: AtomicUsize,
    buffer: RwLock<EventBuffer>,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn begin_run(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
        self.captured_this_run.store(0, Ordering::SeqCst);
        self.pending.store(0, Ordering::SeqCst);
    }

    fn record_event(&self) {
        self.captured_this_run.fetch_add(1, Ordering::SeqCst);
        self.pending.fetch_add(1, Ordering::SeqCst);
    }
}

/// Cloneable, thread-safe view of a session for cancelling, reporting and exporting
/// while a capture runs elsewhere.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Ask the running capture to stop. Events already pulled are kept.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SessionStatus {
        let state = *self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let buffer = self
            .shared
            .buffer
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        SessionStatus {
            state,
            captured_this_run: self.shared.captured_this_run.load(Ordering::SeqCst),
            captured_total: buffer.report() + self.shared.pending.load(Ordering::SeqCst),
        }
    }

    /// Events stored in the buffer.
    pub fn report(&self) -> usize {
        self.read_buffer(EventBuffer::report)
    }

    pub fn snapshot(&self, layout: Layout) -> ArrayD<f64> {
        self.read_buffer(|buffer| buffer.snapshot(layout))
    }

    pub fn save_npy<P: AsRef<Path>>(&self, path: P, layout: Layout) -> Result<(), BufferError> {
        self.read_buffer(|buffer| buffer.save_npy(path, layout))
    }

    /// Run `f` against the buffer under a read lock.
    pub fn read_buffer<T>(&self, f: impl FnOnce(&EventBuffer) -> T) -> T {
        let buffer = self
            .shared
            .buffer
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(&buffer)
    }
}

/// A board with readout running. Readout is stopped and the stream closed when this
/// goes out of scope, whichever way the capture loop ended.
struct ArmedBoard<'b, B: BoardInterface> {
    board: &'b mut B,
    stream_open: bool,
}

impl<'b, B: BoardInterface> ArmedBoard<'b, B> {
    fn arm(board: &'b mut B, channels: &[usize], window: &ReadWindow) -> Result<Self, BoardError> {
        log::debug!(
            "Arming readout: channels {:?}, {} windows (lookback {}, after trigger {})",
            channels,
            window.windows,
            window.lookback,
            window.write_after_trigger
        );
        board.start_readout(channels, window)?;

        let mut armed = Self {
            board,
            stream_open: false,
        };
        armed.board.open_stream()?;
        armed.stream_open = true;
        Ok(armed)
    }
}

impl<B: BoardInterface> Drop for ArmedBoard<'_, B> {
    fn drop(&mut self) {
        log::debug!("Stopping capture");
        if self.stream_open {
            if let Err(e) = self.board.close_stream() {
                log::error!("Failed to close event stream: {}", e);
            }
        }
        if let Err(e) = self.board.stop_readout() {
            log::error!("Failed to stop readout: {}", e);
        }
    }
}

/// Drives a board through arm, capture and stop, accumulating pedestal-corrected events.
pub struct CaptureSession<B: BoardInterface> {
    board: B,
    params: BoardParams,
    pedestals: PedestalTable,
    shared: Arc<Shared>,
}

impl<B: BoardInterface> CaptureSession<B> {
    /// Start a session against `board`. The pedestal table must match the board geometry.
    pub fn new(board: B, pedestals: PedestalTable) -> Result<Self, ConfigError> {
        let params = board.board_params();
        Self::check_pedestals(&params, &pedestals)?;
        log::debug!(
            "Board has {} channels, {} windows of {} samples",
            params.channels,
            params.total_windows,
            params.samples_per_window
        );

        Ok(Self {
            board,
            params,
            pedestals,
            shared: Arc::new(Shared {
                cancelled: AtomicBool::new(false),
                state: Mutex::new(SessionState::Idle),
                captured_this_run: AtomicUsize::new(0),
                pending: AtomicUsize::new(0),
                buffer: RwLock::new(EventBuffer::new(params)),
            }),
        })
    }

    fn check_pedestals(params: &BoardParams, pedestals: &PedestalTable) -> Result<(), ConfigError> {
        if pedestals.view().dim() != params.event_shape() {
            return Err(PedestalError::Shape {
                expected: params.event_shape(),
                actual: pedestals.view().shape().to_vec(),
            }
            .into());
        }
        // Same shape but a different window split would pick the wrong baseline slots.
        if pedestals.params() != *params {
            return Err(ConfigError::PedestalGeometry {
                expected: *params,
                actual: pedestals.params(),
            });
        }
        Ok(())
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn params(&self) -> BoardParams {
        self.params
    }

    pub fn pedestals(&self) -> &PedestalTable {
        &self.pedestals
    }

    /// Swap in a different pedestal table for later runs.
    pub fn set_pedestals(&mut self, pedestals: PedestalTable) -> Result<(), ConfigError> {
        Self::check_pedestals(&self.params, &pedestals)?;
        self.pedestals = pedestals;
        Ok(())
    }

    pub fn status(&self) -> SessionStatus {
        self.handle().status()
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn into_board(self) -> B {
        self.board
    }

    /// Run one capture to completion, cancellation or failure.
    ///
    /// Whatever was pulled before the run ended is aligned and appended to the buffer
    /// before this returns, including on error. Cancellation is reported as
    /// [`CaptureError::Cancelled`].
    pub fn capture(&mut self, request: &CaptureRequest) -> Result<CaptureSummary, CaptureError> {
        request.validate(&self.params)?;

        let span = tracing::info_span!(
            "capture_run",
            mode = request.mode.as_str(),
            events = request.target
        );
        let _enter = span.enter();

        match request.mode {
            TriggerMode::External => {
                log::info!("Capturing {} externally triggered events", request.target);
            }
            TriggerMode::Interval(period) => {
                let expected = u32::try_from(request.target)
                    .ok()
                    .and_then(|n| n.checked_add(1))
                    .and_then(|n| period.checked_mul(n));
                match expected {
                    Some(expected) => log::info!(
                        "Capturing {} events at {:?} intervals, expect around {:?}",
                        request.target,
                        period,
                        expected
                    ),
                    None => log::info!(
                        "Capturing {} events at {:?} intervals",
                        request.target,
                        period
                    ),
                }
            }
        }

        self.shared.begin_run();
        self.shared.set_state(SessionState::Arming);

        let started = Instant::now();
        let channels: Vec<usize> = (0..self.params.channels).collect();
        let mut scheduler = TriggerScheduler::new(request.mode, request.cadence);
        let mut stream = EventStream::new(self.params, request.mode.pull_timeout());
        let mut events = Vec::with_capacity(request.target.min(4096));

        let run = {
            let mut armed = match ArmedBoard::arm(&mut self.board, &channels, &request.read_window) {
                Ok(armed) => armed,
                Err(e) => {
                    self.shared.set_state(SessionState::Idle);
                    return Err(CaptureError::Arming(e));
                }
            };
            self.shared.set_state(SessionState::Capturing);

            let run = Self::capture_loop(
                &mut *armed.board,
                &self.shared,
                request.target,
                &mut scheduler,
                &mut stream,
                &mut events,
            );
            self.shared.set_state(SessionState::Stopping);
            run
        };

        let flushed = self.flush(&events);
        self.shared.set_state(SessionState::Idle);

        let total = self.handle().report();
        log::info!(
            "Finalized capture of {} events, {} events total",
            events.len(),
            total
        );

        match (run, flushed) {
            (Ok(()), Ok(())) => Ok(CaptureSummary {
                captured: events.len(),
                total,
                stream: stream.stats(),
                triggers: scheduler.fired(),
                elapsed: started.elapsed(),
            }),
            (Err(run_err), Ok(())) => {
                log::warn!("{}", run_err);
                Err(run_err)
            }
            (run, Err(flush_err)) => {
                if let Err(run_err) = run {
                    log::error!("Capture ended with: {}", run_err);
                }
                Err(flush_err)
            }
        }
    }

    fn capture_loop(
        board: &mut B,
        shared: &Shared,
        target: usize,
        scheduler: &mut TriggerScheduler,
        stream: &mut EventStream,
        events: &mut Vec<RawEvent>,
    ) -> Result<(), CaptureError> {
        let fatal = |captured: usize| move |source: BoardError| CaptureError::Fatal { captured, source };

        scheduler.prime(board).map_err(fatal(events.len()))?;

        while events.len() < target {
            if shared.cancelled.load(Ordering::SeqCst) {
                return Err(CaptureError::Cancelled {
                    captured: events.len(),
                });
            }

            scheduler.wait_and_fire(board).map_err(fatal(events.len()))?;

            match stream.pull(board) {
                PullOutcome::Event(event) => {
                    events.push(event);
                    shared.record_event();
                    log::debug!("Captured events: {}", events.len());
                }
                PullOutcome::Timeout => {
                    log::warn!(
                        "Event capture timed out after {:?}. Trying again.",
                        stream.timeout()
                    );
                }
                PullOutcome::BadData(reason) => {
                    log::warn!("Bad event data received, ignoring: {}", reason);
                }
                PullOutcome::Fatal(source) => {
                    return Err(CaptureError::Fatal {
                        captured: events.len(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    /// Align this run's raw events and append them as one batch.
    fn flush(&self, events: &[RawEvent]) -> Result<(), CaptureError> {
        if events.is_empty() {
            return Ok(());
        }
        log::debug!(
            "Processing {} new events and performing pedestal subtraction",
            events.len()
        );

        let batch = PedestalAligner::new(&self.pedestals).align_batch(events)?;

        let mut buffer = self
            .shared
            .buffer
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        buffer.append(&batch)?;
        self.shared.pending.store(0, Ordering::SeqCst);
        Ok(())
    }
}
