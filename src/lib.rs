//! # HDSoC Capture RS
//!
//! A Rust library for capturing triggered waveform events from HDSoC digitizer boards and
//! removing their per-window pedestals.
//!
//! The board reads each event out of a circular buffer of sample windows. Windows arrive in
//! readout order but carry the label of the physical slot they came from, and the fixed
//! pattern offset ("pedestal") belongs to that physical slot. This crate arms readout, pulls
//! events with a bounded wait, aligns each event against a pedestal table and keeps the
//! corrected events in an append-only buffer.
//!
//! ## Features
//!
//! - **Capture sessions**: arm, capture and stop with guaranteed cleanup and no lost events
//! - **Trigger scheduling**: external triggers or self-triggering on a fixed interval
//! - **Retry policy**: timeouts and bad payloads are retried, driver failures end the run
//! - **Pedestal alignment**: arrival-order placement with label-selected baselines
//! - **Array output**: `ndarray` buffers saved as `.npy`, or a `polars` DataFrame
//!
//! The board itself sits behind the [`BoardInterface`] trait; connection, bring-up and
//! packet framing are up to the implementor.
//!
//! ## Examples
//!
//! ### Aligning a single event
//!
//! ```rust
//! use hdsoc_capture::{BoardParams, PedestalAligner, PedestalTable, RawEvent};
//! use ndarray::array;
//!
//! let params = BoardParams::new(2, 2, 2);
//! let pedestals = PedestalTable::from_array(
//!     params,
//!     array![[1.0, 1.0, 2.0, 2.0], [3.0, 3.0, 4.0, 4.0]],
//! )?;
//!
//! // Channel 0 delivered one window from slot 1, channel 1 delivered nothing.
//! let event = RawEvent::new(vec![vec![vec![5.0, 6.0]], vec![]], vec![vec![1], vec![]]);
//! let aligned = PedestalAligner::new(&pedestals).align(&event)?;
//! assert_eq!(aligned, array![[3.0, 4.0, 0.0, 0.0], [0.0, 0.0, 0.0, 0.0]]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Running a capture
//!
//! ```rust,no_run
//! use hdsoc_capture::{BoardInterface, CaptureRequest, CaptureSession, Layout, PedestalTable};
//! use std::time::Duration;
//!
//! # fn run<B: BoardInterface>(board: B) -> Result<(), Box<dyn std::error::Error>> {
//! let params = board.board_params();
//! let pedestals = PedestalTable::load_npy("data/pedestals.npy", params)?;
//! let mut session = CaptureSession::new(board, pedestals)?;
//!
//! // Hand this to another thread (e.g. a Ctrl-C handler) to cancel the run.
//! let handle = session.handle();
//!
//! match session.capture(&CaptureRequest::interval(100, Duration::from_millis(50))) {
//!     Ok(summary) => println!("Captured {} events", summary.captured),
//!     Err(e) => println!("{} ({} events kept)", e, e.captured()),
//! }
//!
//! handle.save_npy("data/events.npy", Layout::Transposed)?;
//! # Ok(())
//! # }
//! ```

pub mod board;
pub mod capture_session;
pub mod event_buffer;
pub mod event_stream;
pub mod pedestal;
pub mod trigger_config;

#[cfg(test)]
mod testing;

// Re-export the main types for convenience
pub use board::{BoardError, BoardInterface, BoardParams, RawEvent, RawEventError};

pub use trigger_config::{
    CadencePolicy, ReadWindow, ReadWindowBuilder, ReadWindowError, TriggerMode,
    TriggerScheduler,
};

pub use event_stream::{EventStream, PullOutcome, StreamStats};

pub use pedestal::{PedestalAligner, PedestalError, PedestalTable};

pub use event_buffer::{BufferError, EventBuffer, Layout};

pub use capture_session::{
    CaptureError, CaptureRequest, CaptureSession, CaptureSummary, ConfigError, SessionHandle,
    SessionState, SessionStatus,
};
