// Simulated capture example
//
// This example runs a full capture session against a simulated HDSoC board: arming,
// interval or external triggering, retries on timeouts and bad packets, pedestal
// alignment and saving the result as a .npy file.

use clap::{Parser, ValueEnum};
use hdsoc_capture::{
    BoardError, BoardInterface, BoardParams, CadencePolicy, CaptureRequest, CaptureSession,
    Layout, PedestalTable, RawEvent, ReadWindow,
};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    External,
    Interval,
}

#[derive(Parser)]
#[command(name = "simulated_capture")]
#[command(version = "1.0")]
#[command(about = "Capture pedestal-corrected events from a simulated HDSoC board")]
struct Args {
    /// Number of events to capture
    #[arg(default_value_t = 20)]
    events: usize,

    /// Trigger source
    #[arg(short, long, value_enum, default_value_t = Mode::Interval)]
    mode: Mode,

    /// Trigger interval in milliseconds (interval mode)
    #[arg(short, long, default_value_t = 50)]
    interval_ms: u64,

    /// Pedestal file (.npy); zero pedestals if omitted
    #[arg(short, long)]
    pedestals: Option<PathBuf>,

    /// Where to write the captured events
    #[arg(short, long, default_value = "events.npy")]
    output: PathBuf,

    /// Save in (1, channel, event, sample) order
    #[arg(short, long)]
    transpose: bool,

    /// Use a single sleep-until-deadline cadence instead of overrun compensation
    #[arg(long)]
    fixed_deadline: bool,

    /// Cancel the run after this many milliseconds
    #[arg(long)]
    cancel_after_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Pretends to be a board. Every event starts at a different circular-buffer slot, one in
/// seven pulls times out and one in eleven delivers a corrupt packet.
struct SimulatedBoard {
    params: BoardParams,
    window: Option<ReadWindow>,
    streaming: bool,
    pending_triggers: u32,
    external: bool,
    pulls: u64,
    next_slot: usize,
}

impl SimulatedBoard {
    fn new(params: BoardParams, external: bool) -> Self {
        Self {
            params,
            window: None,
            streaming: false,
            pending_triggers: 0,
            external,
            pulls: 0,
            next_slot: 0,
        }
    }

    fn make_event(&mut self, window: &ReadWindow) -> RawEvent {
        let spw = self.params.samples_per_window;
        let start = self.next_slot;
        self.next_slot = (self.next_slot + 7) % self.params.total_windows;

        let mut data = Vec::with_capacity(self.params.channels);
        let mut labels = Vec::with_capacity(self.params.channels);
        for channel in 0..self.params.channels {
            let mut windows = Vec::with_capacity(window.windows);
            let mut channel_labels = Vec::with_capacity(window.windows);
            for i in 0..window.windows {
                let label = (start + i) % self.params.total_windows;
                let samples = (0..spw)
                    .map(|s| {
                        let t = (i * spw + s) as f64;
                        1000.0 + 100.0 * channel as f64 + label as f64 + (t / 40.0).sin() * 50.0
                    })
                    .collect();
                windows.push(samples);
                channel_labels.push(label);
            }
            data.push(windows);
            labels.push(channel_labels);
        }
        RawEvent::new(data, labels)
    }
}

impl BoardInterface for SimulatedBoard {
    fn board_params(&self) -> BoardParams {
        self.params
    }

    fn start_readout(
        &mut self,
        channels: &[usize],
        window: &ReadWindow,
    ) -> Result<(), BoardError> {
        log::debug!("Simulated readout on channels {:?}", channels);
        self.window = Some(*window);
        // The real board swallows the first trigger after arming.
        self.pending_triggers = 0;
        Ok(())
    }

    fn stop_readout(&mut self) -> Result<(), BoardError> {
        self.window = None;
        Ok(())
    }

    fn trigger_once(&mut self) -> Result<(), BoardError> {
        self.pending_triggers += 1;
        Ok(())
    }

    fn open_stream(&mut self) -> Result<(), BoardError> {
        self.streaming = true;
        Ok(())
    }

    fn close_stream(&mut self) -> Result<(), BoardError> {
        self.streaming = false;
        Ok(())
    }

    fn pull_event(&mut self, timeout: Duration) -> Result<RawEvent, BoardError> {
        let window = match (self.streaming, self.window) {
            (true, Some(window)) => window,
            _ => return Err(BoardError::NotReadingOut),
        };
        self.pulls += 1;

        if self.pulls % 7 == 0 {
            thread::sleep(timeout.min(Duration::from_millis(100)));
            return Err(BoardError::Timeout { timeout });
        }
        if self.pulls % 11 == 0 {
            return Err(BoardError::BadData("packet checksum mismatch".into()));
        }

        if self.external {
            thread::sleep(Duration::from_millis(10));
        } else if self.pending_triggers < 2 {
            thread::sleep(timeout);
            return Err(BoardError::Timeout { timeout });
        } else {
            self.pending_triggers -= 1;
        }
        Ok(self.make_event(&window))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    #[cfg(feature = "cpu-profiling")]
    let _client = tracy_client::Client::start();

    let params = BoardParams::new(4, 64, 32);
    let pedestals = match &args.pedestals {
        Some(path) => PedestalTable::load_npy(path, params)?,
        None => {
            println!("Proceeding to capture without pedestals!");
            PedestalTable::zeros(params)
        }
    };

    let board = SimulatedBoard::new(params, matches!(args.mode, Mode::External));
    let mut session = CaptureSession::new(board, pedestals)?;
    let handle = session.handle();

    if let Some(ms) = args.cancel_after_ms {
        let canceller = handle.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(ms));
            canceller.cancel();
        });
    }

    let read_window = ReadWindow::builder().build(&params)?;
    let request = match args.mode {
        Mode::External => CaptureRequest::external(args.events),
        Mode::Interval => {
            CaptureRequest::interval(args.events, Duration::from_millis(args.interval_ms))
        }
    }
    .with_read_window(read_window)
    .with_cadence(if args.fixed_deadline {
        CadencePolicy::FixedDeadline
    } else {
        CadencePolicy::OverrunCompensated
    });

    println!("Simulated HDSoC Capture");
    println!("=======================");
    println!(
        "Board: {} channels, {} windows x {} samples",
        params.channels, params.total_windows, params.samples_per_window
    );
    println!("Mode: {:?}, target {} events\n", args.mode, args.events);

    let start = Instant::now();
    match session.capture(&request) {
        Ok(summary) => println!(
            "✓ Captured {} events in {:.2?} ({} timeouts, {} bad packets, {} triggers)",
            summary.captured,
            summary.elapsed,
            summary.stream.timeouts,
            summary.stream.bad_data,
            summary.triggers
        ),
        Err(e) => println!(
            "⚠ {} after {:.2?}, {} events kept",
            e,
            start.elapsed(),
            e.captured()
        ),
    }

    let status = handle.status();
    println!(
        "{} events this run, {} events captured so far.",
        status.captured_this_run, status.captured_total
    );

    let layout = if args.transpose {
        Layout::Transposed
    } else {
        Layout::Natural
    };
    handle.save_npy(&args.output, layout)?;
    println!("Saved to {}", args.output.display());

    Ok(())
}
