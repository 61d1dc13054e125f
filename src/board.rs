use crate::trigger_config::ReadWindow;
use std::time::Duration;

/// Readout geometry reported by the board. Fixed for the lifetime of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardParams {
    pub channels: usize,
    pub total_windows: usize,
    pub samples_per_window: usize,
}

impl BoardParams {
    pub fn new(channels: usize, total_windows: usize, samples_per_window: usize) -> Self {
        Self {
            channels,
            total_windows,
            samples_per_window,
        }
    }

    /// Number of samples in a fully populated channel record.
    pub fn total_samples(&self) -> usize {
        self.total_windows * self.samples_per_window
    }

    /// Shape of a pedestal table or a single aligned event.
    pub fn event_shape(&self) -> (usize, usize) {
        (self.channels, self.total_samples())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RawEventError {
    #[error("Event carries {found} channels but the board only has {expected}")]
    TooManyChannels { expected: usize, found: usize },

    #[error("Channel {channel} has {windows} windows but {labels} window labels")]
    LabelCountMismatch {
        channel: usize,
        windows: usize,
        labels: usize,
    },

    #[error("Channel {channel} has {windows} windows, more than the {max} the board can hold")]
    TooManyWindows {
        channel: usize,
        windows: usize,
        max: usize,
    },

    #[error("Channel {channel} window {window} has {found} samples, expected {expected}")]
    WindowLength {
        channel: usize,
        window: usize,
        expected: usize,
        found: usize,
    },

    #[error("Channel {channel} window {window} is labelled {label}, outside 0..{total_windows}")]
    LabelOutOfRange {
        channel: usize,
        window: usize,
        label: usize,
        total_windows: usize,
    },
}

/// One triggered readout as delivered by the board.
///
/// Windows are listed in arrival order. `window_labels[c][i]` is the circular-buffer slot
/// the `i`-th window of channel `c` was read from, which need not match `i`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEvent {
    /// `[channel][window][sample]`
    pub data: Vec<Vec<Vec<f64>>>,
    /// `[channel][window]`
    pub window_labels: Vec<Vec<usize>>,
}

impl RawEvent {
    pub fn new(data: Vec<Vec<Vec<f64>>>, window_labels: Vec<Vec<usize>>) -> Self {
        Self {
            data,
            window_labels,
        }
    }

    /// Windows delivered for `channel`, zero if the channel is absent from the event.
    pub fn window_count(&self, channel: usize) -> usize {
        self.data.get(channel).map_or(0, Vec::len)
    }

    /// Iterate `(label, samples)` pairs of one channel in arrival order.
    pub fn channel_windows(&self, channel: usize) -> impl Iterator<Item = (usize, &[f64])> {
        let windows = self.data.get(channel).map(Vec::as_slice).unwrap_or_default();
        let labels = self
            .window_labels
            .get(channel)
            .map(Vec::as_slice)
            .unwrap_or_default();
        labels
            .iter()
            .copied()
            .zip(windows.iter().map(Vec::as_slice))
    }

    /// Check that the event fits the board's readout geometry.
    ///
    /// Channels missing from the end of the event count as channels without windows.
    pub fn check_geometry(&self, params: &BoardParams) -> Result<(), RawEventError> {
        let channels = self.data.len().max(self.window_labels.len());
        if channels > params.channels {
            return Err(RawEventError::TooManyChannels {
                expected: params.channels,
                found: channels,
            });
        }

        for channel in 0..channels {
            let windows = self.window_count(channel);
            let labels = self.window_labels.get(channel).map_or(0, Vec::len);
            if windows != labels {
                return Err(RawEventError::LabelCountMismatch {
                    channel,
                    windows,
                    labels,
                });
            }
            if windows > params.total_windows {
                return Err(RawEventError::TooManyWindows {
                    channel,
                    windows,
                    max: params.total_windows,
                });
            }

            for (window, (label, samples)) in self.channel_windows(channel).enumerate() {
                if samples.len() != params.samples_per_window {
                    return Err(RawEventError::WindowLength {
                        channel,
                        window,
                        expected: params.samples_per_window,
                        found: samples.len(),
                    });
                }
                if label >= params.total_windows {
                    return Err(RawEventError::LabelOutOfRange {
                        channel,
                        window,
                        label,
                        total_windows: params.total_windows,
                    });
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("No event arrived within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Bad event data: {0}")]
    BadData(String),

    #[error("Readout is not running")]
    NotReadingOut,

    #[error("Board driver error: {0}")]
    Driver(String),
}

/// The hardware-interface collaborator.
///
/// Connection, bring-up, clock registers and packet framing all live behind this trait.
/// The capture core only needs to arm readout, fire software triggers and pull whole events.
pub trait BoardInterface {
    fn board_params(&self) -> BoardParams;

    /// Enable `channels` and start physical readout with the given window geometry.
    fn start_readout(&mut self, channels: &[usize], window: &ReadWindow)
        -> Result<(), BoardError>;

    fn stop_readout(&mut self) -> Result<(), BoardError>;

    /// Fire a single software trigger pulse.
    fn trigger_once(&mut self) -> Result<(), BoardError>;

    /// Start the receiver that feeds [`BoardInterface::pull_event`].
    fn open_stream(&mut self) -> Result<(), BoardError>;

    fn close_stream(&mut self) -> Result<(), BoardError>;

    /// Block for at most `timeout` waiting for the next event.
    ///
    /// Implementations report an empty wait as [`BoardError::Timeout`] and an undecodable
    /// payload as [`BoardError::BadData`].
    fn pull_event(&mut self, timeout: Duration) -> Result<RawEvent, BoardError>;
}
