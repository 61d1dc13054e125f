use crate::board::{BoardParams, RawEvent, RawEventError};
use ndarray::{s, Array2, Array3, ArrayD, ArrayView2, Axis, Ix2};
use ndarray_npy::{ReadNpyError, WriteNpyError};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum PedestalError {
    #[error("Pedestal table has shape {actual:?}, expected {expected:?}")]
    Shape {
        expected: (usize, usize),
        actual: Vec<usize>,
    },

    #[error("Failed to read pedestal file: {0}")]
    Read(#[from] ReadNpyError),

    #[error("Failed to write pedestal file: {0}")]
    Write(#[from] WriteNpyError),
}

/// Per-channel, per-sample baselines indexed by physical window position.
///
/// Shape is always `(channels, total_samples)` of the board it was built for.
#[derive(Debug, Clone, PartialEq)]
pub struct PedestalTable {
    params: BoardParams,
    baselines: Array2<f64>,
}

impl PedestalTable {
    /// A table that leaves samples untouched.
    pub fn zeros(params: BoardParams) -> Self {
        Self {
            params,
            baselines: Array2::zeros(params.event_shape()),
        }
    }

    pub fn from_array(params: BoardParams, baselines: Array2<f64>) -> Result<Self, PedestalError> {
        let expected = params.event_shape();
        if baselines.dim() != expected {
            return Err(PedestalError::Shape {
                expected,
                actual: baselines.shape().to_vec(),
            });
        }
        Ok(Self { params, baselines })
    }

    /// Load a `.npy` table and check it against the board geometry.
    pub fn load_npy<P: AsRef<Path>>(path: P, params: BoardParams) -> Result<Self, PedestalError> {
        let path = path.as_ref();
        log::debug!("Loading pedestals from {}", path.display());

        let raw: ArrayD<f64> = ndarray_npy::read_npy(path)?;
        let shape = raw.shape().to_vec();
        let baselines = raw
            .into_dimensionality::<Ix2>()
            .map_err(|_| PedestalError::Shape {
                expected: params.event_shape(),
                actual: shape,
            })?;
        Self::from_array(params, baselines)
    }

    pub fn save_npy<P: AsRef<Path>>(&self, path: P) -> Result<(), PedestalError> {
        ndarray_npy::write_npy(path, &self.baselines)?;
        Ok(())
    }

    pub fn params(&self) -> BoardParams {
        self.params
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.baselines.view()
    }

    pub fn is_zero(&self) -> bool {
        self.baselines.iter().all(|&v| v == 0.0)
    }
}

/// Rebuilds fixed-shape waveforms from raw window lists and removes pedestals.
///
/// Window `i` of a channel lands at output position `i` (arrival order) while its baseline
/// is taken from the pedestal slot named by its label. A channel delivering `k` windows
/// leaves samples `k * spw..` at zero.
#[derive(Debug, Clone, Copy)]
pub struct PedestalAligner<'a> {
    pedestals: &'a PedestalTable,
}

impl<'a> PedestalAligner<'a> {
    pub fn new(pedestals: &'a PedestalTable) -> Self {
        Self { pedestals }
    }

    pub fn params(&self) -> BoardParams {
        self.pedestals.params
    }

    pub fn align(&self, event: &RawEvent) -> Result<Array2<f64>, RawEventError> {
        let mut aligned = Array2::zeros(self.params().event_shape());
        self.align_into(event, aligned.view_mut())?;
        Ok(aligned)
    }

    /// Align a whole run into one `(events, channels, total_samples)` batch, keeping order.
    pub fn align_batch(&self, events: &[RawEvent]) -> Result<Array3<f64>, RawEventError> {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("align_batch"), 0));

        let (channels, samples) = self.params().event_shape();
        let mut batch = Array3::zeros((events.len(), channels, samples));
        for (event, out) in events.iter().zip(batch.axis_iter_mut(Axis(0))) {
            self.align_into(event, out)?;
        }
        Ok(batch)
    }

    fn align_into(
        &self,
        event: &RawEvent,
        mut out: ndarray::ArrayViewMut2<'_, f64>,
    ) -> Result<(), RawEventError> {
        let params = self.params();
        event.check_geometry(&params)?;

        let spw = params.samples_per_window;
        let baselines = self.pedestals.view();
        for channel in 0..event.data.len() {
            for (position, (label, window)) in event.channel_windows(channel).enumerate() {
                let pedestal = baselines.slice(s![channel, label * spw..(label + 1) * spw]);
                let mut target = out.slice_mut(s![channel, position * spw..(position + 1) * spw]);
                for ((dst, &raw), &ped) in target.iter_mut().zip(window).zip(pedestal.iter()) {
                    *dst = raw - ped;
                }
            }
        }
        Ok(())
    }
}
