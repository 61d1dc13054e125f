use crate::board::BoardParams;
use ndarray::{Array3, ArrayD, ArrayView3, ArrayView4, Axis};
use ndarray_npy::WriteNpyError;
use polars::prelude::{Column, DataFrame, NamedFrom, PolarsError, Series};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    /// `(events, channels, samples)`
    #[default]
    Natural,
    /// `(1, channels, events, samples)`
    Transposed,
}

impl Layout {
    pub fn as_str(&self) -> &'static str {
        match self {
            Layout::Natural => "natural",
            Layout::Transposed => "transposed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("Batch of shape {actual:?} does not fit events of shape {expected:?}")]
    BatchShape {
        expected: (usize, usize),
        actual: Vec<usize>,
    },

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Failed to write events: {0}")]
    Write(#[from] WriteNpyError),

    #[error("DataFrame error: {0}")]
    DataFrame(#[from] PolarsError),
}

const EVENT_COLUMN_NAME: &str = "event";
const CHANNEL_COLUMN_NAME: &str = "channel";
const SAMPLE_COLUMN_NAME: &str = "sample";
const VALUE_COLUMN_NAME: &str = "value";

/// Append-only store of pedestal-corrected events.
#[derive(Debug, Clone)]
pub struct EventBuffer {
    params: BoardParams,
    events: Array3<f64>,
}

impl EventBuffer {
    pub fn new(params: BoardParams) -> Self {
        let (channels, samples) = params.event_shape();
        Self {
            params,
            events: Array3::zeros((0, channels, samples)),
        }
    }

    pub fn params(&self) -> BoardParams {
        self.params
    }

    /// Append one capture run worth of events.
    pub fn append(&mut self, batch: &Array3<f64>) -> Result<(), BufferError> {
        let (_, channels, samples) = batch.dim();
        if (channels, samples) != self.params.event_shape() {
            return Err(BufferError::BatchShape {
                expected: self.params.event_shape(),
                actual: batch.shape().to_vec(),
            });
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.events.append(Axis(0), batch.view())?;
        Ok(())
    }

    /// Number of events held.
    pub fn report(&self) -> usize {
        self.events.len_of(Axis(0))
    }

    pub fn len(&self) -> usize {
        self.report()
    }

    pub fn is_empty(&self) -> bool {
        self.report() == 0
    }

    /// Drop every event. Only used when starting over with a new output.
    pub fn clear(&mut self) {
        let (channels, samples) = self.params.event_shape();
        self.events = Array3::zeros((0, channels, samples));
    }

    pub fn natural(&self) -> ArrayView3<'_, f64> {
        self.events.view()
    }

    /// The same values viewed as `(1, channels, events, samples)`.
    pub fn transposed(&self) -> ArrayView4<'_, f64> {
        self.events
            .view()
            .permuted_axes([1, 0, 2])
            .insert_axis(Axis(0))
    }

    /// Owned copy of the buffer in the requested layout.
    pub fn snapshot(&self, layout: Layout) -> ArrayD<f64> {
        match layout {
            Layout::Natural => self.natural().to_owned().into_dyn(),
            Layout::Transposed => self.transposed().to_owned().into_dyn(),
        }
    }

    pub fn save_npy<P: AsRef<Path>>(&self, path: P, layout: Layout) -> Result<(), BufferError> {
        let path = path.as_ref();
        log::info!(
            "Saving {} events ({} layout) to {}",
            self.report(),
            layout.as_str(),
            path.display()
        );
        match layout {
            Layout::Natural => ndarray_npy::write_npy(path, &self.events)?,
            Layout::Transposed => ndarray_npy::write_npy(path, &self.transposed().to_owned())?,
        }
        Ok(())
    }

    /// Long-form table with one row per sample: `event`, `channel`, `sample`, `value`.
    pub fn to_dataframe(&self) -> Result<DataFrame, BufferError> {
        let rows = self.events.len();
        let mut event_ids = Vec::with_capacity(rows);
        let mut channel_ids = Vec::with_capacity(rows);
        let mut sample_ids = Vec::with_capacity(rows);
        let mut values = Vec::with_capacity(rows);

        for ((event, channel, sample), &value) in self.events.indexed_iter() {
            event_ids.push(event as u32);
            channel_ids.push(channel as u32);
            sample_ids.push(sample as u32);
            values.push(value);
        }

        let columns: Vec<Column> = vec![
            Series::new(EVENT_COLUMN_NAME.into(), event_ids).into(),
            Series::new(CHANNEL_COLUMN_NAME.into(), channel_ids).into(),
            Series::new(SAMPLE_COLUMN_NAME.into(), sample_ids).into(),
            Series::new(VALUE_COLUMN_NAME.into(), values).into(),
        ];
        Ok(DataFrame::new(columns)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array};

    fn params() -> BoardParams {
        BoardParams::new(2, 2, 3)
    }

    fn batch(events: usize, offset: f64) -> Array3<f64> {
        let len = events * 2 * 6;
        Array::from_iter((0..len).map(|i| offset + i as f64))
            .into_shape((events, 2, 6))
            .unwrap()
    }

    #[test]
    fn test_append_preserves_order() {
        let mut buffer = EventBuffer::new(params());
        let first = batch(3, 0.0);
        let second = batch(2, 1000.0);
        buffer.append(&first).unwrap();
        buffer.append(&second).unwrap();

        assert_eq!(buffer.report(), 5);
        assert_eq!(buffer.natural().slice(s![..3, .., ..]), first);
        assert_eq!(buffer.natural().slice(s![3.., .., ..]), second);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let mut buffer = EventBuffer::new(params());
        buffer.append(&Array3::zeros((0, 2, 6))).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.natural().dim(), (0, 2, 6));
    }

    #[test]
    fn test_append_rejects_wrong_shape() {
        let mut buffer = EventBuffer::new(params());
        let err = buffer.append(&Array3::zeros((1, 3, 6))).unwrap_err();
        assert!(matches!(err, BufferError::BatchShape { .. }));
        assert_eq!(buffer.report(), 0);
    }

    #[test]
    fn test_transposed_is_permutation() {
        let mut buffer = EventBuffer::new(params());
        buffer.append(&batch(4, 0.0)).unwrap();

        let natural = buffer.natural();
        let transposed = buffer.transposed();
        assert_eq!(transposed.dim(), (1, 2, 4, 6));
        for ((e, c, s), &v) in natural.indexed_iter() {
            assert_eq!(transposed[[0, c, e, s]], v);
        }

        let snapshot = buffer.snapshot(Layout::Transposed);
        assert_eq!(snapshot.shape(), &[1, 2, 4, 6]);
        assert_eq!(buffer.snapshot(Layout::Natural).shape(), &[4, 2, 6]);
    }

    #[test]
    fn test_clear() {
        let mut buffer = EventBuffer::new(params());
        buffer.append(&batch(2, 0.0)).unwrap();
        buffer.clear();
        assert_eq!(buffer.report(), 0);
    }

    #[test]
    fn test_save_transposed_npy() {
        let mut buffer = EventBuffer::new(params());
        buffer.append(&batch(3, 5.0)).unwrap();
        let path =
            std::env::temp_dir().join(format!("hdsoc_events_t_{}.npy", std::process::id()));
        buffer.save_npy(&path, Layout::Transposed).unwrap();

        let loaded: ndarray::Array4<f64> = ndarray_npy::read_npy(&path).unwrap();
        assert_eq!(loaded, buffer.transposed());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_to_dataframe() {
        let mut buffer = EventBuffer::new(params());
        buffer.append(&batch(2, 0.0)).unwrap();

        let df = buffer.to_dataframe().unwrap();
        assert_eq!(df.height(), 2 * 2 * 6);
        assert_eq!(df.width(), 4);

        let values: Vec<f64> = df
            .column(VALUE_COLUMN_NAME)
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(values, buffer.natural().iter().copied().collect::<Vec<_>>());
    }
}
