//! Scripted stand-in for the board, used by unit tests across the crate.

use crate::board::{BoardError, BoardInterface, BoardParams, RawEvent};
use crate::capture_session::SessionHandle;
use crate::trigger_config::ReadWindow;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug)]
pub enum Step {
    Event(RawEvent),
    Timeout,
    BadData,
    Fail(&'static str),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallLog {
    pub readout_started: u32,
    pub readout_stopped: u32,
    pub stream_opened: u32,
    pub stream_closed: u32,
}

pub struct ScriptedBoard {
    params: BoardParams,
    script: VecDeque<Step>,
    triggers: u32,
    delivered: usize,
    cancel_after: Option<(usize, SessionHandle)>,
    pub calls: CallLog,
    pub last_channels: Vec<usize>,
    pub last_window: Option<ReadWindow>,
    pub fail_start: bool,
    pub last_timeout: Option<Duration>,
}

impl ScriptedBoard {
    pub fn new(params: BoardParams) -> Self {
        Self {
            params,
            script: VecDeque::new(),
            triggers: 0,
            delivered: 0,
            cancel_after: None,
            calls: CallLog::default(),
            last_channels: Vec::new(),
            last_window: None,
            fail_start: false,
            last_timeout: None,
        }
    }

    pub fn with_script(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script.extend(steps);
        self
    }

    /// Cancel `handle` right after the `count`-th event has been handed out.
    pub fn cancel_after(&mut self, count: usize, handle: SessionHandle) {
        self.cancel_after = Some((count, handle));
    }

    pub fn triggers(&self) -> u32 {
        self.triggers
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl BoardInterface for ScriptedBoard {
    fn board_params(&self) -> BoardParams {
        self.params
    }

    fn start_readout(
        &mut self,
        channels: &[usize],
        window: &ReadWindow,
    ) -> Result<(), BoardError> {
        if self.fail_start {
            return Err(BoardError::Driver("readout refused".into()));
        }
        self.calls.readout_started += 1;
        self.last_channels = channels.to_vec();
        self.last_window = Some(*window);
        Ok(())
    }

    fn stop_readout(&mut self) -> Result<(), BoardError> {
        self.calls.readout_stopped += 1;
        Ok(())
    }

    fn trigger_once(&mut self) -> Result<(), BoardError> {
        self.triggers += 1;
        Ok(())
    }

    fn open_stream(&mut self) -> Result<(), BoardError> {
        self.calls.stream_opened += 1;
        Ok(())
    }

    fn close_stream(&mut self) -> Result<(), BoardError> {
        self.calls.stream_closed += 1;
        Ok(())
    }

    fn pull_event(&mut self, timeout: Duration) -> Result<RawEvent, BoardError> {
        self.last_timeout = Some(timeout);
        match self.script.pop_front() {
            Some(Step::Event(event)) => {
                self.delivered += 1;
                if let Some((count, handle)) = &self.cancel_after {
                    if *count == self.delivered {
                        handle.cancel();
                    }
                }
                Ok(event)
            }
            Some(Step::Timeout) => Err(BoardError::Timeout { timeout }),
            Some(Step::BadData) => Err(BoardError::BadData("checksum mismatch".into())),
            Some(Step::Fail(reason)) => Err(BoardError::Driver(reason.into())),
            None => Err(BoardError::Driver("script exhausted".into())),
        }
    }
}

/// Event with every window of every channel filled, labels in arrival order.
pub fn full_event(params: &BoardParams, value: f64) -> RawEvent {
    let data = (0..params.channels)
        .map(|_| {
            (0..params.total_windows)
                .map(|_| vec![value; params.samples_per_window])
                .collect()
        })
        .collect();
    let labels = (0..params.channels)
        .map(|_| (0..params.total_windows).collect())
        .collect();
    RawEvent::new(data, labels)
}
