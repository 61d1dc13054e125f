use crate::board::{BoardError, BoardInterface, BoardParams, RawEvent};
use std::time::Duration;

/// Result of a single pull attempt.
#[derive(Debug)]
pub enum PullOutcome {
    Event(RawEvent),
    /// Nothing arrived in time. Pull again, nothing is counted.
    Timeout,
    /// Something arrived but could not be used. Discard it and pull again.
    BadData(String),
    /// The board is in trouble; the run has to end.
    Fatal(BoardError),
}

/// Counters for one run of the stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub events: usize,
    pub timeouts: usize,
    pub bad_data: usize,
}

/// Pulls whole events from an open board stream and sorts failures into
/// retry-worthy and fatal ones.
pub struct EventStream {
    params: BoardParams,
    timeout: Duration,
    stats: StreamStats,
}

impl EventStream {
    pub fn new(params: BoardParams, timeout: Duration) -> Self {
        Self {
            params,
            timeout,
            stats: StreamStats::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Block for at most the stream timeout and classify what came back.
    ///
    /// Events that do not fit the board geometry are reported as bad data so the
    /// aligner only ever sees well-formed input.
    pub fn pull<B: BoardInterface + ?Sized>(&mut self, board: &mut B) -> PullOutcome {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("pull_event"), 0));

        match board.pull_event(self.timeout) {
            Ok(event) => match event.check_geometry(&self.params) {
                Ok(()) => {
                    self.stats.events += 1;
                    PullOutcome::Event(event)
                }
                Err(e) => {
                    self.stats.bad_data += 1;
                    PullOutcome::BadData(e.to_string())
                }
            },
            Err(BoardError::Timeout { .. }) => {
                self.stats.timeouts += 1;
                PullOutcome::Timeout
            }
            Err(BoardError::BadData(reason)) => {
                self.stats.bad_data += 1;
                PullOutcome::BadData(reason)
            }
            Err(e) => PullOutcome::Fatal(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{full_event, ScriptedBoard, Step};

    #[test]
    fn test_pull_classifies_outcomes() {
        let params = BoardParams::new(1, 2, 2);
        let mut board = ScriptedBoard::new(params).with_script([
            Step::Timeout,
            Step::BadData,
            Step::Event(full_event(&params, 1.0)),
            Step::Fail("link down"),
        ]);
        let mut stream = EventStream::new(params, Duration::from_millis(50));

        assert!(matches!(stream.pull(&mut board), PullOutcome::Timeout));
        assert!(matches!(stream.pull(&mut board), PullOutcome::BadData(_)));
        assert!(matches!(stream.pull(&mut board), PullOutcome::Event(_)));
        assert!(matches!(
            stream.pull(&mut board),
            PullOutcome::Fatal(BoardError::Driver(_))
        ));

        assert_eq!(
            stream.stats(),
            StreamStats {
                events: 1,
                timeouts: 1,
                bad_data: 1
            }
        );
        assert_eq!(board.last_timeout, Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_malformed_event_is_bad_data() {
        let params = BoardParams::new(1, 2, 2);
        let event = RawEvent::new(vec![vec![vec![1.0, 2.0]]], vec![vec![7]]);
        let mut board = ScriptedBoard::new(params).with_script([Step::Event(event)]);
        let mut stream = EventStream::new(params, Duration::from_millis(50));

        match stream.pull(&mut board) {
            PullOutcome::BadData(reason) => assert!(reason.contains("labelled 7")),
            other => panic!("expected bad data, got {other:?}"),
        }
        assert_eq!(stream.stats().events, 0);
    }
}
