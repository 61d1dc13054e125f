use crate::board::{BoardError, BoardInterface, BoardParams};
use std::thread;
use std::time::{Duration, Instant};

/// Shortest self-trigger period the board keeps up with.
pub const MIN_TRIGGER_INTERVAL: Duration = Duration::from_millis(20);

/// Stall warning bound used while waiting for external triggers.
pub const EXTERNAL_STALL_TIMEOUT: Duration = Duration::from_secs(1000);

/// Interval-mode pulls time out after this many trigger periods.
pub const INTERVAL_TIMEOUT_FACTOR: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum ReadWindowError {
    #[error("Window count must be at least 1")]
    NoWindows,

    #[error("Window count {windows} exceeds the board's {max} windows")]
    TooManyWindows { windows: usize, max: usize },

    #[error("Lookback of {lookback} windows exceeds the {windows} windows read out")]
    LookbackTooLarge { lookback: usize, windows: usize },

    #[error("{after_trigger} after-trigger windows exceed the {windows} windows read out")]
    AfterTriggerTooLarge { after_trigger: usize, windows: usize },
}

/// How many windows are read out per event and where they sit relative to the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWindow {
    pub windows: usize,
    pub lookback: usize,
    pub write_after_trigger: usize,
}

impl ReadWindow {
    pub fn builder() -> ReadWindowBuilder {
        ReadWindowBuilder::new()
    }

    pub fn validate(&self, params: &BoardParams) -> Result<(), ReadWindowError> {
        if self.windows == 0 {
            return Err(ReadWindowError::NoWindows);
        }
        if self.windows > params.total_windows {
            return Err(ReadWindowError::TooManyWindows {
                windows: self.windows,
                max: params.total_windows,
            });
        }
        if self.lookback > self.windows {
            return Err(ReadWindowError::LookbackTooLarge {
                lookback: self.lookback,
                windows: self.windows,
            });
        }
        if self.write_after_trigger > self.windows {
            return Err(ReadWindowError::AfterTriggerTooLarge {
                after_trigger: self.write_after_trigger,
                windows: self.windows,
            });
        }
        Ok(())
    }
}

impl Default for ReadWindow {
    /// 40 windows of which 22 precede the trigger. 40 is the most the evaluation board
    /// transfers without dropping packets.
    fn default() -> Self {
        Self {
            windows: 40,
            lookback: 22,
            write_after_trigger: 18,
        }
    }
}

#[derive(Debug)]
pub struct ReadWindowBuilder {
    window: ReadWindow,
}

impl ReadWindowBuilder {
    pub fn new() -> Self {
        Self {
            window: ReadWindow::default(),
        }
    }

    pub fn windows(mut self, windows: usize) -> Self {
        self.window.windows = windows;
        self
    }

    pub fn lookback(mut self, lookback: usize) -> Self {
        self.window.lookback = lookback;
        self
    }

    pub fn write_after_trigger(mut self, windows: usize) -> Self {
        self.window.write_after_trigger = windows;
        self
    }

    pub fn build(self, params: &BoardParams) -> Result<ReadWindow, ReadWindowError> {
        self.window.validate(params)?;
        Ok(self.window)
    }
}

impl Default for ReadWindowBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Pulses come from outside equipment; the scheduler never fires.
    External,
    /// Self-trigger every `period`.
    Interval(Duration),
}

impl TriggerMode {
    /// Bound for a single event pull in this mode, or `None` if the interval is so long
    /// the bound does not fit in a `Duration`.
    pub fn checked_pull_timeout(&self) -> Option<Duration> {
        match self {
            TriggerMode::External => Some(EXTERNAL_STALL_TIMEOUT),
            TriggerMode::Interval(period) => period.checked_mul(INTERVAL_TIMEOUT_FACTOR),
        }
    }

    /// Bound for a single event pull in this mode. Saturates at `Duration::MAX`.
    pub fn pull_timeout(&self) -> Duration {
        self.checked_pull_timeout().unwrap_or(Duration::MAX)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::External => "external",
            TriggerMode::Interval(_) => "interval",
        }
    }
}

/// How an interval scheduler makes up for a cycle that ran long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CadencePolicy {
    /// Sleep the overrun of the previous cycle, then a full period.
    #[default]
    OverrunCompensated,
    /// Sleep until one period after the previous trigger, or not at all if already late.
    FixedDeadline,
}

impl CadencePolicy {
    /// Delay before the next trigger given the time elapsed since the previous one.
    pub fn delay(&self, period: Duration, since_last: Duration) -> Duration {
        match self {
            CadencePolicy::OverrunCompensated => {
                since_last.saturating_sub(period) + period
            }
            CadencePolicy::FixedDeadline => period.saturating_sub(since_last),
        }
    }
}

/// Fires software triggers on a fixed cadence, or does nothing in external mode.
#[derive(Debug)]
pub struct TriggerScheduler {
    mode: TriggerMode,
    policy: CadencePolicy,
    last_trigger: Option<Instant>,
    fired: u64,
}

impl TriggerScheduler {
    pub fn new(mode: TriggerMode, policy: CadencePolicy) -> Self {
        Self {
            mode,
            policy,
            last_trigger: None,
            fired: 0,
        }
    }

    /// Trigger pulses sent so far, including the priming pulse.
    pub fn fired(&self) -> u64 {
        self.fired
    }

    /// Send the throwaway pulse the board swallows right after readout starts.
    pub fn prime<B: BoardInterface + ?Sized>(&mut self, board: &mut B) -> Result<(), BoardError> {
        if let TriggerMode::Interval(_) = self.mode {
            log::debug!("Sending priming trigger");
            self.fire(board)?;
        }
        Ok(())
    }

    /// Wait out the cadence and fire the next trigger. Returns immediately in external mode.
    pub fn wait_and_fire<B: BoardInterface + ?Sized>(
        &mut self,
        board: &mut B,
    ) -> Result<(), BoardError> {
        let TriggerMode::Interval(period) = self.mode else {
            return Ok(());
        };

        let since_last = self
            .last_trigger
            .map_or(Duration::ZERO, |t| t.elapsed());
        let delay = self.policy.delay(period, since_last);
        if delay > period {
            log::debug!("Trigger cycle overran by {:?}", delay - period);
        }
        thread::sleep(delay);

        self.fire(board)
    }

    fn fire<B: BoardInterface + ?Sized>(&mut self, board: &mut B) -> Result<(), BoardError> {
        board.trigger_once()?;
        self.last_trigger = Some(Instant::now());
        self.fired += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::ScriptedBoard;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_default_read_window() {
        let params = BoardParams::new(4, 64, 32);
        let window = ReadWindow::builder().build(&params).unwrap();
        assert_eq!(window.windows, 40);
        assert_eq!(window.lookback, 22);
        assert_eq!(window.write_after_trigger, 18);
    }

    #[test]
    fn test_read_window_validation() {
        let params = BoardParams::new(4, 32, 32);
        assert_eq!(
            ReadWindow::builder().build(&params),
            Err(ReadWindowError::TooManyWindows {
                windows: 40,
                max: 32
            })
        );
        assert_eq!(
            ReadWindow::builder().windows(0).build(&params),
            Err(ReadWindowError::NoWindows)
        );
        assert!(matches!(
            ReadWindow::builder()
                .windows(8)
                .lookback(9)
                .write_after_trigger(2)
                .build(&params),
            Err(ReadWindowError::LookbackTooLarge { .. })
        ));
        assert!(ReadWindow::builder()
            .windows(8)
            .lookback(4)
            .write_after_trigger(4)
            .build(&params)
            .is_ok());
    }

    #[test]
    fn test_pull_timeout() {
        assert_eq!(TriggerMode::External.pull_timeout(), EXTERNAL_STALL_TIMEOUT);
        assert_eq!(TriggerMode::Interval(ms(100)).pull_timeout(), ms(500));

        let huge = TriggerMode::Interval(Duration::from_secs(u64::MAX / 4));
        assert_eq!(huge.checked_pull_timeout(), None);
        assert_eq!(huge.pull_timeout(), Duration::MAX);
    }

    #[test]
    fn test_overrun_compensated_delay() {
        let policy = CadencePolicy::OverrunCompensated;
        assert_eq!(policy.delay(ms(100), ms(40)), ms(100));
        assert_eq!(policy.delay(ms(100), ms(100)), ms(100));
        assert_eq!(policy.delay(ms(100), ms(130)), ms(130));
    }

    #[test]
    fn test_fixed_deadline_delay() {
        let policy = CadencePolicy::FixedDeadline;
        assert_eq!(policy.delay(ms(100), ms(40)), ms(60));
        assert_eq!(policy.delay(ms(100), ms(130)), Duration::ZERO);
    }

    #[test]
    fn test_external_scheduler_never_fires() {
        let mut board = ScriptedBoard::new(BoardParams::new(1, 2, 2));
        let mut scheduler = TriggerScheduler::new(TriggerMode::External, CadencePolicy::default());
        scheduler.prime(&mut board).unwrap();
        scheduler.wait_and_fire(&mut board).unwrap();
        assert_eq!(scheduler.fired(), 0);
        assert_eq!(board.triggers(), 0);
    }

    #[test]
    fn test_interval_scheduler_primes_then_fires() {
        let mut board = ScriptedBoard::new(BoardParams::new(1, 2, 2));
        let mut scheduler =
            TriggerScheduler::new(TriggerMode::Interval(ms(20)), CadencePolicy::FixedDeadline);
        scheduler.prime(&mut board).unwrap();
        assert_eq!(board.triggers(), 1);

        let start = Instant::now();
        scheduler.wait_and_fire(&mut board).unwrap();
        scheduler.wait_and_fire(&mut board).unwrap();
        assert!(start.elapsed() >= ms(40));
        assert_eq!(scheduler.fired(), 3);
        assert_eq!(board.triggers(), 3);
    }
}
