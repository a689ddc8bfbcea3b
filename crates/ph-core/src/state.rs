//! Driver level state machine.
//!
//! The test cell client drives the handler through nested levels (driver,
//! lot, device, pause). Each framework call maps to an [`Action`]; the state
//! machine decides the next [`Level`] and maintains the driver, tester and
//! skip modes that device start/done consult.
//!
//! A transition is looked up for the current level first. When the current
//! level defines nothing for the action, the level independent defaults
//! apply, and when those define nothing either the action is accepted without
//! any state change. An illegal transition is reported but the level still
//! changes: a misbehaving test cell client must not wedge the driver.

use std::fmt;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Nesting level of the test cell client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Level {
    #[default]
    Start,
    DriverStarted,
    DriverDone,
    LotStarted,
    LotDone,
    DeviceStarted,
    DeviceDone,
    PauseStarted,
    PauseDone,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Level::Start => "at start of driver",
            Level::DriverStarted => "driver started",
            Level::DriverDone => "driver done",
            Level::LotStarted => "lot started",
            Level::LotDone => "lot done",
            Level::DeviceStarted => "device started",
            Level::DeviceDone => "device done",
            Level::PauseStarted => "pause started",
            Level::PauseDone => "pause done",
        };
        f.write_str(text)
    }
}

/// Framework call, as seen by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    DriverStart,
    DriverDone,
    LotStart,
    LotDone,
    StripStart,
    StripDone,
    DeviceStart,
    DeviceDone,
    PauseStart,
    PauseDone,
    HandtestStart,
    HandtestStop,
    StepmodeStart,
    StepmodeStop,
    Reprobe,
    GetId,
    GetStatus,
    SetStatus,
    ExecGpibCmd,
    ExecGpibQuery,
    GetSrqStatusByte,
}

/// Hand test and single step modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverMode {
    #[default]
    Normal,
    Hand,
    SingleStep,
    SingleStepHand,
}

impl DriverMode {
    pub fn is_hand(self) -> bool {
        matches!(self, DriverMode::Hand | DriverMode::SingleStepHand)
    }
}

/// Whether the current device cycle retests or checks the inserted devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TesterMode {
    #[default]
    Normal,
    Retest,
    Check,
}

/// Device skipping, requested by the operator during a pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SkipMode {
    #[default]
    Normal,
    /// Skip the devices of the next cycle.
    Next,
    /// The devices of the current cycle are skipped.
    Current,
    /// Current devices are skipped and so will be the next ones.
    NextCurrent,
}

/// Tester system flags consulted during transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateFlags {
    pub abort: bool,
    pub retest: bool,
    pub check_device: bool,
    pub skip: bool,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    /// The action is not expected at the current level.
    #[error("possible error in test cell client: {action:?} while {level}")]
    IllegalTransition { level: Level, action: Action },

    /// The requested mode is already active.
    #[error("{0:?} ignored, mode already set")]
    Ignored(Action),
}

/// Result of applying an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct LevelChange {
    pub outcome: Result<(), StateError>,
    /// The tester pause flag should be cleared.
    pub release_pause: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reach {
    DriverStarted,
    LotStarted,
    DeviceStarted,
    PauseStarted,
    PauseDone,
    DeviceDone,
    LotDone,
    DriverDone,
    DriverMode,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    next: Option<Level>,
    reach: Option<Reach>,
}

const fn entry(next: Level, reach: Option<Reach>) -> Option<Entry> {
    Some(Entry {
        next: Some(next),
        reach,
    })
}

/// Transitions that depend on the current level.
fn level_entry(level: Level, action: Action) -> Option<Entry> {
    use Action as A;
    use Level as L;
    match (level, action) {
        (L::Start, A::DriverStart) => entry(L::DriverStarted, Some(Reach::DriverStarted)),

        (L::DriverStarted, A::LotStart) => entry(L::LotStarted, Some(Reach::LotStarted)),
        (L::DriverStarted, A::DeviceStart) => entry(L::DeviceStarted, Some(Reach::DeviceStarted)),
        (L::DriverStarted, A::DriverDone) => entry(L::DriverDone, Some(Reach::DriverDone)),
        (L::DriverStarted, A::DriverStart) => entry(L::DriverStarted, None),

        (L::DriverDone, A::DriverStart) => entry(L::DriverStarted, Some(Reach::DriverStarted)),
        (L::DriverDone, A::DriverDone) => entry(L::DriverDone, None),

        (L::LotStarted, A::DeviceStart) => entry(L::DeviceStarted, Some(Reach::DeviceStarted)),
        (L::LotStarted, A::LotDone) => entry(L::LotDone, Some(Reach::LotDone)),
        (L::LotStarted, A::DriverDone) => entry(L::DriverDone, Some(Reach::DriverDone)),
        (L::LotStarted, A::LotStart) => entry(L::LotStarted, None),

        (L::LotDone, A::LotStart) => entry(L::LotStarted, Some(Reach::LotStarted)),
        (L::LotDone, A::DriverDone) => entry(L::DriverDone, Some(Reach::DriverDone)),
        (L::LotDone, A::LotDone) => entry(L::LotDone, None),

        (L::DeviceStarted, A::PauseStart) => entry(L::PauseStarted, Some(Reach::PauseStarted)),
        (L::DeviceStarted, A::DeviceDone) => entry(L::DeviceDone, Some(Reach::DeviceDone)),
        (L::DeviceStarted, A::LotDone) => entry(L::LotDone, Some(Reach::LotDone)),
        (L::DeviceStarted, A::DeviceStart) => entry(L::DeviceStarted, None),

        (L::DeviceDone, A::DeviceStart) => entry(L::DeviceStarted, Some(Reach::DeviceStarted)),
        (L::DeviceDone, A::LotDone) => entry(L::LotDone, Some(Reach::LotDone)),
        (L::DeviceDone, A::DriverDone) => entry(L::DriverDone, Some(Reach::DriverDone)),
        (L::DeviceDone, A::DeviceDone) => entry(L::DeviceDone, None),

        (L::PauseStarted, A::PauseDone) => entry(L::PauseDone, Some(Reach::PauseDone)),
        (L::PauseStarted, A::PauseStart) => entry(L::PauseStarted, None),

        (L::PauseDone, A::DeviceDone) => entry(L::DeviceDone, Some(Reach::DeviceDone)),
        (L::PauseDone, A::PauseDone) => entry(L::PauseDone, None),

        _ => None,
    }
}

/// Level independent transitions.
fn default_entry(action: Action) -> Option<Entry> {
    use Action as A;
    use Level as L;
    match action {
        A::DriverStart => entry(L::DriverStarted, Some(Reach::DriverStarted)),
        A::LotStart => entry(L::LotStarted, Some(Reach::LotStarted)),
        A::DeviceStart => entry(L::DeviceStarted, Some(Reach::DeviceStarted)),
        A::PauseStart => entry(L::PauseStarted, Some(Reach::PauseStarted)),
        A::PauseDone => entry(L::PauseDone, Some(Reach::PauseDone)),
        A::DeviceDone => entry(L::DeviceDone, Some(Reach::DeviceDone)),
        A::LotDone => entry(L::LotDone, Some(Reach::LotDone)),
        A::DriverDone => entry(L::DriverDone, Some(Reach::DriverDone)),
        A::HandtestStart | A::HandtestStop | A::StepmodeStart | A::StepmodeStop => Some(Entry {
            next: None,
            reach: Some(Reach::DriverMode),
        }),
        _ => None,
    }
}

/// Level, mode and skip state of one driver instance.
#[derive(Debug, Clone, Default)]
pub struct DriverState {
    level: Level,
    driver_mode: DriverMode,
    tester_mode: TesterMode,
    skip_mode: SkipMode,
    lot_level_used: bool,
    current_action: Option<Action>,
}

impl DriverState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn driver_mode(&self) -> DriverMode {
        self.driver_mode
    }

    pub fn set_driver_mode(&mut self, mode: DriverMode) {
        self.driver_mode = mode;
    }

    pub fn tester_mode(&self) -> TesterMode {
        self.tester_mode
    }

    pub fn set_tester_mode(&mut self, mode: TesterMode) {
        self.tester_mode = mode;
    }

    pub fn skip_mode(&self) -> SkipMode {
        self.skip_mode
    }

    pub fn set_skip_mode(&mut self, mode: SkipMode) {
        self.skip_mode = mode;
    }

    pub fn lot_level_used(&self) -> bool {
        self.lot_level_used
    }

    /// The action most recently checked or applied.
    pub fn current_action(&self) -> Option<Action> {
        self.current_action
    }

    fn lookup(&self, action: Action) -> Option<Entry> {
        level_entry(self.level, action).or_else(|| default_entry(action))
    }

    /// Apply `action`, changing level and modes.
    pub fn change_level(&mut self, action: Action, flags: StateFlags) -> LevelChange {
        trace!(?action, level = ?self.level, "change level");
        self.current_action = Some(action);
        let Some(entry) = self.lookup(action) else {
            return LevelChange {
                outcome: Ok(()),
                release_pause: false,
            };
        };

        let mut release_pause = false;
        let outcome = match entry.reach {
            Some(reach) => self.step(reach, action, flags, &mut release_pause),
            None => Ok(()),
        };
        if let Err(e) = &outcome {
            match e {
                StateError::IllegalTransition { .. } => warn!("{}", e),
                StateError::Ignored(_) => debug!("{}", e),
            }
        }

        if let Some(next) = entry.next {
            self.level = next;
            debug!("changed state to '{}'", self.level);
        }

        LevelChange {
            outcome,
            release_pause,
        }
    }

    /// Check whether `action` is legal at the current level without applying it.
    pub fn check_level_change(&mut self, action: Action, flags: StateFlags) -> Result<(), StateError> {
        self.current_action = Some(action);
        match self.lookup(action).and_then(|e| e.reach) {
            Some(reach) => self.check(reach, action, flags),
            None => Ok(()),
        }
    }

    fn illegal(&self, action: Action) -> StateError {
        StateError::IllegalTransition {
            level: self.level,
            action,
        }
    }

    fn check(&self, reach: Reach, action: Action, flags: StateFlags) -> Result<(), StateError> {
        use Level as L;
        let legal = match reach {
            Reach::DriverStarted => matches!(self.level, L::Start | L::DriverDone),
            Reach::LotStarted => matches!(self.level, L::DriverStarted | L::LotDone),
            Reach::DeviceStarted => {
                matches!(self.level, L::DriverStarted | L::LotStarted | L::DeviceDone)
            }
            Reach::PauseStarted => self.level == L::DeviceStarted,
            Reach::PauseDone => self.level == L::PauseStarted,
            Reach::DeviceDone => matches!(self.level, L::DeviceStarted | L::PauseDone),
            Reach::LotDone => {
                let from_ok = match self.level {
                    L::DeviceDone | L::LotStarted => true,
                    L::DeviceStarted => flags.abort,
                    _ => false,
                };
                from_ok && self.lot_level_used
            }
            Reach::DriverDone => {
                if self.lot_level_used {
                    match self.level {
                        L::LotDone => true,
                        L::LotStarted => flags.abort,
                        _ => false,
                    }
                } else {
                    match self.level {
                        L::DeviceDone | L::DriverStarted | L::LotDone => true,
                        L::DeviceStarted => flags.abort,
                        _ => false,
                    }
                }
            }
            Reach::DriverMode => {
                let allowed = match action {
                    Action::HandtestStart => !self.driver_mode.is_hand(),
                    Action::HandtestStop => self.driver_mode.is_hand(),
                    Action::StepmodeStart => {
                        matches!(self.driver_mode, DriverMode::Normal | DriverMode::Hand)
                    }
                    Action::StepmodeStop => matches!(
                        self.driver_mode,
                        DriverMode::SingleStep | DriverMode::SingleStepHand
                    ),
                    _ => true,
                };
                return if allowed {
                    Ok(())
                } else {
                    Err(StateError::Ignored(action))
                };
            }
        };
        if legal {
            Ok(())
        } else {
            Err(self.illegal(action))
        }
    }

    fn step(
        &mut self,
        reach: Reach,
        action: Action,
        flags: StateFlags,
        release_pause: &mut bool,
    ) -> Result<(), StateError> {
        if reach == Reach::DriverMode {
            return self.serve_driver_mode(action);
        }
        let outcome = self.check(reach, action, flags);

        match reach {
            Reach::LotStarted => self.lot_level_used = true,
            Reach::DeviceStarted => {
                if self.skip_mode == SkipMode::Next {
                    self.skip_mode = SkipMode::Current;
                }
                self.tester_mode = TesterMode::Normal;
            }
            Reach::PauseDone => {
                if flags.retest {
                    self.tester_mode = TesterMode::Retest;
                } else if flags.check_device {
                    self.tester_mode = TesterMode::Check;
                }
                if flags.skip {
                    self.skip_mode = match self.skip_mode {
                        SkipMode::Normal => SkipMode::Next,
                        SkipMode::Current => SkipMode::NextCurrent,
                        other => other,
                    };
                } else if flags.retest && self.skip_mode == SkipMode::Current {
                    self.skip_mode = SkipMode::Normal;
                }
                *release_pause = !flags.skip && !flags.check_device && !flags.retest;
            }
            Reach::DeviceDone => {
                self.skip_mode = match self.skip_mode {
                    SkipMode::Current => SkipMode::Normal,
                    SkipMode::NextCurrent => SkipMode::Next,
                    other => other,
                };
            }
            Reach::DriverDone => self.lot_level_used = false,
            _ => {}
        }
        outcome
    }

    fn serve_driver_mode(&mut self, action: Action) -> Result<(), StateError> {
        use DriverMode as M;
        let next = match (action, self.driver_mode) {
            (Action::HandtestStart, M::Normal) => M::Hand,
            (Action::HandtestStart, M::SingleStep) => M::SingleStepHand,
            (Action::HandtestStop, M::Hand) => M::Normal,
            (Action::HandtestStop, M::SingleStepHand) => M::SingleStep,
            (Action::StepmodeStart, M::Normal) => M::SingleStep,
            (Action::StepmodeStart, M::Hand) => M::SingleStepHand,
            (Action::StepmodeStop, M::SingleStep) => M::Normal,
            (Action::StepmodeStop, M::SingleStepHand) => M::Hand,
            (
                Action::HandtestStart
                | Action::HandtestStop
                | Action::StepmodeStart
                | Action::StepmodeStop,
                _,
            ) => return Err(StateError::Ignored(action)),
            _ => return Ok(()),
        };
        self.driver_mode = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(state: &mut DriverState, actions: &[Action]) {
        for a in actions {
            assert_eq!(
                state.change_level(*a, StateFlags::default()).outcome,
                Ok(()),
                "{:?} from {:?}",
                a,
                state.level()
            );
        }
    }

    #[test]
    fn regular_lot_cycle() {
        let mut s = DriverState::new();
        run(
            &mut s,
            &[
                Action::DriverStart,
                Action::LotStart,
                Action::DeviceStart,
                Action::DeviceDone,
                Action::DeviceStart,
                Action::DeviceDone,
                Action::LotDone,
                Action::DriverDone,
            ],
        );
        assert_eq!(s.level(), Level::DriverDone);
        assert!(!s.lot_level_used());
    }

    #[test]
    fn device_cycle_without_lot_level() {
        let mut s = DriverState::new();
        run(
            &mut s,
            &[
                Action::DriverStart,
                Action::DeviceStart,
                Action::DeviceDone,
                Action::DriverDone,
            ],
        );
    }

    #[test]
    fn illegal_transition_still_changes_level() {
        let mut s = DriverState::new();
        let change = s.change_level(Action::DeviceDone, StateFlags::default());
        assert_eq!(
            change.outcome,
            Err(StateError::IllegalTransition {
                level: Level::Start,
                action: Action::DeviceDone
            })
        );
        assert_eq!(s.level(), Level::DeviceDone);
    }

    #[test]
    fn lot_done_requires_lot_level() {
        let mut s = DriverState::new();
        run(&mut s, &[Action::DriverStart, Action::DeviceStart, Action::DeviceDone]);
        let change = s.change_level(Action::LotDone, StateFlags::default());
        assert!(change.outcome.is_err());
    }

    #[test]
    fn lot_done_from_device_started_only_on_abort() {
        let mut s = DriverState::new();
        run(&mut s, &[Action::DriverStart, Action::LotStart, Action::DeviceStart]);
        let mut plain = s.clone();
        assert!(plain
            .change_level(Action::LotDone, StateFlags::default())
            .outcome
            .is_err());
        let abort = StateFlags {
            abort: true,
            ..Default::default()
        };
        assert_eq!(s.change_level(Action::LotDone, abort).outcome, Ok(()));
    }

    #[test]
    fn pause_with_skip_marks_next_devices() {
        let mut s = DriverState::new();
        run(&mut s, &[Action::DriverStart, Action::DeviceStart, Action::PauseStart]);
        let skip = StateFlags {
            skip: true,
            ..Default::default()
        };
        let change = s.change_level(Action::PauseDone, skip);
        assert_eq!(change.outcome, Ok(()));
        assert!(!change.release_pause);
        assert_eq!(s.skip_mode(), SkipMode::Next);

        run(&mut s, &[Action::DeviceDone]);
        assert_eq!(s.skip_mode(), SkipMode::Next);
        run(&mut s, &[Action::DeviceStart]);
        assert_eq!(s.skip_mode(), SkipMode::Current);
        run(&mut s, &[Action::DeviceDone]);
        assert_eq!(s.skip_mode(), SkipMode::Normal);
    }

    #[test]
    fn pause_with_retest_sets_tester_mode() {
        let mut s = DriverState::new();
        run(&mut s, &[Action::DriverStart, Action::DeviceStart, Action::PauseStart]);
        let retest = StateFlags {
            retest: true,
            ..Default::default()
        };
        assert_eq!(s.change_level(Action::PauseDone, retest).outcome, Ok(()));
        assert_eq!(s.tester_mode(), TesterMode::Retest);
        run(&mut s, &[Action::DeviceDone, Action::DeviceStart]);
        assert_eq!(s.tester_mode(), TesterMode::Normal);
    }

    #[test]
    fn plain_pause_releases_pause_flag() {
        let mut s = DriverState::new();
        run(&mut s, &[Action::DriverStart, Action::DeviceStart, Action::PauseStart]);
        let change = s.change_level(Action::PauseDone, StateFlags::default());
        assert!(change.release_pause);
    }

    #[test]
    fn repeated_mode_toggles_are_ignored() {
        let mut s = DriverState::new();
        run(&mut s, &[Action::DriverStart, Action::HandtestStart]);
        assert_eq!(s.driver_mode(), DriverMode::Hand);
        assert_eq!(
            s.change_level(Action::HandtestStart, StateFlags::default()).outcome,
            Err(StateError::Ignored(Action::HandtestStart))
        );
        run(&mut s, &[Action::StepmodeStart]);
        assert_eq!(s.driver_mode(), DriverMode::SingleStepHand);
        run(&mut s, &[Action::HandtestStop, Action::StepmodeStop]);
        assert_eq!(s.driver_mode(), DriverMode::Normal);
        assert_eq!(s.level(), Level::DriverStarted);
    }

    #[test]
    fn check_does_not_change_anything() {
        let mut s = DriverState::new();
        assert!(s
            .check_level_change(Action::DeviceStart, StateFlags::default())
            .is_err());
        assert_eq!(s.level(), Level::Start);
        assert_eq!(s.current_action(), Some(Action::DeviceStart));
        assert!(s.check_level_change(Action::GetStatus, StateFlags::default()).is_ok());
    }
}
