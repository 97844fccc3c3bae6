//! Executes `FireAt` decisions against a stimulus output.

use core::{fmt, time::Duration};

use crate::scheduler::DeliveryDecision;
use crate::sequence::Stimulus;
use crate::wait::{HighPrecisionWait, MonotonicClock, WaitError};

/// Sound playback and trigger port, as seen by the scheduler.
///
/// Playback is queued ahead of time so the audio backend can start the
/// sound on its own clock; the trigger pulse is issued once the caller has
/// waited for the same offset.
pub trait StimulusOutput {
    type Error;

    /// Queues `stimulus` to start playing `after` from now.
    ///
    /// # Errors
    ///
    /// Implementations surface backend failures.
    fn schedule_playback(&mut self, stimulus: &Stimulus, after: Duration)
    -> Result<(), Self::Error>;

    /// Emits a trigger code on the hardware marker channel.
    ///
    /// # Errors
    ///
    /// Implementations surface port failures.
    fn pulse(&mut self, code: u8) -> Result<(), Self::Error>;
}

/// Failures while delivering a stimulus.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DispatchError<E> {
    Output(E),
    Wait(WaitError),
}

impl<E: fmt::Display> fmt::Display for DispatchError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Output(err) => write!(f, "stimulus output: {err}"),
            DispatchError::Wait(err) => write!(f, "wait: {err}"),
        }
    }
}

/// Carries out `decision`: queue playback, block for the offset, then pulse
/// the stimulus trigger. Returns the delivered stimulus, or `None` on skip.
///
/// # Errors
///
/// Propagates output failures and rejected waits.
pub fn deliver<C, O>(
    decision: &DeliveryDecision,
    wait: &HighPrecisionWait<C>,
    output: &mut O,
) -> Result<Option<Stimulus>, DispatchError<O::Error>>
where
    C: MonotonicClock,
    O: StimulusOutput + ?Sized,
{
    let DeliveryDecision::FireAt { wait: after, stimulus } = *decision else {
        return Ok(None);
    };

    output
        .schedule_playback(&stimulus, after)
        .map_err(DispatchError::Output)?;
    if !after.is_zero() {
        wait.wait(after).map_err(DispatchError::Wait)?;
    }
    output.pulse(stimulus.trigger).map_err(DispatchError::Output)?;
    Ok(Some(stimulus))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SkipReason;
    use crate::sequence::StimulusKind;
    use core::cell::Cell;

    struct StepClock {
        now: Cell<Duration>,
    }

    impl MonotonicClock for StepClock {
        fn now(&self) -> Duration {
            let now = self.now.get() + Duration::from_micros(10);
            self.now.set(now);
            now
        }

        fn sleep(&self, duration: Duration) {
            self.now.set(self.now.get() + duration);
        }
    }

    #[derive(Debug, PartialEq)]
    enum Action {
        Play(u8, Duration),
        Pulse(u8, Duration),
    }

    struct Recorder<'a> {
        clock: &'a StepClock,
        actions: heapless::Vec<Action, 4>,
    }

    impl StimulusOutput for Recorder<'_> {
        type Error = ();

        fn schedule_playback(&mut self, stimulus: &Stimulus, after: Duration) -> Result<(), ()> {
            self.actions
                .push(Action::Play(stimulus.trigger, self.clock.now.get() + after))
                .map_err(|_| ())
        }

        fn pulse(&mut self, code: u8) -> Result<(), ()> {
            self.actions
                .push(Action::Pulse(code, self.clock.now.get()))
                .map_err(|_| ())
        }
    }

    #[test]
    fn pulse_follows_the_wait() {
        let clock = StepClock {
            now: Cell::new(Duration::ZERO),
        };
        let wait = HighPrecisionWait::new(&clock);
        let mut output = Recorder {
            clock: &clock,
            actions: heapless::Vec::new(),
        };
        let stimulus = Stimulus {
            kind: StimulusKind::Deviant,
            trigger: 11,
            frequency: 1000,
            index: 3,
        };
        let decision = DeliveryDecision::FireAt {
            wait: Duration::from_millis(150),
            stimulus,
        };

        assert_eq!(deliver(&decision, &wait, &mut output), Ok(Some(stimulus)));
        let [Action::Play(11, due), Action::Pulse(11, pulsed)] = output.actions.as_slice() else {
            panic!("unexpected actions {:?}", output.actions);
        };
        assert!(pulsed >= due);
        assert!(*pulsed - *due < Duration::from_micros(250));
    }

    #[test]
    fn skip_is_a_no_op() {
        let clock = StepClock {
            now: Cell::new(Duration::ZERO),
        };
        let wait = HighPrecisionWait::new(&clock);
        let mut output = Recorder {
            clock: &clock,
            actions: heapless::Vec::new(),
        };
        let decision = DeliveryDecision::Skip(SkipReason::Complete);
        assert_eq!(deliver(&decision, &wait, &mut output), Ok(None));
        assert!(output.actions.is_empty());
    }
}
