//! Local input sources.
//!
//! A real build would read a pad or keyboard here. These sources produce
//! deterministic per-tick input for the demo binary and tests.

use netrace_shared::{
    input::{InputSource, RawInput},
    net::Tick,
};

/// Hands off the controls.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeutralInput;

impl InputSource for NeutralInput {
    fn sample(&mut self, _tick: Tick) -> RawInput {
        RawInput::default()
    }
}

/// Replays a list of `(from_tick, input)` steps. Each step holds until the
/// next one starts; with a period set, the script loops.
#[derive(Debug, Clone)]
pub struct ScriptedInput {
    steps: Vec<(Tick, RawInput)>,
    period: Option<Tick>,
}

impl ScriptedInput {
    pub fn new(mut steps: Vec<(Tick, RawInput)>) -> Self {
        steps.sort_by_key(|(from, _)| *from);
        Self {
            steps,
            period: None,
        }
    }

    pub fn looping(mut self, period: Tick) -> Self {
        self.period = (period > 0).then_some(period);
        self
    }

    /// Accelerate, take a left-hander, brake, roll back a little. Loops every
    /// 8 seconds at `tick_hz`.
    pub fn demo_lap(tick_hz: u32) -> Self {
        let s = |secs: f32| (secs * tick_hz as f32) as Tick;
        let input = |steering, throttle_brake, brake| RawInput {
            steering,
            throttle_brake,
            brake,
        };
        Self::new(vec![
            (s(0.0), input(0.0, 1.0, false)),
            (s(2.5), input(-0.6, 0.6, false)),
            (s(4.5), input(0.0, 0.0, true)),
            (s(6.0), input(0.0, -0.5, false)),
            (s(7.0), input(0.0, 0.0, false)),
        ])
        .looping(s(8.0))
    }
}

impl InputSource for ScriptedInput {
    fn sample(&mut self, tick: Tick) -> RawInput {
        let t = match self.period {
            Some(period) => tick % period,
            None => tick,
        };
        self.steps
            .iter()
            .rev()
            .find(|(from, _)| *from <= t)
            .map(|(_, input)| *input)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_steps_hold_until_next() {
        let accel = RawInput {
            throttle_brake: 1.0,
            ..RawInput::default()
        };
        let brake = RawInput {
            brake: true,
            ..RawInput::default()
        };
        let mut script = ScriptedInput::new(vec![(10, brake), (2, accel)]);

        assert_eq!(script.sample(0), RawInput::default());
        assert_eq!(script.sample(2), accel);
        assert_eq!(script.sample(9), accel);
        assert_eq!(script.sample(50), brake);
    }

    #[test]
    fn demo_lap_loops() {
        let mut lap = ScriptedInput::demo_lap(10);
        assert_eq!(lap.sample(0), lap.sample(80));
        assert!(lap.sample(50).brake);
    }
}
