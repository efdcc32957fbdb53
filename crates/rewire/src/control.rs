//! Control values shared between the control thread and the realtime thread.
//!
//! The control thread writes requested values into [`ControlState`] under a
//! mutex. The realtime thread only ever `try_lock`s it, and when that
//! succeeds it copies whatever changed into its own [`LiveControls`]. If the
//! lock is busy the cycle runs with last cycle's values.
//!
//! Each slot carries a serial number bumped on every write, so the realtime
//! side can tell what changed without the control thread keeping a queue
//! that the realtime side would have to clear.

/// Length of one smoothing block.
pub const SMOOTH_BLOCK_SECONDS: f32 = 0.001;

/// Time a full ramp from old to new value takes.
pub const SMOOTH_SECONDS: f32 = 0.05;

/// Frames per smoothing block: about 1 ms, rounded up to a multiple of 4.
pub fn smoothing_block(sample_rate: u32) -> usize {
    let frames = ((sample_rate as f32 * SMOOTH_BLOCK_SECONDS).round() as usize).max(4);
    frames.div_ceil(4) * 4
}

/// Fraction of a full ramp covered by `frames` samples.
pub fn smoothing_step(frames: usize, sample_rate: u32) -> f32 {
    frames as f32 / SMOOTH_SECONDS / sample_rate.max(1) as f32
}

/// A value that ramps linearly from where it was to a new target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothedValue {
    value: f32,
    origin: f32,
    target: f32,
    smooth: bool,
}

impl SmoothedValue {
    pub fn new(value: f32, smooth: bool) -> Self {
        Self {
            value,
            origin: value,
            target: value,
            smooth,
        }
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    /// A target equal to the current one keeps the ramp origin. Values
    /// that do not smooth jump straight to the target.
    pub fn set_target(&mut self, target: f32) {
        if target != self.target {
            self.origin = self.value;
            self.target = target;
        }
        if !self.smooth {
            self.value = target;
        }
    }

    pub fn needs_ramp(&self) -> bool {
        self.smooth && self.value != self.target
    }

    /// Move `step` of the full origin-to-target distance, never past the target.
    pub fn advance(&mut self, step: f32) {
        if !self.needs_ramp() {
            self.value = self.target;
            return;
        }
        let next = self.value + (self.target - self.origin) * step;
        let rising = self.target > self.origin;
        if next == self.value || (rising && next >= self.target) || (!rising && next <= self.target) {
            self.value = self.target;
        } else {
            self.value = next;
        }
    }

    pub fn finish(&mut self) {
        self.value = self.target;
    }
}

/// Realtime-owned working copy. Allocated when the client connects.
#[derive(Debug, Clone)]
pub struct LiveControls {
    pub gain: [SmoothedValue; 2],
    pub controls: Vec<SmoothedValue>,
    gain_serial: u64,
    serials: Vec<u64>,
}

impl LiveControls {
    pub fn needs_ramp(&self) -> bool {
        self.gain.iter().any(SmoothedValue::needs_ramp)
            || self.controls.iter().any(SmoothedValue::needs_ramp)
    }

    pub fn advance(&mut self, step: f32) {
        for value in self.gain.iter_mut().chain(self.controls.iter_mut()) {
            value.advance(step);
        }
    }

    pub fn finish(&mut self) {
        for value in self.gain.iter_mut().chain(self.controls.iter_mut()) {
            value.finish();
        }
    }
}

/// Requested gains and control values, written by the control thread only.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlState {
    gain: [f64; 2],
    gain_serial: u64,
    values: Vec<f64>,
    serials: Vec<u64>,
}

impl ControlState {
    pub fn new(pregain: f64, postgain: f64, values: Vec<f64>) -> Self {
        Self {
            gain: [pregain, postgain],
            gain_serial: 0,
            serials: vec![0; values.len()],
            values,
        }
    }

    pub fn gains(&self) -> (f64, f64) {
        (self.gain[0], self.gain[1])
    }

    pub fn set_gains(&mut self, pregain: f64, postgain: f64) {
        if self.gain != [pregain, postgain] {
            self.gain = [pregain, postgain];
            self.gain_serial += 1;
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Queue a new value for one control slot. Out-of-range slots are ignored.
    pub fn set_value(&mut self, slot: usize, value: f64) {
        if let (Some(current), Some(serial)) = (self.values.get_mut(slot), self.serials.get_mut(slot)) {
            if *current != value {
                *current = value;
                *serial += 1;
            }
        }
    }

    /// Build the realtime copy, already settled at the requested values.
    pub fn live(&self, smooth: &[bool], smoothing: bool) -> LiveControls {
        LiveControls {
            gain: [
                SmoothedValue::new(self.gain[0] as f32, smoothing),
                SmoothedValue::new(self.gain[1] as f32, smoothing),
            ],
            controls: self
                .values
                .iter()
                .enumerate()
                .map(|(slot, value)| {
                    let ramps = smoothing && smooth.get(slot).copied().unwrap_or(false);
                    SmoothedValue::new(*value as f32, ramps)
                })
                .collect(),
            gain_serial: self.gain_serial,
            serials: self.serials.clone(),
        }
    }

    /// Copy everything that changed since the last transfer into `live`.
    /// Reads only. Realtime safe.
    pub fn transfer(&self, live: &mut LiveControls) {
        if live.gain_serial != self.gain_serial {
            live.gain[0].set_target(self.gain[0] as f32);
            live.gain[1].set_target(self.gain[1] as f32);
            live.gain_serial = self.gain_serial;
        }

        for (slot, serial) in self.serials.iter().enumerate() {
            if let (Some(seen), Some(value)) = (live.serials.get_mut(slot), live.controls.get_mut(slot)) {
                if *seen != *serial {
                    value.set_target(self.values[slot] as f32);
                    *seen = *serial;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoothing_block_rounds_up_to_four() {
        assert_eq!(smoothing_block(48_000), 48);
        assert_eq!(smoothing_block(44_100), 44);
        assert_eq!(smoothing_block(22_050), 24);
        assert_eq!(smoothing_block(1_000), 4);
        assert_eq!(smoothing_block(0), 4);
    }

    #[test]
    fn test_ramp_reaches_target_without_overshoot() {
        let mut value = SmoothedValue::new(0.0, true);
        value.set_target(1.0);

        let mut steps = 0;
        while value.needs_ramp() {
            value.advance(0.3);
            assert!(value.value() <= 1.0);
            steps += 1;
        }
        assert_eq!(steps, 4);
        assert_eq!(value.value(), 1.0);
    }

    #[test]
    fn test_ramp_down() {
        let mut value = SmoothedValue::new(1.0, true);
        value.set_target(0.0);
        value.advance(0.5);
        assert_eq!(value.value(), 0.5);
        value.advance(0.5);
        assert_eq!(value.value(), 0.0);
        assert!(!value.needs_ramp());
    }

    #[test]
    fn test_unsmoothed_value_jumps() {
        let mut value = SmoothedValue::new(0.0, false);
        value.set_target(1.0);
        assert!(!value.needs_ramp());
        value.advance(0.01);
        assert_eq!(value.value(), 1.0);
    }

    #[test]
    fn test_same_target_keeps_origin() {
        let mut value = SmoothedValue::new(0.0, true);
        value.set_target(1.0);
        value.advance(0.5);
        value.set_target(1.0);
        value.advance(0.5);
        assert_eq!(value.value(), 1.0);
    }

    #[test]
    fn test_transfer_only_moves_changes() {
        let mut state = ControlState::new(1.0, 1.0, vec![0.0, 5.0]);
        let mut live = state.live(&[true, true], false);

        state.transfer(&mut live);
        assert_eq!(live.controls[1].target(), 5.0);

        state.set_value(1, 7.0);
        state.set_gains(0.5, 1.0);
        state.transfer(&mut live);
        live.finish();
        assert_eq!(live.controls[1].value(), 7.0);
        assert_eq!(live.gain[0].value(), 0.5);

        // The state itself is never consumed by a transfer
        assert_eq!(state.values(), &[0.0, 7.0]);
        let mut second = state.live(&[true, true], false);
        state.transfer(&mut second);
        assert_eq!(second.controls[1].value(), 7.0);
    }

    #[test]
    fn test_set_value_out_of_range_ignored() {
        let mut state = ControlState::new(1.0, 1.0, vec![0.0]);
        state.set_value(3, 1.0);
        assert_eq!(state.values(), &[0.0]);
    }
}
