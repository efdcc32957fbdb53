//! Plugins compiled into the host.

use std::sync::Arc;

use crate::plugin::{
    Plugin, PluginDescriptor, PluginError, PluginInstance, PluginPort, RangeHint, RunBuffers,
};
use crate::server::PortDirection;

pub const AMP_ID: u64 = 1001;
pub const DELAY_ID: u64 = 1002;

const INPUT: usize = 0;
const OUTPUT: usize = 1;

/// Longest delay the delay plugin supports.
const MAX_DELAY_MS: f32 = 1000.0;

pub fn plugins() -> Vec<Arc<dyn Plugin>> {
    vec![Arc::new(Amplifier::new()), Arc::new(Delay::new())]
}

/// Mono gain stage with a mute switch.
pub struct Amplifier {
    descriptor: PluginDescriptor,
}

impl Amplifier {
    const GAIN: usize = 2;
    const MUTE: usize = 3;

    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor {
                unique_id: AMP_ID,
                label: "amp".to_string(),
                name: "Mono Amplifier".to_string(),
                maker: "rewire".to_string(),
                ports: vec![
                    PluginPort::audio("Input", PortDirection::Input),
                    PluginPort::audio("Output", PortDirection::Output),
                    PluginPort::control("Gain (dB)", RangeHint::bounded(-60.0, 24.0, 0.0)),
                    PluginPort::control("Mute", RangeHint::toggle(false)),
                ],
            },
        }
    }
}

impl Default for Amplifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for Amplifier {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn instantiate(&self, _sample_rate: u32) -> Result<Box<dyn PluginInstance>, PluginError> {
        Ok(Box::new(AmplifierInstance))
    }
}

struct AmplifierInstance;

impl PluginInstance for AmplifierInstance {
    fn run(&mut self, buffers: &mut RunBuffers<'_>) {
        let gain = if buffers.control(Amplifier::MUTE) > 0.5 {
            0.0
        } else {
            10f32.powf(buffers.control(Amplifier::GAIN) / 20.0)
        };
        let (input, output) = buffers.audio_io(INPUT, OUTPUT);
        for (out, sample) in output.iter_mut().zip(input) {
            *out = sample * gain;
        }
    }
}

/// Mono delay line, up to one second.
pub struct Delay {
    descriptor: PluginDescriptor,
}

impl Delay {
    const TIME: usize = 2;

    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor {
                unique_id: DELAY_ID,
                label: "delay".to_string(),
                name: "Mono Delay".to_string(),
                maker: "rewire".to_string(),
                ports: vec![
                    PluginPort::audio("Input", PortDirection::Input),
                    PluginPort::audio("Output", PortDirection::Output),
                    PluginPort::control("Delay (ms)", RangeHint::bounded(0.0, MAX_DELAY_MS, 0.0)),
                ],
            },
        }
    }
}

impl Default for Delay {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for Delay {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn instantiate(&self, sample_rate: u32) -> Result<Box<dyn PluginInstance>, PluginError> {
        if sample_rate == 0 {
            return Err(PluginError::UnsupportedRate {
                label: self.descriptor.label.clone(),
                rate: sample_rate,
            });
        }
        let length = (sample_rate as f32 * MAX_DELAY_MS / 1000.0) as usize + 1;
        Ok(Box::new(DelayInstance {
            line: vec![0.0; length],
            position: 0,
            sample_rate,
        }))
    }
}

struct DelayInstance {
    line: Vec<f32>,
    position: usize,
    sample_rate: u32,
}

impl PluginInstance for DelayInstance {
    fn activate(&mut self) {
        self.line.fill(0.0);
        self.position = 0;
    }

    fn run(&mut self, buffers: &mut RunBuffers<'_>) {
        let length = self.line.len();
        let ms = buffers.control(Delay::TIME).clamp(0.0, MAX_DELAY_MS);
        let delay = ((ms * self.sample_rate as f32 / 1000.0).round() as usize).min(length - 1);

        let (input, output) = buffers.audio_io(INPUT, OUTPUT);
        for (out, sample) in output.iter_mut().zip(input) {
            self.line[self.position] = *sample;
            *out = self.line[(self.position + length - delay) % length];
            self.position = (self.position + 1) % length;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(instance: &mut dyn PluginInstance, controls: &[f32], input: &[f32]) -> Vec<f32> {
        let mut audio = vec![input.to_vec(), vec![0.0; input.len()], vec![], vec![]];
        let mut buffers = RunBuffers {
            frames: input.len(),
            controls,
            audio: &mut audio,
        };
        instance.run(&mut buffers);
        audio[OUTPUT].clone()
    }

    #[test]
    fn test_amp_gain_in_db() {
        let mut amp = Amplifier::new().instantiate(48_000).unwrap();
        let out = run(amp.as_mut(), &[0.0, 0.0, 20.0, 0.0], &[0.5, -0.5]);
        assert!((out[0] - 5.0).abs() < 1e-5);
        assert!((out[1] + 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_amp_mute() {
        let mut amp = Amplifier::new().instantiate(48_000).unwrap();
        let out = run(amp.as_mut(), &[0.0, 0.0, 0.0, 1.0], &[1.0, 1.0]);
        assert_eq!(out, vec![0.0, 0.0]);
    }

    #[test]
    fn test_delay_shifts_by_samples() {
        // 1 ms at 4 kHz is 4 samples
        let mut delay = Delay::new().instantiate(4_000).unwrap();
        delay.activate();
        let out = run(delay.as_mut(), &[0.0, 0.0, 1.0], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(out, vec![0.0, 0.0, 0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_delay_rejects_zero_rate() {
        assert!(Delay::new().instantiate(0).is_err());
    }

    #[test]
    fn test_control_inputs_in_port_order() {
        let amp = Amplifier::new();
        let controls: Vec<_> = amp.descriptor().control_inputs().collect();
        assert_eq!(controls, vec![2, 3]);
        let inputs: Vec<_> = amp.descriptor().audio_ports(PortDirection::Input).collect();
        assert_eq!(inputs, vec![0]);
    }
}
