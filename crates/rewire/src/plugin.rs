//! Plugin catalog.
//!
//! A plugin describes its ports up front ([`PluginDescriptor`]) and is
//! instantiated once per sample rate. Instances are driven by the realtime
//! thread through [`PluginInstance::run`], which must not allocate.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use crate::server::PortDirection;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin \"{label}\" cannot run at {rate} Hz")]
    UnsupportedRate { label: String, rate: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    Audio,
    Control,
}

/// Value range of a control port.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RangeHint {
    pub lower: Option<f32>,
    pub upper: Option<f32>,
    pub default: Option<f32>,
    /// Bounds and default are multiples of the sample rate.
    pub sample_rate: bool,
    pub toggled: bool,
    pub integer: bool,
    pub logarithmic: bool,
}

impl RangeHint {
    pub fn bounded(lower: f32, upper: f32, default: f32) -> Self {
        Self {
            lower: Some(lower),
            upper: Some(upper),
            default: Some(default),
            ..Default::default()
        }
    }

    pub fn toggle(default: bool) -> Self {
        Self {
            lower: Some(0.0),
            upper: Some(1.0),
            default: Some(if default { 1.0 } else { 0.0 }),
            toggled: true,
            ..Default::default()
        }
    }

    fn scale(&self, value: Option<f32>, rate: u32) -> Option<f32> {
        if self.sample_rate {
            value.map(|v| v * rate as f32)
        } else {
            value
        }
    }

    /// Bounds at the given sample rate.
    pub fn bounds(&self, rate: u32) -> (Option<f32>, Option<f32>) {
        (self.scale(self.lower, rate), self.scale(self.upper, rate))
    }

    pub fn default_value(&self, rate: u32) -> Option<f32> {
        self.scale(self.default, rate)
    }

    /// Toggles and integer steps jump instead of ramping.
    pub fn smooths(&self) -> bool {
        !self.toggled && !self.integer
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PluginPort {
    pub name: String,
    pub kind: PortKind,
    pub direction: PortDirection,
    pub hint: RangeHint,
}

impl PluginPort {
    pub fn audio(name: &str, direction: PortDirection) -> Self {
        Self {
            name: name.to_string(),
            kind: PortKind::Audio,
            direction,
            hint: RangeHint::default(),
        }
    }

    pub fn control(name: &str, hint: RangeHint) -> Self {
        Self {
            name: name.to_string(),
            kind: PortKind::Control,
            direction: PortDirection::Input,
            hint,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PluginDescriptor {
    pub unique_id: u64,
    pub label: String,
    pub name: String,
    pub maker: String,
    pub ports: Vec<PluginPort>,
}

impl PluginDescriptor {
    /// Indexes of audio ports in one direction, in port order.
    pub fn audio_ports(&self, direction: PortDirection) -> impl Iterator<Item = usize> + '_ {
        self.ports
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.kind == PortKind::Audio && p.direction == direction)
            .map(|(index, _)| index)
    }

    /// Indexes of control inputs, in port order.
    pub fn control_inputs(&self) -> impl Iterator<Item = usize> + '_ {
        self.ports
            .iter()
            .enumerate()
            .filter(|(_, p)| p.kind == PortKind::Control && p.direction == PortDirection::Input)
            .map(|(index, _)| index)
    }

    pub fn to_json(&self, rate: u32) -> Value {
        let ports: Vec<Value> = self
            .ports
            .iter()
            .map(|port| {
                let mut entry = json!({
                    "name": port.name,
                    "kind": port.kind,
                    "direction": port.direction,
                });
                if port.kind == PortKind::Control {
                    let (lower, upper) = port.hint.bounds(rate);
                    entry["range"] = json!({
                        "lower": lower,
                        "upper": upper,
                        "default": port.hint.default_value(rate),
                        "toggled": port.hint.toggled,
                        "integer": port.hint.integer,
                        "logarithmic": port.hint.logarithmic,
                    });
                }
                entry
            })
            .collect();

        json!({
            "unique_id": self.unique_id,
            "label": self.label,
            "name": self.name,
            "maker": self.maker,
            "ports": ports,
        })
    }
}

/// Buffers handed to one [`PluginInstance::run`] call.
///
/// Both slices are indexed by plugin port. `audio` entries of control ports
/// are empty. `controls` entries of audio ports are zero.
pub struct RunBuffers<'a> {
    pub frames: usize,
    pub controls: &'a [f32],
    pub audio: &'a mut [Vec<f32>],
}

impl RunBuffers<'_> {
    pub fn control(&self, port: usize) -> f32 {
        self.controls.get(port).copied().unwrap_or(0.0)
    }

    /// Borrow one input and one output buffer at once.
    ///
    /// Panics if the ports are equal or out of range.
    pub fn audio_io(&mut self, input: usize, output: usize) -> (&[f32], &mut [f32]) {
        let frames = self.frames;
        if input < output {
            let (head, tail) = self.audio.split_at_mut(output);
            (&head[input][..frames], &mut tail[0][..frames])
        } else {
            let (head, tail) = self.audio.split_at_mut(input);
            (&tail[0][..frames], &mut head[output][..frames])
        }
    }
}

pub trait PluginInstance: Send {
    fn activate(&mut self) {}

    /// Process `buffers.frames` samples. Realtime thread, must not allocate.
    fn run(&mut self, buffers: &mut RunBuffers<'_>);

    fn deactivate(&mut self) {}
}

pub trait Plugin: Send + Sync {
    fn descriptor(&self) -> &PluginDescriptor;

    fn instantiate(&self, sample_rate: u32) -> Result<Box<dyn PluginInstance>, PluginError>;
}

/// Every plugin the process can host, plus the last sample rate seen.
pub struct PluginCatalog {
    plugins: Vec<Arc<dyn Plugin>>,
    sample_rate: AtomicU32,
}

impl PluginCatalog {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self {
            plugins,
            sample_rate: AtomicU32::new(0),
        }
    }

    /// Catalog of the plugins compiled into this crate.
    pub fn builtin() -> Self {
        Self::new(crate::builtin::plugins())
    }

    pub fn get(&self, unique_id: u64, label: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .iter()
            .find(|p| p.descriptor().unique_id == unique_id && p.descriptor().label == label)
            .cloned()
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    /// Record the rate a client connected at. Range hints that depend on it
    /// resolve against the new value from now on.
    pub fn set_sample_rate(&self, rate: u32) {
        let previous = self.sample_rate.swap(rate, Ordering::AcqRel);
        if previous != rate {
            info!("sample rate changed from {} to {}", previous, rate);
        }
    }

    /// Last rate seen, `0` until a client has connected.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    pub fn to_json(&self) -> Value {
        let rate = self.sample_rate();
        let plugins: Vec<Value> = self
            .plugins
            .iter()
            .map(|p| p.descriptor().to_json(rate))
            .collect();
        json!({ "sample_rate": rate, "plugins": plugins })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_needs_id_and_label() {
        let catalog = PluginCatalog::builtin();
        assert!(catalog.get(1001, "amp").is_some());
        assert!(catalog.get(1001, "delay").is_none());
        assert!(catalog.get(9999, "amp").is_none());
    }

    #[test]
    fn test_sample_rate_relative_bounds() {
        let hint = RangeHint {
            lower: Some(0.0),
            upper: Some(0.5),
            default: Some(0.25),
            sample_rate: true,
            ..Default::default()
        };
        assert_eq!(hint.bounds(48_000), (Some(0.0), Some(24_000.0)));
        assert_eq!(hint.default_value(48_000), Some(12_000.0));
        assert_eq!(RangeHint::bounded(-1.0, 1.0, 0.0).bounds(48_000), (Some(-1.0), Some(1.0)));
    }

    #[test]
    fn test_catalog_json_lists_ports() {
        let catalog = PluginCatalog::builtin();
        catalog.set_sample_rate(44_100);
        let json = catalog.to_json();
        assert_eq!(json["sample_rate"], 44_100);
        let amp = json["plugins"]
            .as_array()
            .unwrap()
            .iter()
            .find(|p| p["label"] == "amp")
            .unwrap();
        assert_eq!(amp["ports"][0]["kind"], "audio");
        assert_eq!(amp["ports"][2]["range"]["upper"], 24.0);
    }

    #[test]
    fn test_audio_io_either_order() {
        let mut audio = vec![vec![1.0, 2.0], vec![0.0, 0.0], vec![]];
        let mut buffers = RunBuffers {
            frames: 2,
            controls: &[],
            audio: &mut audio,
        };
        let (input, output) = buffers.audio_io(0, 1);
        output.copy_from_slice(input);
        let (input, output) = buffers.audio_io(1, 0);
        assert_eq!(input.to_vec(), vec![1.0, 2.0]);
        assert_eq!(output.to_vec(), vec![1.0, 2.0]);
    }
}
