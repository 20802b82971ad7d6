use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::error::Result;

static NEXT_TEMPLATE_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of an effect template.
///
/// Identity based: two templates with identical data still get distinct ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateId(u64);

impl TemplateId {
    fn next() -> Self {
        Self(NEXT_TEMPLATE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Rebuild an id previously handed across FFI
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tpl#{}", self.0)
    }
}

/// Piecewise-linear curve over normalized time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<(f32, f32)>", into = "Vec<(f32, f32)>")]
pub struct Curve {
    /// (time, value) pairs, kept sorted by time
    keys: Vec<(f32, f32)>,
}

impl Curve {
    pub fn new(mut keys: Vec<(f32, f32)>) -> Self {
        keys.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { keys }
    }

    /// Constant curve holding `value` everywhere
    pub fn flat(value: f32) -> Self {
        Self::new(vec![(0.0, value), (1.0, value)])
    }

    /// Value at `t`, clamped to the first/last key outside the key range.
    /// An empty curve evaluates to 0.
    pub fn evaluate(&self, t: f32) -> f32 {
        let (first, last) = match (self.keys.first(), self.keys.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return 0.0,
        };
        if t <= first.0 {
            return first.1;
        }
        if t >= last.0 {
            return last.1;
        }

        for pair in self.keys.windows(2) {
            let (t0, v0) = pair[0];
            let (t1, v1) = pair[1];
            if t <= t1 {
                let span = t1 - t0;
                if span <= f32::EPSILON {
                    return v1;
                }
                return v0 + (v1 - v0) * ((t - t0) / span);
            }
        }
        last.1
    }
}

impl From<Vec<(f32, f32)>> for Curve {
    fn from(keys: Vec<(f32, f32)>) -> Self {
        Self::new(keys)
    }
}

impl From<Curve> for Vec<(f32, f32)> {
    fn from(curve: Curve) -> Self {
        curve.keys
    }
}

/// How a sub-emitter's start delay / peak timing value is authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TimingCurve {
    Constant { value: f32 },
    TwoConstants { min: f32, max: f32 },
    Curve { curve: Curve, multiplier: f32 },
    TwoCurves { min: Curve, max: Curve, multiplier: f32 },
}

impl TimingCurve {
    /// Upper bound of the timing value, in seconds
    pub fn peak(&self) -> f32 {
        match self {
            TimingCurve::Constant { value } => *value,
            TimingCurve::TwoConstants { max, .. } => *max,
            TimingCurve::Curve { curve, multiplier } => curve.evaluate(1.0) * multiplier,
            TimingCurve::TwoCurves { max, multiplier, .. } => max.evaluate(1.0) * multiplier,
        }
    }
}

impl Default for TimingCurve {
    fn default() -> Self {
        TimingCurve::Constant { value: 0.0 }
    }
}

/// One timed emitter inside an effect template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubEmitter {
    /// Playback duration in seconds
    pub duration: f32,
    #[serde(default)]
    pub timing: TimingCurve,
}

impl SubEmitter {
    pub fn new(duration: f32, timing: TimingCurve) -> Self {
        Self { duration, timing }
    }

    /// Sub-emitter with a constant-mode timing value
    pub fn constant(duration: f32, value: f32) -> Self {
        Self::new(duration, TimingCurve::Constant { value })
    }
}

/// Anything that can list its timed sub-emitters.
pub trait TimedEmitters {
    fn timed_sub_emitters(&self) -> &[SubEmitter];
}

/// Authoring-side shape of a template, as read from JSON.
#[derive(Debug, Clone, Deserialize)]
struct TemplateDefinition {
    name: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    sub_emitters: Vec<SubEmitter>,
}

/// Static definition of an effect: what to instantiate and how it is timed.
#[derive(Debug)]
pub struct EffectTemplate {
    id: TemplateId,
    name: String,
    /// Host-specific resource locator (e.g. a scene path)
    source: String,
    sub_emitters: Vec<SubEmitter>,
}

impl EffectTemplate {
    pub fn new<N: Into<String>, S: Into<String>>(
        name: N,
        source: S,
        sub_emitters: Vec<SubEmitter>,
    ) -> Self {
        Self {
            id: TemplateId::next(),
            name: name.into(),
            source: source.into(),
            sub_emitters,
        }
    }

    /// Parse `{"name": .., "source": .., "sub_emitters": [..]}`
    pub fn from_json(json: &str) -> Result<Self> {
        let def: TemplateDefinition = serde_json::from_str(json)?;
        Ok(Self::new(def.name, def.source, def.sub_emitters))
    }

    pub fn id(&self) -> TemplateId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl TimedEmitters for EffectTemplate {
    fn timed_sub_emitters(&self) -> &[SubEmitter] {
        &self.sub_emitters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_templates_get_distinct_ids() {
        let a = EffectTemplate::new("spark", "res://fx/spark.tscn", vec![SubEmitter::constant(1.0, 0.0)]);
        let b = EffectTemplate::new("spark", "res://fx/spark.tscn", vec![SubEmitter::constant(1.0, 0.0)]);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_curve_evaluation() {
        let curve = Curve::new(vec![(1.0, 4.0), (0.0, 0.0), (0.5, 1.0)]);
        assert_eq!(curve.evaluate(-1.0), 0.0);
        assert!((curve.evaluate(0.25) - 0.5).abs() < 1e-6);
        assert!((curve.evaluate(0.75) - 2.5).abs() < 1e-6);
        assert_eq!(curve.evaluate(1.0), 4.0);
        assert_eq!(curve.evaluate(3.0), 4.0);
        assert_eq!(Curve::default().evaluate(1.0), 0.0);
    }

    #[test]
    fn test_timing_peaks() {
        assert_eq!(TimingCurve::Constant { value: 0.3 }.peak(), 0.3);
        assert_eq!(TimingCurve::TwoConstants { min: 0.1, max: 0.9 }.peak(), 0.9);

        let ramp = Curve::new(vec![(0.0, 0.0), (1.0, 0.5)]);
        let scaled = TimingCurve::Curve { curve: ramp.clone(), multiplier: 2.0 };
        assert!((scaled.peak() - 1.0).abs() < 1e-6);

        let ranged = TimingCurve::TwoCurves {
            min: Curve::flat(5.0),
            max: ramp,
            multiplier: 4.0,
        };
        assert!((ranged.peak() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_template_from_json() {
        let json = r#"{
            "name": "pickup_burst",
            "source": "res://fx/pickup_burst.tscn",
            "sub_emitters": [
                {"duration": 0.5, "timing": {"mode": "two_constants", "min": 0.0, "max": 0.2}},
                {"duration": 1.0}
            ]
        }"#;
        let template = EffectTemplate::from_json(json).unwrap();
        assert_eq!(template.name(), "pickup_burst");
        assert_eq!(template.timed_sub_emitters().len(), 2);
        assert_eq!(template.timed_sub_emitters()[1].timing, TimingCurve::default());
    }

    #[test]
    fn test_curve_keys_from_json_are_sorted() {
        let json = r#"{
            "name": "trail",
            "sub_emitters": [
                {"duration": 0.0, "timing": {"mode": "curve", "curve": [[0.0, 0.0], [1.0, 5.0], [0.5, 2.0]], "multiplier": 1.0}}
            ]
        }"#;
        let template = EffectTemplate::from_json(json).unwrap();
        let timing = &template.timed_sub_emitters()[0].timing;
        assert_eq!(timing.peak(), 5.0);
        assert_eq!(
            *timing,
            TimingCurve::Curve { curve: Curve::new(vec![(0.0, 0.0), (0.5, 2.0), (1.0, 5.0)]), multiplier: 1.0 }
        );
    }

    #[test]
    fn test_template_from_bad_json() {
        assert!(EffectTemplate::from_json("{\"source\": 3}").is_err());
    }
}
