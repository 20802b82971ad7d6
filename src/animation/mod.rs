/// Animation and visual effects management module
///
/// This module pools short-lived visual effects (pickup bursts, hit sparks,
/// death puffs) keyed by template, infers how long each one plays from its
/// emitter timings, and hands instances back to the pool when they finish.

pub mod config;
pub mod effect_pool;
pub mod error;
pub mod godot_effect_pool;
pub mod lifetime;
pub mod registry;
pub mod scheduler;
pub mod template;

pub use config::EffectPoolConfig;
pub use effect_pool::{ActivationState, EffectHandle, EffectHost, EffectPoolManager, PoolEvent, PooledEffect};
pub use error::{EffectPoolError, Result};
pub use godot_effect_pool::{GodotEffectHost, GodotEffectPool};
pub use lifetime::estimate_lifetime;
pub use registry::{PoolRegistry, Pooled};
pub use scheduler::{ReturnScheduler, ReturnTicket};
pub use template::{Curve, EffectTemplate, SubEmitter, TemplateId, TimedEmitters, TimingCurve};
