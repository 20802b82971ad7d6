use arc_swap::ArcSwap;
use bevy::math::{Quat, Vec3};
use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use ulid::Ulid;

use super::config::EffectPoolConfig;
use super::error::{EffectPoolError, Result};
use super::lifetime::estimate_lifetime;
use super::registry::{PoolRegistry, Pooled};
use super::scheduler::ReturnScheduler;
use super::template::{EffectTemplate, TemplateId};

/// Engine side of the pool: realizes templates and drives instance visuals.
///
/// The manager calls these but never implements them.
pub trait EffectHost {
    type Node;

    /// Create a fresh instance of `template`, or None if it cannot be realized
    fn instantiate(&self, template: &EffectTemplate) -> Option<Self::Node>;

    /// Move an instance into the world at the given transform
    fn place(&self, node: &mut Self::Node, position: Vec3, orientation: Quat);

    /// Rewind visual playback to its beginning
    fn reset_playback(&self, node: &mut Self::Node);

    fn set_active(&self, node: &mut Self::Node, active: bool);

    /// Move a retired instance into the pool's holding area
    fn park(&self, node: &mut Self::Node);

    /// Tear down an instance for good (pool teardown only)
    fn destroy(&self, node: Self::Node);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    Active,
    Retired,
}

/// A positioned, reusable realization of a template.
#[derive(Debug)]
pub struct PooledEffect<N> {
    id: Ulid,
    template: TemplateId,
    node: N,
    state: ActivationState,
    position: Vec3,
    orientation: Quat,
    activations: u32,
}

impl<N> PooledEffect<N> {
    fn new(template: TemplateId, node: N) -> Self {
        Self {
            id: Ulid::new(),
            template,
            node,
            state: ActivationState::Retired,
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            activations: 0,
        }
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn template(&self) -> TemplateId {
        self.template
    }

    pub fn state(&self) -> ActivationState {
        self.state
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn orientation(&self) -> Quat {
        self.orientation
    }

    /// How many times this instance has been spawned
    pub fn activations(&self) -> u32 {
        self.activations
    }
}

impl<N> Pooled for PooledEffect<N> {
    fn pool_id(&self) -> Ulid {
        self.id
    }
}

/// What a spawn hands back to the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EffectHandle {
    pub template: TemplateId,
    pub instance: Ulid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    Spawned { handle: EffectHandle, reused: bool },
    /// `expired` is true when the return timer fired, false for an external return
    Returned { handle: EffectHandle, expired: bool },
}

/// Keyed pool of short-lived effects with automatic return.
///
/// Spawn activates a retired instance (or creates one), arms a return timer
/// for the template's estimated lifetime, and `tick` hands the instance back
/// to the registry once that lifetime has elapsed. Callers never do any
/// bookkeeping beyond calling `tick` once per frame.
pub struct EffectPoolManager<H: EffectHost> {
    host: H,

    /// Swappable at runtime via `reload_config`
    config: ArcSwap<EffectPoolConfig>,

    templates: DashMap<TemplateId, Arc<EffectTemplate>>,

    /// Retired instances per template
    registry: PoolRegistry<PooledEffect<H::Node>>,

    /// Active instances (instance id -> effect)
    active: DashMap<Ulid, PooledEffect<H::Node>>,

    scheduler: ReturnScheduler,

    events: SegQueue<PoolEvent>,

    /// Logical time in microseconds, advanced by `tick`
    clock_us: AtomicU64,

    /// Instances ever cold-created
    created: AtomicUsize,

    shut_down: AtomicBool,
}

impl<H: EffectHost> EffectPoolManager<H> {
    pub fn new(host: H, config: EffectPoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(host, config))
    }

    pub fn with_default_config(host: H) -> Self {
        Self::build(host, EffectPoolConfig::default())
    }

    fn build(host: H, config: EffectPoolConfig) -> Self {
        Self {
            host,
            config: ArcSwap::from_pointee(config),
            templates: DashMap::new(),
            registry: PoolRegistry::new(),
            active: DashMap::new(),
            scheduler: ReturnScheduler::new(),
            events: SegQueue::new(),
            clock_us: AtomicU64::new(0),
            created: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn config(&self) -> Arc<EffectPoolConfig> {
        self.config.load_full()
    }

    /// Swap in a new config; an invalid one is rejected and the old one kept
    pub fn reload_config(&self, config: EffectPoolConfig) -> Result<()> {
        config.validate()?;
        tracing::debug!(default_lifetime_ms = config.default_lifetime_ms, "effect pool config reloaded");
        self.config.store(Arc::new(config));
        Ok(())
    }

    /// Make a template spawnable
    pub fn register_template(&self, template: EffectTemplate) -> TemplateId {
        let id = template.id();
        tracing::debug!(template = %id, name = template.name(), "registered effect template");
        self.templates.insert(id, Arc::new(template));
        id
    }

    pub fn template(&self, template: TemplateId) -> Option<Arc<EffectTemplate>> {
        self.templates.get(&template).map(|entry| Arc::clone(entry.value()))
    }

    pub fn estimated_lifetime(&self, template: TemplateId) -> Option<Duration> {
        let default = self.config.load().default_lifetime();
        self.template(template)
            .map(|definition| estimate_lifetime(definition.as_ref(), default))
    }

    /// Activate an instance of `template` at the given transform.
    ///
    /// Reuses the most recently retired instance when one exists, otherwise
    /// asks the host for a new one. Either way playback is rewound and a
    /// return is scheduled for the template's estimated lifetime.
    pub fn spawn(&self, template: TemplateId, position: Vec3, orientation: Quat) -> Result<EffectHandle> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(EffectPoolError::ShutDown);
        }

        let definition = match self.template(template) {
            Some(definition) => definition,
            None => {
                tracing::warn!(%template, "spawn requested for unknown effect template");
                return Err(EffectPoolError::InvalidTemplate { template });
            }
        };

        let (mut effect, reused) = match self.registry.acquire(template) {
            Some(effect) => (effect, true),
            None => {
                let node = match self.host.instantiate(&definition) {
                    Some(node) => node,
                    None => {
                        tracing::warn!(%template, name = definition.name(), "host failed to instantiate effect");
                        return Err(EffectPoolError::InstantiationFailed {
                            template,
                            name: definition.name().to_string(),
                        });
                    }
                };
                self.created.fetch_add(1, Ordering::Relaxed);
                (PooledEffect::new(template, node), false)
            }
        };

        self.host.place(&mut effect.node, position, orientation);
        self.host.reset_playback(&mut effect.node);
        self.host.set_active(&mut effect.node, true);
        effect.state = ActivationState::Active;
        effect.position = position;
        effect.orientation = orientation;
        effect.activations += 1;

        let lifetime = estimate_lifetime(definition.as_ref(), self.config.load().default_lifetime());
        let deadline_us = self.now_us().saturating_add(duration_to_us(lifetime));
        let handle = EffectHandle {
            template,
            instance: effect.id,
        };

        tracing::debug!(
            %template,
            instance = %handle.instance,
            reused,
            activations = effect.activations,
            lifetime_ms = lifetime.as_millis() as u64,
            "spawned effect"
        );

        self.commit(handle, effect, deadline_us)?;
        self.record(PoolEvent::Spawned { handle, reused });

        Ok(handle)
    }

    /// Track an activated instance and arm its return timer.
    ///
    /// A shutdown that raced past the spawn's entry check cannot see the
    /// instance, so it is rolled back and destroyed here instead.
    fn commit(&self, handle: EffectHandle, effect: PooledEffect<H::Node>, deadline_us: u64) -> Result<()> {
        // Tracked as active before the timer exists so a tick can never
        // observe a timer without its instance.
        self.active.insert(handle.instance, effect);
        self.scheduler.arm(handle.instance, handle.template, deadline_us);

        if self.shut_down.load(Ordering::SeqCst) {
            self.scheduler.cancel(handle.instance);
            if let Some((_, effect)) = self.active.remove(&handle.instance) {
                self.host.destroy(effect.node);
            }
            tracing::debug!(instance = %handle.instance, "spawn rolled back by shutdown");
            return Err(EffectPoolError::ShutDown);
        }
        Ok(())
    }

    /// Retire an active instance early.
    ///
    /// Returns false (and does nothing) when the pair is not currently active.
    pub fn return_effect(&self, template: TemplateId, instance: Ulid) -> bool {
        match self.retire(template, instance, false) {
            Ok(()) => true,
            Err(err) => {
                tracing::trace!(%err, "ignoring return");
                false
            }
        }
    }

    /// Move an active instance; false if it is not active for that template
    pub fn reposition(&self, handle: EffectHandle, position: Vec3, orientation: Quat) -> bool {
        match self.active.get_mut(&handle.instance) {
            Some(mut effect) if effect.template == handle.template => {
                self.host.place(&mut effect.node, position, orientation);
                effect.position = position;
                effect.orientation = orientation;
                true
            }
            _ => false,
        }
    }

    /// Advance the clock by `delta` and return every instance whose lifetime
    /// has elapsed. Returns how many were retired.
    pub fn tick(&self, delta: Duration) -> usize {
        if self.shut_down.load(Ordering::Acquire) {
            return 0;
        }

        let step = duration_to_us(delta);
        let previous = self
            .clock_us
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |now| Some(now.saturating_add(step)))
            .unwrap_or_else(|now| now);
        let now = previous.saturating_add(step);

        let mut returned = 0;
        for ticket in self.scheduler.due(now) {
            if !self.scheduler.claim(&ticket) {
                continue;
            }
            if self.retire(ticket.template, ticket.instance, true).is_ok() {
                returned += 1;
            }
        }
        returned
    }

    /// Cancel every pending return and destroy all instances.
    ///
    /// Idempotent. After this, `tick` does nothing and `spawn` fails.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let cancelled = self.scheduler.cancel_all();

        let active_ids: Vec<Ulid> = self.active.iter().map(|entry| *entry.key()).collect();
        let mut destroyed = 0;
        for id in active_ids {
            if let Some((_, effect)) = self.active.remove(&id) {
                self.host.destroy(effect.node);
                destroyed += 1;
            }
        }
        for (_, effect) in self.registry.drain() {
            self.host.destroy(effect.node);
            destroyed += 1;
        }

        tracing::info!(cancelled, destroyed, "effect pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Take all recorded spawn/return events, oldest first
    pub fn drain_events(&self) -> Vec<PoolEvent> {
        let mut events = Vec::with_capacity(self.events.len());
        while let Some(event) = self.events.pop() {
            events.push(event);
        }
        events
    }

    /// Last transform given to an active instance
    pub fn transform(&self, instance: Ulid) -> Option<(Vec3, Quat)> {
        self.active
            .get(&instance)
            .map(|effect| (effect.position(), effect.orientation()))
    }

    pub fn is_active(&self, instance: Ulid) -> bool {
        self.active.contains_key(&instance)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn retired_count(&self, template: TemplateId) -> usize {
        self.registry.retired_count(template)
    }

    pub fn total_retired(&self) -> usize {
        self.registry.total_retired()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn pending_returns(&self) -> usize {
        self.scheduler.pending_count()
    }

    /// Current logical time
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.now_us())
    }

    fn retire(&self, template: TemplateId, instance: Ulid, expired: bool) -> Result<()> {
        let mut effect = self
            .active
            .remove_if(&instance, |_, effect| effect.template == template)
            .map(|(_, effect)| effect)
            .ok_or(EffectPoolError::StaleReturn { template, instance })?;

        self.scheduler.cancel(instance);

        self.host.set_active(&mut effect.node, false);
        self.host.park(&mut effect.node);
        effect.state = ActivationState::Retired;

        self.registry.release(template, effect);

        let handle = EffectHandle { template, instance };
        tracing::debug!(%template, %instance, expired, "returned effect to pool");
        self.record(PoolEvent::Returned { handle, expired });
        Ok(())
    }

    fn record(&self, event: PoolEvent) {
        if self.config.load().record_events {
            self.events.push(event);
        }
    }

    fn now_us(&self) -> u64 {
        self.clock_us.load(Ordering::Acquire)
    }
}

impl<H: EffectHost> Drop for EffectPoolManager<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn duration_to_us(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}
