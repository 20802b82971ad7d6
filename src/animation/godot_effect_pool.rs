use bevy::math::{EulerRot, Quat, Vec3};
use dashmap::DashMap;
use godot::classes::{AnimatedSprite2D, CpuParticles2D, GpuParticles2D, INode, Node, Node2D, PackedScene};
use godot::prelude::*;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use ulid::Ulid;

use super::config::EffectPoolConfig;
use super::effect_pool::{EffectHost, EffectPoolManager, PoolEvent};
use super::template::{EffectTemplate, SubEmitter, TemplateId, TimingCurve};

type SharedContainer = Arc<RwLock<Option<Gd<Node2D>>>>;

/// Sub-emitter timing for a Godot particle node.
///
/// A cycle emits for `lifetime` and its last particle lives another
/// `lifetime`; explosiveness pulls the last emission towards the start.
fn particle_sub_emitter(lifetime: f64, speed_scale: f64, explosiveness: f64) -> Option<SubEmitter> {
    if lifetime <= 0.0 || speed_scale <= 0.0 {
        return None;
    }
    let duration = (lifetime / speed_scale) as f32;
    let last_emission = duration * (1.0 - explosiveness.clamp(0.0, 1.0) as f32);
    Some(SubEmitter::new(duration, TimingCurve::Constant { value: last_emission }))
}

/// Frame delta as a `Duration`; negative or non-finite deltas advance nothing
fn frame_delta(delta: f64) -> Duration {
    Duration::try_from_secs_f64(delta).unwrap_or_default()
}

/// Visit `root` and every node below it
fn visit_tree(root: &Gd<Node>, visit: &mut dyn FnMut(&Gd<Node>)) {
    visit(root);
    for child in root.get_children().iter_shared() {
        visit_tree(&child, visit);
    }
}

/// Realizes effect templates as `Node2D` scenes in the Godot tree.
pub struct GodotEffectHost {
    /// Where active effects live
    scene_container: SharedContainer,

    /// Hidden node retired effects are parked under
    holding_area: SharedContainer,

    /// Scene path -> loaded PackedScene
    scenes: DashMap<String, Gd<PackedScene>>,
}

impl GodotEffectHost {
    pub fn new(scene_container: SharedContainer, holding_area: SharedContainer) -> Self {
        Self {
            scene_container,
            holding_area,
            scenes: DashMap::new(),
        }
    }

    fn load_scene(&self, path: &str) -> Option<Gd<PackedScene>> {
        if let Some(scene) = self.scenes.get(path) {
            return Some(scene.value().clone());
        }
        match try_load::<PackedScene>(path) {
            Ok(scene) => {
                self.scenes.insert(path.to_string(), scene.clone());
                Some(scene)
            }
            Err(err) => {
                godot_error!("[EFFECT POOL] Failed to load scene: {} - {:?}", path, err);
                None
            }
        }
    }

    /// Derive sub-emitters from the particle nodes in a scene
    fn probe_sub_emitters(&self, path: &str) -> Vec<SubEmitter> {
        let Some(scene) = self.load_scene(path) else {
            return Vec::new();
        };
        let Some(probe) = scene.try_instantiate_as::<Node>() else {
            godot_error!("[EFFECT POOL] Failed to instantiate scene for probing: {}", path);
            return Vec::new();
        };

        let mut emitters = Vec::new();
        visit_tree(&probe, &mut |node| {
            if let Ok(particles) = node.clone().try_cast::<GpuParticles2D>() {
                emitters.extend(particle_sub_emitter(
                    f64::from(particles.get_lifetime()),
                    f64::from(particles.get_speed_scale()),
                    f64::from(particles.get_explosiveness_ratio()),
                ));
            } else if let Ok(particles) = node.clone().try_cast::<CpuParticles2D>() {
                emitters.extend(particle_sub_emitter(
                    f64::from(particles.get_lifetime()),
                    f64::from(particles.get_speed_scale()),
                    f64::from(particles.get_explosiveness_ratio()),
                ));
            }
        });
        probe.free();
        emitters
    }

    /// Move `node` under `container` unless it is already there
    fn attach(node: &mut Gd<Node2D>, container: &mut Gd<Node2D>) {
        if let Some(mut parent) = node.get_parent() {
            if parent.instance_id() == container.instance_id() {
                return;
            }
            parent.remove_child(&*node);
        }
        container.add_child(&*node);
    }
}

impl EffectHost for GodotEffectHost {
    type Node = Gd<Node2D>;

    fn instantiate(&self, template: &EffectTemplate) -> Option<Gd<Node2D>> {
        let scene = self.load_scene(template.source())?;
        let mut node = match scene.try_instantiate_as::<Node2D>() {
            Some(node) => node,
            None => {
                godot_error!("[EFFECT POOL] Failed to instantiate scene as Node2D: {}", template.source());
                return None;
            }
        };
        node.set_visible(false);
        node.set_z_index(50); // Render between NPCs and healthbars
        Some(node)
    }

    fn place(&self, node: &mut Gd<Node2D>, position: Vec3, orientation: Quat) {
        {
            let mut container_guard = self.scene_container.write();
            match container_guard.as_mut() {
                Some(container) => Self::attach(node, container),
                None => godot_error!("[EFFECT POOL] Cannot place effect - scene container not set!"),
            }
        }
        let (_, _, angle) = orientation.to_euler(EulerRot::XYZ);
        node.set_global_position(Vector2::new(position.x, position.y));
        node.set_rotation(angle);
    }

    fn reset_playback(&self, node: &mut Gd<Node2D>) {
        visit_tree(&node.clone().upcast::<Node>(), &mut |child| {
            if let Ok(mut particles) = child.clone().try_cast::<GpuParticles2D>() {
                particles.restart();
                particles.set_emitting(true);
            } else if let Ok(mut particles) = child.clone().try_cast::<CpuParticles2D>() {
                particles.restart();
                particles.set_emitting(true);
            } else if let Ok(mut sprite) = child.clone().try_cast::<AnimatedSprite2D>() {
                sprite.set_frame(0);
                sprite.play();
            }
        });
    }

    fn set_active(&self, node: &mut Gd<Node2D>, active: bool) {
        node.set_visible(active);
        if !active {
            visit_tree(&node.clone().upcast::<Node>(), &mut |child| {
                if let Ok(mut particles) = child.clone().try_cast::<GpuParticles2D>() {
                    particles.set_emitting(false);
                } else if let Ok(mut particles) = child.clone().try_cast::<CpuParticles2D>() {
                    particles.set_emitting(false);
                } else if let Ok(mut sprite) = child.clone().try_cast::<AnimatedSprite2D>() {
                    sprite.stop();
                }
            });
        }
    }

    fn park(&self, node: &mut Gd<Node2D>) {
        let mut holding_guard = self.holding_area.write();
        match holding_guard.as_mut() {
            Some(holding) => Self::attach(node, holding),
            None => {
                // No holding area: detach so the effect stops being processed
                if let Some(mut parent) = node.get_parent() {
                    parent.remove_child(&*node);
                }
            }
        }
    }

    fn destroy(&self, node: Gd<Node2D>) {
        if node.is_instance_valid() {
            let mut node = node;
            if node.is_inside_tree() {
                node.queue_free();
            } else {
                node.free();
            }
        }
    }
}

/// Godot node exposing the effect pool to GDScript.
///
/// Usage in GDScript:
/// ```gdscript
/// var pool = $EffectPool
/// pool.set_scene_container($Layer4Objects)
/// var burst = pool.register_effect("burst", "res://fx/burst.tscn", "")
/// var instance = pool.spawn_effect(burst, global_position, 0.0)
/// ```
/// Effects return to the pool automatically; `return_effect` retires one early.
/// Leaving the tree only pauses ticking. The pool is torn down when the node
/// is freed.
#[derive(GodotClass)]
#[class(base=Node)]
pub struct GodotEffectPool {
    manager: EffectPoolManager<GodotEffectHost>,
    scene_container: SharedContainer,
    holding_area: SharedContainer,
    base: Base<Node>,
}

#[godot_api]
impl INode for GodotEffectPool {
    fn init(base: Base<Node>) -> Self {
        let scene_container: SharedContainer = Arc::new(RwLock::new(None));
        let holding_area: SharedContainer = Arc::new(RwLock::new(None));
        let host = GodotEffectHost::new(scene_container.clone(), holding_area.clone());
        godot_print!("[EFFECT POOL] Initializing");
        Self {
            manager: EffectPoolManager::with_default_config(host),
            scene_container,
            holding_area,
            base,
        }
    }

    fn ready(&mut self) {
        if self.holding_area.read().is_some() {
            // Re-entering the tree keeps the existing pool and holding area
            return;
        }
        let name = self.manager.config().holding_area_name.clone();
        let mut holding = Node2D::new_alloc();
        holding.set_name(&StringName::from(name.as_str()));
        holding.set_visible(false);
        self.base_mut().add_child(&holding);
        *self.holding_area.write() = Some(holding);
        godot_print!("[EFFECT POOL] Ready, holding area '{}'", name);
    }

    fn process(&mut self, delta: f64) {
        self.manager.tick(frame_delta(delta));

        for event in self.manager.drain_events() {
            match event {
                PoolEvent::Spawned { handle, .. } => {
                    let args = [
                        (handle.template.raw() as i64).to_variant(),
                        GString::from(handle.instance.to_string().as_str()).to_variant(),
                    ];
                    self.base_mut().emit_signal("effect_spawned", &args);
                }
                PoolEvent::Returned { handle, expired } => {
                    let args = [
                        (handle.template.raw() as i64).to_variant(),
                        GString::from(handle.instance.to_string().as_str()).to_variant(),
                        expired.to_variant(),
                    ];
                    self.base_mut().emit_signal("effect_returned", &args);
                }
            }
        }
    }
}

#[godot_api]
impl GodotEffectPool {
    /// Emitted when an effect is activated
    /// Parameters: (template_id: int, instance: String)
    #[signal]
    fn effect_spawned(template_id: i64, instance: GString);

    /// Emitted when an effect goes back to the pool
    /// Parameters: (template_id: int, instance: String, expired: bool)
    #[signal]
    fn effect_returned(template_id: i64, instance: GString, expired: bool);

    /// Set the container active effects are added to
    #[func]
    pub fn set_scene_container(&self, container: Gd<Node2D>) {
        godot_print!("[EFFECT POOL] Setting scene container");
        *self.scene_container.write() = Some(container);
    }

    /// Apply a JSON config (see EffectPoolConfig); returns false if rejected
    #[func]
    pub fn configure(&self, config_json: GString) -> bool {
        let result = EffectPoolConfig::from_json(&config_json.to_string())
            .and_then(|config| self.manager.reload_config(config));
        match result {
            Ok(()) => true,
            Err(err) => {
                godot_error!("[EFFECT POOL] {}", err);
                false
            }
        }
    }

    /// Register an effect scene. `emitters_json` is a JSON array of
    /// sub-emitters; when empty, timings are read from the scene's particles.
    /// Returns the template id, or -1 on failure.
    #[func]
    pub fn register_effect(&self, name: GString, scene_path: GString, emitters_json: GString) -> i64 {
        let path = scene_path.to_string();
        let emitters_json = emitters_json.to_string();

        let sub_emitters = if emitters_json.trim().is_empty() {
            self.manager.host().probe_sub_emitters(&path)
        } else {
            match serde_json::from_str::<Vec<SubEmitter>>(&emitters_json) {
                Ok(emitters) => emitters,
                Err(err) => {
                    godot_error!("[EFFECT POOL] Invalid emitters for {}: {}", name, err);
                    return -1;
                }
            }
        };

        let emitter_count = sub_emitters.len();
        let template = EffectTemplate::new(name.to_string(), path.clone(), sub_emitters);
        let id = self.manager.register_template(template);
        let lifetime_ms = self
            .manager
            .estimated_lifetime(id)
            .map(|lifetime| lifetime.as_millis())
            .unwrap_or_default();
        godot_print!(
            "[EFFECT POOL] Registered '{}' ({}): {} emitters, lifetime={}ms",
            name, path, emitter_count, lifetime_ms
        );
        id.raw() as i64
    }

    /// Spawn an effect; returns the instance id, or an empty string on failure
    #[func]
    pub fn spawn_effect(&self, template_id: i64, position: Vector2, rotation: f32) -> GString {
        let template = TemplateId::from_raw(template_id as u64);
        let orientation = Quat::from_rotation_z(rotation);
        match self.manager.spawn(template, Vec3::new(position.x, position.y, 0.0), orientation) {
            Ok(handle) => GString::from(handle.instance.to_string().as_str()),
            Err(err) => {
                godot_warn!("[EFFECT POOL] Spawn failed: {}", err);
                GString::new()
            }
        }
    }

    /// Retire an effect before its lifetime elapses
    #[func]
    pub fn return_effect(&self, template_id: i64, instance_id: GString) -> bool {
        match Ulid::from_string(&instance_id.to_string()) {
            Ok(instance) => self
                .manager
                .return_effect(TemplateId::from_raw(template_id as u64), instance),
            Err(_) => false,
        }
    }

    #[func]
    pub fn active_count(&self) -> i64 {
        self.manager.active_count() as i64
    }

    #[func]
    pub fn retired_count(&self, template_id: i64) -> i64 {
        self.manager.retired_count(TemplateId::from_raw(template_id as u64)) as i64
    }

    #[func]
    pub fn created_count(&self) -> i64 {
        self.manager.created_count() as i64
    }

    #[func]
    pub fn pending_returns(&self) -> i64 {
        self.manager.pending_returns() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_particle_sub_emitter_timing() {
        let emitter = particle_sub_emitter(2.0, 2.0, 0.0).unwrap();
        assert_eq!(emitter.duration, 1.0);
        assert_eq!(emitter.timing, TimingCurve::Constant { value: 1.0 });

        let burst = particle_sub_emitter(1.0, 1.0, 1.0).unwrap();
        assert_eq!(burst.timing, TimingCurve::Constant { value: 0.0 });
    }

    #[test]
    fn test_frame_delta_rejects_bad_values() {
        assert_eq!(frame_delta(0.5), Duration::from_millis(500));
        assert_eq!(frame_delta(-1.0), Duration::ZERO);
        assert_eq!(frame_delta(f64::INFINITY), Duration::ZERO);
        assert_eq!(frame_delta(f64::NAN), Duration::ZERO);
    }

    #[test]
    fn test_particle_sub_emitter_rejects_degenerate_nodes() {
        assert!(particle_sub_emitter(0.0, 1.0, 0.0).is_none());
        assert!(particle_sub_emitter(1.0, 0.0, 0.0).is_none());
    }
}
