use godot::prelude::*;

pub mod animation;

struct GodoFx;

#[gdextension]
unsafe impl ExtensionLibrary for GodoFx {
    fn on_level_init(level: InitLevel) {
        if level == InitLevel::Scene {
            godot_print!("GodoFx v0.1.0 - Effect pool GDExtension loaded successfully!");
        }
    }
}
