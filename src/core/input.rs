//! Input state tracking

use std::collections::HashSet;
use winit::event::{ElementState, KeyEvent, MouseButton, WindowEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

/// Tracks held keys, held mouse buttons and raw mouse motion
#[derive(Default)]
pub struct InputState {
    keys_pressed: HashSet<KeyCode>,
    mouse_buttons: HashSet<MouseButton>,
    /// Raw motion accumulated since the last `end_frame`
    mouse_delta: (f32, f32),
}

impl InputState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a window event
    pub fn process_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::KeyboardInput {
                event: KeyEvent {
                    physical_key: PhysicalKey::Code(key_code),
                    state,
                    ..
                },
                ..
            } => match state {
                ElementState::Pressed => {
                    self.keys_pressed.insert(*key_code);
                }
                ElementState::Released => {
                    self.keys_pressed.remove(key_code);
                }
            },
            WindowEvent::MouseInput { state, button, .. } => match state {
                ElementState::Pressed => {
                    self.mouse_buttons.insert(*button);
                }
                ElementState::Released => {
                    self.mouse_buttons.remove(button);
                }
            },
            WindowEvent::Focused(false) => {
                self.keys_pressed.clear();
                self.mouse_buttons.clear();
            }
            _ => {}
        }
    }

    /// Process raw device motion
    pub fn process_mouse_motion(&mut self, delta: (f64, f64)) {
        self.mouse_delta.0 += delta.0 as f32;
        self.mouse_delta.1 += delta.1 as f32;
    }

    /// Reset per-frame state
    pub fn end_frame(&mut self) {
        self.mouse_delta = (0.0, 0.0);
    }

    pub fn is_key_pressed(&self, key: KeyCode) -> bool {
        self.keys_pressed.contains(&key)
    }

    pub fn is_mouse_button_pressed(&self, button: MouseButton) -> bool {
        self.mouse_buttons.contains(&button)
    }

    /// Mouse motion since the last frame
    pub fn mouse_delta(&self) -> (f32, f32) {
        self.mouse_delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mouse_delta_resets_each_frame() {
        let mut input = InputState::new();
        input.process_mouse_motion((3.0, -2.0));
        input.process_mouse_motion((1.0, 0.5));
        assert_eq!(input.mouse_delta(), (4.0, -1.5));

        input.end_frame();
        assert_eq!(input.mouse_delta(), (0.0, 0.0));
    }

    #[test]
    fn test_key_state() {
        let mut input = InputState::new();
        assert!(!input.is_key_pressed(KeyCode::KeyW));

        input.keys_pressed.insert(KeyCode::KeyW);
        input.end_frame();
        assert!(input.is_key_pressed(KeyCode::KeyW));

        input.process_event(&WindowEvent::Focused(false));
        assert!(!input.is_key_pressed(KeyCode::KeyW));
    }
}
