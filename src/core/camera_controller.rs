//! Fly camera controller with smoothed motion

use glam::Vec3;
use winit::event::MouseButton;
use winit::keyboard::KeyCode;

use crate::core::camera::Camera;
use crate::core::input::InputState;

/// Fraction of the remaining gap to the target velocity closed per update
const SMOOTHING: f32 = 0.2;
const PITCH_LIMIT: f32 = 1.5;

/// WASD + Space/Shift movement, mouse look while the right button is held
pub struct FlyCameraController {
    /// Movement speed in units per second
    pub speed: f32,
    /// Radians per pixel of mouse motion
    pub sensitivity: f32,
    velocity: Vec3,
    angular_velocity: (f32, f32),
}

impl FlyCameraController {
    pub fn new(speed: f32, sensitivity: f32) -> Self {
        Self {
            speed,
            sensitivity,
            velocity: Vec3::ZERO,
            angular_velocity: (0.0, 0.0),
        }
    }

    /// Update camera based on input
    pub fn update(&mut self, camera: &mut Camera, input: &InputState, dt: f32) {
        let target_angular = if input.is_mouse_button_pressed(MouseButton::Right) {
            let (dx, dy) = input.mouse_delta();
            (-dx * self.sensitivity, -dy * self.sensitivity)
        } else {
            (0.0, 0.0)
        };
        self.angular_velocity.0 += (target_angular.0 - self.angular_velocity.0) * SMOOTHING;
        self.angular_velocity.1 += (target_angular.1 - self.angular_velocity.1) * SMOOTHING;
        camera.yaw += self.angular_velocity.0;
        camera.pitch = (camera.pitch + self.angular_velocity.1).clamp(-PITCH_LIMIT, PITCH_LIMIT);

        let mut direction = Vec3::ZERO;
        if input.is_key_pressed(KeyCode::KeyW) {
            direction += camera.forward();
        }
        if input.is_key_pressed(KeyCode::KeyS) {
            direction -= camera.forward();
        }
        if input.is_key_pressed(KeyCode::KeyD) {
            direction += camera.right();
        }
        if input.is_key_pressed(KeyCode::KeyA) {
            direction -= camera.right();
        }
        if input.is_key_pressed(KeyCode::Space) {
            direction += Vec3::Y;
        }
        if input.is_key_pressed(KeyCode::ShiftLeft) {
            direction -= Vec3::Y;
        }

        let target_velocity = direction.normalize_or_zero() * self.speed;
        self.velocity = self.velocity.lerp(target_velocity, SMOOTHING);
        camera.position += self.velocity * dt;
    }

    /// Current smoothed velocity
    pub fn velocity(&self) -> Vec3 {
        self.velocity
    }
}

impl Default for FlyCameraController {
    fn default() -> Self {
        Self::new(10.0, 0.003)
    }
}
