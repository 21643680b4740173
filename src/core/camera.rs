//! Perspective camera

use glam::{Mat4, Quat, Vec3};

/// Default vertical field of view: a fifth of a full turn
pub const DEFAULT_FOV_Y: f32 = std::f32::consts::TAU / 5.0;

/// Camera with position, yaw/pitch orientation and projection parameters
#[derive(Debug, Clone)]
pub struct Camera {
    /// World position
    pub position: Vec3,
    /// Rotation around +Y in radians
    pub yaw: f32,
    /// Rotation around the camera's right axis in radians
    pub pitch: f32,
    /// Vertical field of view in radians
    pub fov_y: f32,
    /// Aspect ratio (width / height)
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera {
    /// Create a new camera looking down -Z
    pub fn new(position: Vec3, aspect: f32) -> Self {
        Self {
            position,
            yaw: 0.0,
            pitch: 0.0,
            fov_y: DEFAULT_FOV_Y,
            aspect,
            near: 0.01,
            far: 300.0,
        }
    }

    /// Orientation as a quaternion
    pub fn rotation(&self) -> Quat {
        Quat::from_euler(glam::EulerRot::YXZ, self.yaw, self.pitch, 0.0)
    }

    /// Get view matrix (world to camera space)
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::from_quat(self.rotation().conjugate()) * Mat4::from_translation(-self.position)
    }

    /// Get projection matrix (camera to clip space)
    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }

    /// Get combined view-projection matrix
    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    pub fn forward(&self) -> Vec3 {
        self.rotation() * -Vec3::Z
    }

    pub fn right(&self) -> Vec3 {
        self.rotation() * Vec3::X
    }

    /// Point the camera at `target`
    pub fn look_at(&mut self, target: Vec3) {
        let dir = (target - self.position).normalize_or_zero();
        if dir == Vec3::ZERO {
            return;
        }
        self.yaw = (-dir.x).atan2(-dir.z);
        self.pitch = dir.y.clamp(-1.0, 1.0).asin();
    }

    /// Update aspect ratio (call on window resize)
    pub fn set_aspect(&mut self, width: f32, height: f32) {
        if height > 0.0 {
            self.aspect = width / height;
        }
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Vec3::new(0.0, 20.0, 0.0), 640.0 / 480.0)
    }
}
