use crate::uniforms::CameraBasis;
use glam::Vec3;
use std::collections::HashSet;
use winit::keyboard::KeyCode;

const PITCH_LIMIT: f32 = 89.0;

/// First-person camera. Keys move it while held; mouse deltas turn it.
pub struct Camera {
    pub position: Vec3,
    pub forward: Vec3,
    pub up: Vec3,
    pub right: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    /// World units per second.
    pub speed: f32,
    /// Degrees per mouse count.
    pub mouse_sensitivity: f32,
    held: HashSet<KeyCode>,
    turned: bool,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new()
    }
}

impl Camera {
    pub fn new() -> Self {
        let mut camera = Self {
            position: Vec3::new(0.0, 2.0, 10.0),
            forward: Vec3::NEG_Z,
            up: Vec3::Y,
            right: Vec3::X,
            yaw: -90.0,
            pitch: -8.0,
            speed: 3.0,
            mouse_sensitivity: 0.1,
            held: HashSet::new(),
            turned: false,
        };
        camera.update_vectors();
        camera
    }

    pub fn update_vectors(&mut self) {
        let front = Vec3::new(
            self.yaw.to_radians().cos() * self.pitch.to_radians().cos(),
            self.pitch.to_radians().sin(),
            self.yaw.to_radians().sin() * self.pitch.to_radians().cos(),
        )
        .normalize();
        self.forward = front;
        self.right = self.forward.cross(Vec3::Y).normalize();
        self.up = self.right.cross(self.forward).normalize();
    }

    pub fn handle_key(&mut self, key: KeyCode, pressed: bool) {
        if pressed {
            self.held.insert(key);
        } else {
            self.held.remove(&key);
        }
    }

    pub fn handle_mouse_input(&mut self, dx: f64, dy: f64) {
        if dx == 0.0 && dy == 0.0 {
            return;
        }
        self.yaw += dx as f32 * self.mouse_sensitivity;
        self.pitch -= dy as f32 * self.mouse_sensitivity; // Invert Y
        self.pitch = self.pitch.clamp(-PITCH_LIMIT, PITCH_LIMIT);
        self.turned = true;
    }

    /// Apply held keys for `dt` seconds. Returns true if the view changed
    /// since the last call.
    pub fn update(&mut self, dt: f32) -> bool {
        self.update_vectors();

        let mut direction = Vec3::ZERO;
        for key in &self.held {
            direction += match key {
                KeyCode::KeyW => self.forward,
                KeyCode::KeyS => -self.forward,
                KeyCode::KeyA => -self.right,
                KeyCode::KeyD => self.right,
                KeyCode::KeyQ => Vec3::Y,
                KeyCode::KeyE => -Vec3::Y,
                _ => Vec3::ZERO,
            };
        }
        let step = direction * self.speed * dt;
        let moved = step != Vec3::ZERO;
        self.position += step;

        let changed = moved || self.turned;
        self.turned = false;
        changed
    }

    pub fn basis(&self) -> CameraBasis {
        CameraBasis {
            right: self.right,
            up: self.up,
            forward: self.forward,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_camera_reports_no_change() {
        let mut camera = Camera::new();
        assert!(!camera.update(0.016));
        assert!(!camera.update(0.016));
    }

    #[test]
    fn held_key_moves_until_released() {
        let mut camera = Camera::new();
        let start = camera.position;

        camera.handle_key(KeyCode::KeyW, true);
        assert!(camera.update(0.5));
        let travelled = camera.position - start;
        assert!((travelled.length() - camera.speed * 0.5).abs() < 1e-4);
        assert!(travelled.dot(camera.forward) > 0.0);

        camera.handle_key(KeyCode::KeyW, false);
        assert!(!camera.update(0.5));
    }

    #[test]
    fn opposite_keys_cancel() {
        let mut camera = Camera::new();
        camera.handle_key(KeyCode::KeyQ, true);
        camera.handle_key(KeyCode::KeyE, true);
        assert!(!camera.update(1.0));
    }

    #[test]
    fn pitch_is_clamped() {
        let mut camera = Camera::new();
        camera.handle_mouse_input(0.0, -100_000.0);
        assert_eq!(camera.pitch, PITCH_LIMIT);
        assert!(camera.update(0.0));
        assert!(!camera.update(0.0));

        camera.handle_mouse_input(0.0, 100_000.0);
        assert_eq!(camera.pitch, -PITCH_LIMIT);
    }

    #[test]
    fn basis_is_orthonormal() {
        let mut camera = Camera::new();
        camera.handle_mouse_input(123.0, 45.0);
        camera.update(0.0);
        let b = camera.basis();

        for v in [b.right, b.up, b.forward] {
            assert!((v.length() - 1.0).abs() < 1e-5);
        }
        assert!(b.right.dot(b.up).abs() < 1e-5);
        assert!(b.right.dot(b.forward).abs() < 1e-5);
        assert!(b.up.dot(b.forward).abs() < 1e-5);
    }
}
