use std::path::PathBuf;
use std::str::FromStr;

/// Startup options. Everything has a working default; `from_env` overlays
/// `RT_*` environment variables on top.
#[derive(Clone, Debug)]
pub struct RendererConfig {
    pub width: u32,
    pub height: u32,
    /// `None` keeps one frame slot per presentable image.
    pub frames_in_flight: Option<usize>,
    /// Applies to every fence wait and image acquire. `u64::MAX` waits forever.
    pub fence_timeout_ns: u64,
    pub max_ray_recursion: u32,
    pub shader_dir: PathBuf,
    pub validation: bool,
    /// Orbit speed of the animated object, in radians per second.
    pub orbit_speed: f32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frames_in_flight: None,
            fence_timeout_ns: u64::MAX,
            max_ray_recursion: 4,
            shader_dir: PathBuf::from("shaders"),
            validation: cfg!(debug_assertions),
            orbit_speed: 0.6,
        }
    }
}

impl RendererConfig {
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(width) = parse_var(&lookup, "RT_WIDTH") {
            self.width = width;
        }
        if let Some(height) = parse_var(&lookup, "RT_HEIGHT") {
            self.height = height;
        }
        if let Some(frames) = parse_var::<usize>(&lookup, "RT_FRAMES_IN_FLIGHT") {
            self.frames_in_flight = Some(frames);
        }
        if let Some(timeout) = parse_var(&lookup, "RT_FENCE_TIMEOUT_NS") {
            self.fence_timeout_ns = timeout;
        }
        if let Some(dir) = lookup("RT_SHADER_DIR") {
            self.shader_dir = PathBuf::from(dir);
        }
        if let Some(validation) = parse_var(&lookup, "RT_VALIDATION") {
            self.validation = validation;
        }
        if let Some(speed) = parse_var(&lookup, "RT_ORBIT_SPEED") {
            self.orbit_speed = speed;
        }
        self
    }

    /// Number of frame slots for a swapchain with `image_count` images.
    pub fn frame_slots(&self, image_count: usize) -> usize {
        match self.frames_in_flight {
            Some(n) => n.clamp(1, image_count.max(1)),
            None => image_count.max(1),
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn with_vars(vars: &[(&str, &str)]) -> RendererConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RendererConfig::default().overlay(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_match_fixed_window() {
        let config = RendererConfig::default();
        assert_eq!((config.width, config.height), (1280, 720));
        assert_eq!(config.fence_timeout_ns, u64::MAX);
        assert_eq!(config.frames_in_flight, None);
    }

    #[test]
    fn env_overrides_apply() {
        let config = with_vars(&[
            ("RT_WIDTH", "800"),
            ("RT_FRAMES_IN_FLIGHT", "2"),
            ("RT_VALIDATION", "false"),
            ("RT_SHADER_DIR", "/tmp/shaders"),
        ]);
        assert_eq!(config.width, 800);
        assert_eq!(config.height, 720);
        assert_eq!(config.frames_in_flight, Some(2));
        assert!(!config.validation);
        assert_eq!(config.shader_dir, PathBuf::from("/tmp/shaders"));
    }

    #[test]
    fn bad_values_are_ignored() {
        let config = with_vars(&[("RT_HEIGHT", "tall"), ("RT_ORBIT_SPEED", "fast")]);
        assert_eq!(config.height, 720);
        assert_eq!(config.orbit_speed, RendererConfig::default().orbit_speed);
    }

    #[test]
    fn frame_slots_follow_image_count() {
        let mut config = RendererConfig::default();
        assert_eq!(config.frame_slots(3), 3);

        config.frames_in_flight = Some(2);
        assert_eq!(config.frame_slots(3), 2);

        config.frames_in_flight = Some(8);
        assert_eq!(config.frame_slots(3), 3);

        config.frames_in_flight = Some(0);
        assert_eq!(config.frame_slots(3), 1);
    }
}
