//! Backend configuration.
//!
//! Values come from defaults, optionally overridden with console-variable
//! style `set <name> <value>` lines, and are clamped against sane limits
//! before the backend is created.

use std::path::PathBuf;

use crate::error::ConfigError;

/// Backend configuration settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    /// Number of render contexts (one worker thread each).
    pub contexts: usize,
    /// Command-buffer ring slots per context.
    pub ring_slots: usize,
    /// Frames a submission may stay in flight before its resources are reused.
    pub frames_in_flight: u64,
    /// Command count per face buffer at which a flush is considered.
    pub high_water_mark: u32,
    /// Every recording face buffer must reach this count before a high-water flush.
    pub low_water_mark: u32,
    /// Command count that forces a flush regardless of the other faces.
    pub hard_command_limit: u32,
    /// Bound for fence waits. Expiry is fatal.
    pub fence_timeout_ns: u64,
    /// Buffer GC period, also the staleness threshold for allocations.
    pub gc_interval_frames: u64,
    /// Size of the uniform arena owned by each (context, ring slot).
    pub uniform_arena_bytes: u64,
    /// Descriptor sets allocated per growth step.
    pub descriptor_sets_per_block: u32,
    /// Width of the backend-owned frame target.
    pub frame_width: u32,
    /// Height of the backend-owned frame target.
    pub frame_height: u32,
    /// Enable Vulkan validation layers.
    pub validation: bool,
    /// Explicit path to `glslc`. Searched on PATH and in VULKAN_SDK otherwise.
    pub glslc: Option<PathBuf>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            contexts: 4,
            ring_slots: 3,
            frames_in_flight: 2,
            high_water_mark: 1000,
            low_water_mark: 100,
            hard_command_limit: 4000,
            fence_timeout_ns: 5_000_000_000,
            gc_interval_frames: 60,
            uniform_arena_bytes: 4 * 1024 * 1024,
            descriptor_sets_per_block: 64,
            frame_width: 1280,
            frame_height: 720,
            validation: false,
            glslc: None,
        }
    }
}

impl BackendConfig {
    /// Return a copy with every value clamped into its valid range.
    pub fn validated(&self) -> Self {
        let mut config = self.clone();
        config.contexts = config.contexts.clamp(1, 64);
        config.ring_slots = config.ring_slots.clamp(2, 16);
        config.frames_in_flight = config.frames_in_flight.clamp(1, 8);
        config.high_water_mark = config.high_water_mark.max(2);
        config.low_water_mark = config.low_water_mark.clamp(1, config.high_water_mark - 1);
        config.hard_command_limit = config.hard_command_limit.max(config.high_water_mark);
        config.fence_timeout_ns = config.fence_timeout_ns.max(1_000_000);
        config.gc_interval_frames = config.gc_interval_frames.max(config.frames_in_flight + 1);
        config.uniform_arena_bytes = config.uniform_arena_bytes.max(64 * 1024);
        config.descriptor_sets_per_block = config.descriptor_sets_per_block.clamp(1, 4096);
        config.frame_width = config.frame_width.max(1);
        config.frame_height = config.frame_height.max(1);
        config
    }

    /// Set a single variable by name.
    pub fn apply(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
            value.parse::<T>().map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                value: value.to_string(),
            })
        }

        match name {
            "gpu_contexts" => self.contexts = parse(name, value)?,
            "gpu_ring_slots" => self.ring_slots = parse(name, value)?,
            "gpu_frames_in_flight" => self.frames_in_flight = parse(name, value)?,
            "gpu_high_water" => self.high_water_mark = parse(name, value)?,
            "gpu_low_water" => self.low_water_mark = parse(name, value)?,
            "gpu_hard_limit" => self.hard_command_limit = parse(name, value)?,
            "gpu_fence_timeout_ms" => {
                let ms: u64 = parse(name, value)?;
                self.fence_timeout_ns = ms.saturating_mul(1_000_000);
            }
            "gpu_gc_frames" => self.gc_interval_frames = parse(name, value)?,
            "gpu_uniform_arena_kb" => {
                let kb: u64 = parse(name, value)?;
                self.uniform_arena_bytes = kb.saturating_mul(1024);
            }
            "gpu_descriptor_block" => self.descriptor_sets_per_block = parse(name, value)?,
            "vid_width" => self.frame_width = parse(name, value)?,
            "vid_height" => self.frame_height = parse(name, value)?,
            "vk_validation" => {
                let v: i32 = parse(name, value)?;
                self.validation = v != 0;
            }
            "vk_glslc" => self.glslc = Some(PathBuf::from(value)),
            _ => return Err(ConfigError::UnknownVariable(name.to_string())),
        }
        Ok(())
    }

    /// Apply a script of `set <name> <value>` lines. `//` starts a comment.
    pub fn apply_script(&mut self, script: &str) -> Result<(), ConfigError> {
        for (number, raw) in script.lines().enumerate() {
            let line = match raw.find("//") {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let mut parts = line.split_whitespace();
            let Some(command) = parts.next() else {
                continue;
            };
            if command != "set" {
                return Err(ConfigError::UnknownCommand(command.to_string()).at_line(number + 1));
            }
            let (Some(name), Some(value)) = (parts.next(), parts.next()) else {
                return Err(ConfigError::Usage.at_line(number + 1));
            };
            let value = value.trim_matches('"');
            self.apply(name, value).map_err(|e| e.at_line(number + 1))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_already_valid() {
        let config = BackendConfig::default();
        assert_eq!(config.validated(), config);
    }

    #[test]
    fn test_validated_keeps_low_below_high() {
        let config = BackendConfig {
            high_water_mark: 10,
            low_water_mark: 50,
            hard_command_limit: 5,
            ..Default::default()
        }
        .validated();
        assert_eq!(config.low_water_mark, 9);
        assert_eq!(config.hard_command_limit, 10);
    }

    #[test]
    fn test_validated_minimum_ring() {
        let config = BackendConfig {
            ring_slots: 0,
            contexts: 0,
            ..Default::default()
        }
        .validated();
        assert_eq!(config.ring_slots, 2);
        assert_eq!(config.contexts, 1);
    }

    #[test]
    fn test_apply_script() {
        let mut config = BackendConfig::default();
        config
            .apply_script(
                "// render settings\n\
                 set gpu_contexts 2\n\
                 set gpu_high_water \"500\"\n\
                 \n\
                 set gpu_fence_timeout_ms 250 // short\n\
                 set vk_validation 1\n",
            )
            .unwrap();
        assert_eq!(config.contexts, 2);
        assert_eq!(config.high_water_mark, 500);
        assert_eq!(config.fence_timeout_ns, 250_000_000);
        assert!(config.validation);
    }

    #[test]
    fn test_apply_rejects_unknown_and_bad_values() {
        let mut config = BackendConfig::default();
        assert_eq!(
            config.apply("gpu_nonsense", "1"),
            Err(ConfigError::UnknownVariable("gpu_nonsense".into()))
        );
        assert!(matches!(
            config.apply("gpu_contexts", "many"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(
            config.apply_script("bind x y"),
            Err(ConfigError::UnknownCommand("bind".into()).at_line(1))
        );
        assert_eq!(
            config.apply_script("// header\nset gpu_contexts"),
            Err(ConfigError::Usage.at_line(2))
        );
    }
}
