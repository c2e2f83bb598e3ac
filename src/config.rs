use crate::assets::{
    DEFAULT_DRM_NAME, DEFAULT_VIDEO_SERVER, ENV_DEBUG_FRAME, ENV_DRM_NAME, ENV_RUNTIME_DIR,
    ENV_USE_GFX, HIDE_GFX_FRAMES_DELAY, HIDE_VIDEO_FRAMES_DELAY, NUM_BUFFERS,
};
use crate::error::{Result, SinkError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Maximum length of a unix socket path, terminator included.
const SUN_PATH_MAX: usize = 108;

/// Per-session configuration.
///
/// Built once per session, either from the environment or from a JSON file;
/// nothing in the library reads process-wide state after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub runtime_dir: Option<PathBuf>,
    pub server_name: String,
    pub drm_device: PathBuf,
    pub capture_only: bool,
    pub frame_debug: bool,
    pub num_buffers: usize,
    pub enable_texture: bool,
    pub force_aspect_ratio: bool,
    pub hide_video_frames_delay: u32,
    pub hide_gfx_frames_delay: u32,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            runtime_dir: None,
            server_name: DEFAULT_VIDEO_SERVER.to_string(),
            drm_device: PathBuf::from(DEFAULT_DRM_NAME),
            capture_only: false,
            frame_debug: false,
            num_buffers: NUM_BUFFERS,
            enable_texture: false,
            force_aspect_ratio: false,
            hide_video_frames_delay: HIDE_VIDEO_FRAMES_DELAY,
            hide_gfx_frames_delay: HIDE_GFX_FRAMES_DELAY,
        }
    }
}

impl SinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the environment inputs the sink understands.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SinkConfig::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut conf = SinkConfig::default();

        conf.runtime_dir = lookup(ENV_RUNTIME_DIR).map(PathBuf::from);

        if let Some(drm) = lookup(ENV_DRM_NAME) {
            conf.drm_device = PathBuf::from(drm);
        }

        if lookup(ENV_USE_GFX).is_some() {
            log::info!("capture only");
            conf.capture_only = true;
        }

        if let Some(level) = lookup(ENV_DEBUG_FRAME) {
            conf.frame_debug = level.trim().parse::<i32>().map(|l| l > 0).unwrap_or(false);
        }

        conf
    }

    /// Loads a configuration from a JSON file; missing keys keep their defaults.
    pub fn load_json(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = Some(dir.into());
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn with_drm_device(mut self, device: impl Into<PathBuf>) -> Self {
        self.drm_device = device.into();
        self
    }

    pub fn with_capture_only(mut self, capture_only: bool) -> Self {
        self.capture_only = capture_only;
        self
    }

    pub fn with_frame_debug(mut self, frame_debug: bool) -> Self {
        self.frame_debug = frame_debug;
        self
    }

    pub fn with_num_buffers(mut self, num_buffers: usize) -> Self {
        self.num_buffers = num_buffers.max(1);
        self
    }

    pub fn with_texture(mut self, enable: bool) -> Self {
        self.enable_texture = enable;
        self
    }

    pub fn with_force_aspect_ratio(mut self, force: bool) -> Self {
        self.force_aspect_ratio = force;
        self
    }

    /// `<runtime-dir>/<server-name>`
    pub fn socket_path(&self) -> Result<PathBuf> {
        let dir = self
            .runtime_dir
            .as_ref()
            .ok_or(SinkError::NoRuntimeDir(ENV_RUNTIME_DIR))?;
        let path = dir.join(&self.server_name);

        let len = path.as_os_str().len() + 1;
        if len > SUN_PATH_MAX {
            return Err(SinkError::SocketPathTooLong {
                path,
                len,
                max: SUN_PATH_MAX,
            });
        }
        Ok(path)
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_defaults() {
        let conf = SinkConfig::from_lookup(lookup_from(&[]));
        assert_eq!(conf.runtime_dir, None);
        assert_eq!(conf.drm_device, PathBuf::from(DEFAULT_DRM_NAME));
        assert!(!conf.capture_only);
        assert!(!conf.frame_debug);
        assert_eq!(conf.num_buffers, NUM_BUFFERS);
        assert!(conf.socket_path().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let conf = SinkConfig::from_lookup(lookup_from(&[
            (ENV_RUNTIME_DIR, "/run/user/1000"),
            (ENV_DRM_NAME, "/dev/dri/card1"),
            (ENV_USE_GFX, ""),
            (ENV_DEBUG_FRAME, "2"),
        ]));
        assert_eq!(conf.drm_device, PathBuf::from("/dev/dri/card1"));
        assert!(conf.capture_only);
        assert!(conf.frame_debug);
        assert_eq!(
            conf.socket_path().unwrap(),
            PathBuf::from("/run/user/1000/video")
        );
    }

    #[test]
    fn test_debug_level_zero_disables() {
        let conf = SinkConfig::from_lookup(lookup_from(&[(ENV_DEBUG_FRAME, "0")]));
        assert!(!conf.frame_debug);
        let conf = SinkConfig::from_lookup(lookup_from(&[(ENV_DEBUG_FRAME, "junk")]));
        assert!(!conf.frame_debug);
    }

    #[test]
    fn test_socket_path_too_long() {
        let conf = SinkConfig::new().with_runtime_dir("/".to_string() + &"x".repeat(120));
        assert!(matches!(
            conf.socket_path(),
            Err(SinkError::SocketPathTooLong { .. })
        ));
    }

    #[test]
    fn test_json_partial() {
        let conf: SinkConfig =
            serde_json::from_str(r#"{ "capture_only": true, "num_buffers": 6 }"#).unwrap();
        assert!(conf.capture_only);
        assert_eq!(conf.num_buffers, 6);
        assert_eq!(conf.server_name, DEFAULT_VIDEO_SERVER);
    }
}
