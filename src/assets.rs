pub const NUM_BUFFERS: usize = 4;

// external video-plane server
pub const DEFAULT_VIDEO_SERVER: &str = "video";
pub const DEFAULT_DRM_NAME: &str = "/dev/dri/card0";

// environment inputs
pub const ENV_RUNTIME_DIR: &str = "XDG_RUNTIME_DIR";
pub const ENV_DRM_NAME: &str = "PLANE_SINK_DRM_NAME";
pub const ENV_USE_GFX: &str = "PLANE_SINK_USE_GFX";
pub const ENV_DEBUG_FRAME: &str = "PLANE_SINK_DEBUG_FRAME";

// timing
pub const PTS_CLOCK_HZ: u64 = 90_000;
pub const NANOS_PER_SECOND: u64 = 1_000_000_000;
pub const DEFAULT_EOS_FRAME_RATE: f64 = 30.0;
pub const FALLBACK_CAPS_FRAME_RATE: f64 = 60.0;
pub const EOS_COUNTDOWN: u32 = 10;
pub const PAUSE_POLL_MS: u64 = 1;
pub const ACQUIRE_POLL_MS: u64 = 1;
pub const DISPATCH_POLL_MS: u64 = 10;

// path switching
pub const HIDE_VIDEO_FRAMES_DELAY: u32 = 2;
pub const HIDE_GFX_FRAMES_DELAY: u32 = 1;

// allocation
pub const LUMA_WIDTH_ALIGN: u32 = 64;
pub const INPUT_STRIDE_ALIGN: u32 = 4;

pub const FRAME_LOG_TARGET: &str = "plane_sink::frame";
