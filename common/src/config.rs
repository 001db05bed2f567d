//! Configuration parsing – reads a KEY=VALUE file (compatible with the
//! camera node's `burstcam.conf`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Image formats the node knows how to encode, by file extension.
const IMAGE_TYPES: &[&str] = &["png", "jpg", "jpeg", "bmp", "tiff"];

/// Camera-node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── rolling buffer / persistence ─────────────────────────────────
    /// Maximum number of frames held in the rolling buffer.
    pub roll_buf_size: usize,
    /// Root directory under which one batch directory per drain is created.
    pub img_dir: PathBuf,
    /// Encoded image type, as a lowercase extension without the dot.
    pub img_type: String,

    // ── events ───────────────────────────────────────────────────────
    /// Pause between accepting `EVENT` and marking it pending.
    pub event_delay: Duration,
    /// Upper bound on how long `EVENT` waits for the drain.
    /// `None` waits forever.
    pub event_timeout: Option<Duration>,

    // ── camera ───────────────────────────────────────────────────────
    /// `synthetic` for the built-in test pattern, otherwise a V4L2 device.
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Target acquisition rate. 0 means unpaced.
    pub fps: u32,

    // ── network ──────────────────────────────────────────────────────
    pub listen_addr: String,
    pub listen_backlog: u32,

    // ── logging ──────────────────────────────────────────────────────
    pub log_dir: Option<PathBuf>,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/burstcam/burstcam.conf"
    }

    pub fn uses_synthetic_camera(&self) -> bool {
        self.camera_device.eq_ignore_ascii_case("synthetic")
    }

    /// Time between acquisitions, if the loop is paced.
    pub fn frame_interval(&self) -> Option<Duration> {
        (self.fps > 0).then(|| Duration::from_secs_f64(1.0 / self.fps as f64))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            roll_buf_size: 150,
            img_dir: PathBuf::from("images"),
            img_type: "png".into(),
            event_delay: Duration::from_secs(5),
            event_timeout: Some(Duration::from_secs(600)),
            camera_device: "synthetic".into(),
            frame_width: 640,
            frame_height: 480,
            fps: 8,
            listen_addr: "127.0.0.1:65431".into(),
            listen_backlog: 1,
            log_dir: None,
        }
    }
}

/// Read and parse a configuration file.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;
    from_str(&text).with_context(|| format!("Invalid config: {}", path.display()))
}

/// Build a [`Config`] from `KEY=VALUE` text.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored, and numeric keys
/// that fail to parse keep their default.
pub fn from_str(text: &str) -> Result<Config> {
    let map = parse_conf(text);
    let defaults = Config::default();

    let get = |key: &str| -> Option<String> { map.get(key).cloned() };
    let get_u32 = |key: &str, default: u32| -> u32 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_secs = |key: &str, default: Duration| -> Duration {
        get(key)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(default)
    };

    let roll_buf_size = get("ROLL_BUF_SIZE")
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults.roll_buf_size);
    if roll_buf_size == 0 {
        bail!("ROLL_BUF_SIZE must be at least 1");
    }

    let img_type = get("IMG_TYPE")
        .map(|t| t.trim_start_matches('.').to_ascii_lowercase())
        .unwrap_or(defaults.img_type);
    if !IMAGE_TYPES.contains(&img_type.as_str()) {
        bail!("Unsupported IMG_TYPE '{img_type}' (expected one of {IMAGE_TYPES:?})");
    }

    // EVENT_TIMEOUT=0 restores the unbounded wait.
    let event_timeout = match get_secs("EVENT_TIMEOUT", Duration::from_secs(600)) {
        d if d.is_zero() => None,
        d => Some(d),
    };

    Ok(Config {
        roll_buf_size,
        img_dir: get("IMG_DIR").map(PathBuf::from).unwrap_or(defaults.img_dir),
        img_type,
        event_delay: get_secs("EVENT_DELAY", defaults.event_delay),
        event_timeout,
        camera_device: get("CAMERA_DEVICE")
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.camera_device),
        frame_width: get_u32("FRAME_WIDTH", defaults.frame_width).max(1),
        frame_height: get_u32("FRAME_HEIGHT", defaults.frame_height).max(1),
        fps: get_u32("FPS", defaults.fps),
        listen_addr: get("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
        listen_backlog: get_u32("LISTEN_BACKLOG", defaults.listen_backlog).max(1),
        log_dir: get("LOG_DIR").filter(|s| !s.is_empty()).map(PathBuf::from),
    })
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
