use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Process-wide settings, read once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub boards: Vec<String>,
    pub read_only: bool,
    /// Disables throughput limits and thread cooldowns
    pub debug: bool,
    pub max_body_len: usize,
    pub max_body_lines: usize,
    pub max_name_len: usize,
    pub max_subject_len: usize,
    pub max_image_name_len: usize,
    pub bump_limit: u32,
    pub board_bump_limits: HashMap<String, u32>,
    pub thread_cooldown: Duration,
    pub reply_limit: usize,
    pub reply_window: Duration,
    pub image_expiry: Duration,
    pub duplicate_window: Duration,
    pub fanout_idle: Duration,
    pub open_post_max_age: Duration,
    /// Missed entries above this count are left to the HTTP backlog
    pub replay_limit: u64,
    pub ban_duration: Duration,
    pub http_addr: String,
    pub socket_addr: String,
    pub media_dir: PathBuf,
    pub media_url: String,
    pub data_dir: Option<PathBuf>,
    pub password_salt: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            boards: vec!["a".into()],
            read_only: false,
            debug: false,
            max_body_len: 2000,
            max_body_lines: 30,
            max_name_len: 50,
            max_subject_len: 100,
            max_image_name_len: 200,
            bump_limit: 1000,
            board_bump_limits: HashMap::new(),
            thread_cooldown: Duration::from_secs(300),
            reply_limit: 10,
            reply_window: Duration::from_secs(60),
            image_expiry: Duration::from_secs(60),
            duplicate_window: Duration::from_secs(3600),
            fanout_idle: Duration::from_secs(30),
            open_post_max_age: Duration::from_secs(30 * 60),
            replay_limit: 500,
            ban_duration: Duration::from_secs(24 * 3600),
            http_addr: "0.0.0.0:8080".into(),
            socket_addr: "0.0.0.0:8081".into(),
            media_dir: PathBuf::from("media"),
            media_url: "/media".into(),
            data_dir: None,
            password_salt: String::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        fn var(name: &str) -> Option<String> { std::env::var(name).ok().filter(|v| !v.is_empty()) }
        fn usize_env(name: &str, default: usize) -> usize { var(name).and_then(|v| v.parse().ok()).unwrap_or(default) }
        fn u32_env(name: &str, default: u32) -> u32 { var(name).and_then(|v| v.parse().ok()).unwrap_or(default) }
        fn u64_env(name: &str, default: u64) -> u64 { var(name).and_then(|v| v.parse().ok()).unwrap_or(default) }
        fn dur_env(name: &str, default: Duration) -> Duration { var(name).and_then(|v| v.parse().ok()).map(Duration::from_secs).unwrap_or(default) }
        fn bool_env(name: &str) -> bool { matches!(var(name).as_deref(), Some("1" | "true" | "yes")) }

        let d = Self::default();
        Self {
            boards: var("RIB_BOARDS")
                .map(|v| v.split(',').map(|b| b.trim().to_string()).filter(|b| !b.is_empty()).collect())
                .unwrap_or(d.boards),
            read_only: bool_env("RIB_READ_ONLY"),
            debug: bool_env("RIB_DEBUG"),
            max_body_len: usize_env("RIB_MAX_BODY_LEN", d.max_body_len),
            max_body_lines: usize_env("RIB_MAX_BODY_LINES", d.max_body_lines),
            max_name_len: usize_env("RIB_MAX_NAME_LEN", d.max_name_len),
            max_subject_len: usize_env("RIB_MAX_SUBJECT_LEN", d.max_subject_len),
            max_image_name_len: usize_env("RIB_MAX_IMAGE_NAME_LEN", d.max_image_name_len),
            bump_limit: u32_env("RIB_BUMP_LIMIT", d.bump_limit),
            board_bump_limits: var("RIB_BUMP_LIMITS").map(|v| parse_bump_limits(&v)).unwrap_or_default(),
            thread_cooldown: dur_env("RIB_THREAD_COOLDOWN", d.thread_cooldown),
            reply_limit: usize_env("RIB_REPLY_LIMIT", d.reply_limit),
            reply_window: dur_env("RIB_REPLY_WINDOW", d.reply_window),
            image_expiry: dur_env("RIB_IMAGE_EXPIRY", d.image_expiry),
            duplicate_window: dur_env("RIB_DUPLICATE_WINDOW", d.duplicate_window),
            fanout_idle: dur_env("RIB_FANOUT_IDLE", d.fanout_idle),
            open_post_max_age: dur_env("RIB_OPEN_POST_MAX_AGE", d.open_post_max_age),
            replay_limit: u64_env("RIB_REPLAY_LIMIT", d.replay_limit),
            ban_duration: dur_env("RIB_BAN_DURATION", d.ban_duration),
            http_addr: var("RIB_HTTP_ADDR").unwrap_or(d.http_addr),
            socket_addr: var("RIB_SOCKET_ADDR").unwrap_or(d.socket_addr),
            media_dir: var("RIB_MEDIA_DIR").map(PathBuf::from).unwrap_or(d.media_dir),
            media_url: var("RIB_MEDIA_URL").unwrap_or(d.media_url),
            data_dir: var("RIB_DATA_DIR").map(PathBuf::from),
            password_salt: var("RIB_PASSWORD_SALT").unwrap_or(d.password_salt),
        }
    }

    pub fn bump_limit_for(&self, board: &str) -> u32 {
        self.board_bump_limits.get(board).copied().unwrap_or(self.bump_limit)
    }

    pub fn is_board(&self, board: &str) -> bool {
        self.boards.iter().any(|b| b == board)
    }
}

/// Parses `a:500,b:1000`. Malformed pairs are skipped.
fn parse_bump_limits(raw: &str) -> HashMap<String, u32> {
    raw.split(',')
        .filter_map(|pair| {
            let (board, limit) = pair.split_once(':')?;
            Some((board.trim().to_string(), limit.trim().parse().ok()?))
        })
        .collect()
}
