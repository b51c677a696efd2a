// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;

// Session limits
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;
pub const DEFAULT_CHANNEL: &str = "general";

// History configuration constants
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;
pub const DEFAULT_HISTORY_REPLAY: usize = 10;

// Width of the right-justified sender column in relayed lines
pub const SENDER_COLUMN_WIDTH: usize = 18;

// Login handshake
pub const MAX_LOGIN_ATTEMPTS: usize = 3;
pub const MIN_AUTH_DURATION_MS: u64 = 100;

// Outbound delivery
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5000;
