use std::sync::LazyLock;

pub const DEFAULT_PORT: u16 = 8425;

// Per-account concurrency ceiling; one conversation must not monopolise an account.
pub const MAX_CONCURRENT_REQUESTS: u32 = 5;

// Accounts with less than this fraction of quota remaining are skipped by selection.
pub const MIN_QUOTA_FRACTION: f64 = 0.1;

// Signatures below this length carry no validation value upstream and are treated as empty.
pub const MIN_SIGNATURE_LENGTH: usize = 50;

pub static USER_AGENT: LazyLock<String> = LazyLock::new(|| {
    format!(
        "trestle/{} {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});

pub fn data_dir() -> std::path::PathBuf {
    if let Ok(dir) = std::env::var("TRESTLE_DATA_DIR") {
        if !dir.trim().is_empty() {
            return std::path::PathBuf::from(dir);
        }
    }
    std::path::PathBuf::from(".")
}
