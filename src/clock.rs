use chrono::Local;

/// Wall-clock timestamp in the `YYYY-MM-DD HH:MM:SS` form that every
/// log line and memory sample carries.
pub fn now() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
