//! Per-user channel naming.
//!
//! The controller and the supervisor must agree on the channel without
//! exchanging anything first, so the name is derived from the product name and
//! the OS user only.

use std::sync::OnceLock;

/// Product prefix shared by every channel name.
pub const PRODUCT: &str = "boxpilot";

/// Used when no username can be resolved.
pub const FALLBACK_CHANNEL: &str = "boxpilot-core";

/// Channel name for the current user, computed once per process.
pub fn channel_name() -> &'static str {
    static NAME: OnceLock<String> = OnceLock::new();
    NAME.get_or_init(|| derive_channel_name(current_username().as_deref()))
}

/// `<product>-core-<lowercased-username>`, or the fallback when the username
/// is missing or blank.
pub fn derive_channel_name(username: Option<&str>) -> String {
    match username.map(str::trim).filter(|u| !u.is_empty()) {
        Some(user) => format!("{PRODUCT}-core-{}", user.to_lowercase()),
        None => FALLBACK_CHANNEL.to_string(),
    }
}

fn current_username() -> Option<String> {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
        .or_else(username_from_uid)
}

#[cfg(unix)]
fn username_from_uid() -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
}

#[cfg(not(unix))]
fn username_from_uid() -> Option<String> {
    None
}
