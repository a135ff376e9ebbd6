//! Plugins linked into the host and exported under `grok.authz.plugins`.
//!
//! A unit activates one by naming it as its `entry`, or by being named
//! after it (the trusted parent then provides the unit without touching
//! the disk).

mod user_whitelist;

pub use user_whitelist::USER_WHITELIST_PLUGIN;
pub use user_whitelist::UserWhitelistPlugin;
pub use user_whitelist::WhitelistField;
