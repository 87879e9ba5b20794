// ABOUTME: Host alias configuration sources.
// ABOUTME: Defines the AliasResolver seam and the OpenSSH config file reader behind it.

mod ssh_config;

pub use ssh_config::SshConfig;

/// Attribute names consumed when resolving an alias.
pub mod keys {
    pub const HOSTNAME: &str = "Hostname";
    pub const PORT: &str = "Port";
    pub const USER: &str = "User";
    pub const IDENTITY_FILE: &str = "IdentityFile";
    pub const CONNECT_TIMEOUT: &str = "ConnectTimeout";
    pub const ADDRESS_FAMILY: &str = "AddressFamily";
    pub const PROXY_JUMP: &str = "ProxyJump";
}

/// Supplies per-alias host attributes.
///
/// Keys are matched case-insensitively. An empty value is treated the same
/// as an absent one.
pub trait AliasResolver: Send + Sync {
    /// First configured value of `key` for `alias`, if any.
    fn get(&self, alias: &str, key: &str) -> Option<String>;

    /// Every configured value of `key` for `alias`, in configuration order.
    fn get_all(&self, alias: &str, key: &str) -> Vec<String>;
}
