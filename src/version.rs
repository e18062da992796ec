// Centralized version information

// Version compared against VERSION= in the server metadata
// Bump this for every image published to the update server
pub const SOFTWARE_VERSION: u32 = 3;

// Cargo package version from Cargo.toml
pub const CARGO_VERSION: &str = env!("CARGO_PKG_VERSION");

// Full version string including Cargo version
pub fn full_version() -> String {
    format!("v{} ({})", SOFTWARE_VERSION, CARGO_VERSION)
}
