//! Host short-name source.

use crate::error::Result;
use crate::wire::LABEL_MAX;

/// The short form of a hostname: everything up to the first `.`, clamped
/// to the longest label LLMNR can carry.
pub fn short_name(hostname: &[u8]) -> Vec<u8> {
    let mut name: Vec<u8> = hostname
        .split(|&b| b == b'.')
        .next()
        .unwrap_or(&[])
        .to_vec();
    name.truncate(LABEL_MAX);
    name
}

/// The short form of the OS hostname.
pub fn short_host_name() -> Result<Vec<u8>> {
    let hostname = nix::unistd::gethostname()?;
    Ok(short_name(hostname.as_encoded_bytes()))
}
