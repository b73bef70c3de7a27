//! Client version check. Independent of the token subsystem.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionStatus {
    pub up_to_date: bool,
    pub current_version: String,
    pub client_version: String,
}

/// Compares trimmed, case-folded versions. `None` when the client sent
/// nothing usable.
pub fn check(client_version: Option<&str>, current_version: &str) -> Option<VersionStatus> {
    let client = client_version.map(str::trim).filter(|v| !v.is_empty())?;
    let current = current_version.trim();

    Some(VersionStatus {
        up_to_date: client.eq_ignore_ascii_case(current),
        current_version: current.to_owned(),
        client_version: client.to_owned(),
    })
}
