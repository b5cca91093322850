//! Remote path syntax

/// Normalize a path to the remote store's syntax.
///
/// Backslashes become slashes, a leading drive letter is stripped, repeated
/// separators collapse and the result is absolute without a trailing slash.
pub fn normalize_remote_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");

    let without_drive = match unified.as_bytes() {
        [letter, b':', ..] if letter.is_ascii_alphabetic() => &unified[2..],
        _ => unified.as_str(),
    };

    let segments: Vec<&str> = without_drive
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();

    format!("/{}", segments.join("/"))
}

/// Parent directory of a normalized remote path, `None` for the root.
pub fn remote_parent(path: &str) -> Option<String> {
    let normalized = normalize_remote_path(path);
    match normalized.rfind('/') {
        Some(0) if normalized.len() > 1 => Some("/".to_string()),
        Some(0) | None => None,
        Some(index) => Some(normalized[..index].to_string()),
    }
}
