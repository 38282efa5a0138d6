use std::path::{Component, Path};

/// Accepts `name` only when it is a single ordinary file name: no separators,
/// no `.`/`..`, no drive or root prefix.
pub fn plain_file_name(name: &str) -> Option<&str> {
    if name.is_empty() || name.trim() != name {
        return None;
    }
    if name.contains(['/', '\\', '\0', ':']) {
        return None;
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == name => Some(name),
        _ => None,
    }
}

/// Positions coming back from a decoder can be NaN or negative around stream
/// boundaries; treat those as the start.
pub fn sanitize_position(p: f64) -> f64 {
    if p.is_nan() || !p.is_finite() || p < 0.0 {
        0.0
    } else {
        p
    }
}

/// `MM:SS`, where MM is the minutes component of the time (hours are not shown).
pub fn format_clock(seconds: f64) -> String {
    let total = sanitize_position(seconds).floor() as u64;
    let minutes = (total / 60) % 60;
    let secs = total % 60;
    format!("{:02}:{:02}", minutes, secs)
}
