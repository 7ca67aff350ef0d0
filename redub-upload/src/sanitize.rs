/// Suffixes that are never acceptable as upload filenames, regardless of
/// how the file will be used.
const DISALLOWED_SUFFIXES: &[&str] = &[
    "exe", "com", "bat", "cmd", "scr", "ps1", "sh", "bash", "js", "mjs", "jar", "dll", "so",
    "dylib", "msi", "app",
];

const MAX_NAME_LEN: usize = 200;

/// Validate and normalize a client-supplied filename.
///
/// Rejected outright: path separators, leading dots, empty stems, double
/// extensions, disallowed suffixes, control characters. The returned name
/// is safe to join under the uploads root.
pub fn sanitize_filename(raw: &str) -> Result<String, String> {
    let name = raw.trim();

    if name.is_empty() {
        return Err("empty filename".into());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!("filename longer than {MAX_NAME_LEN} bytes"));
    }
    if name.starts_with('.') {
        return Err("hidden filenames are not accepted".into());
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err("filename must not contain path separators".into());
    }
    if name.chars().any(|c| c.is_control()) {
        return Err("filename must not contain control characters".into());
    }

    let mut parts = name.split('.');
    let stem = parts.next().unwrap_or_default();
    let extensions: Vec<&str> = parts.collect();

    if stem.is_empty() {
        return Err("empty filename stem".into());
    }
    if extensions.len() > 1 {
        return Err("double extensions are not accepted".into());
    }
    if let Some(ext) = extensions.first() {
        if ext.is_empty() {
            return Err("empty extension".into());
        }
        if DISALLOWED_SUFFIXES.contains(&ext.to_ascii_lowercase().as_str()) {
            return Err(format!("extension .{ext} is not accepted"));
        }
    }

    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_media_names() {
        assert_eq!(sanitize_filename("episode-01.mkv").unwrap(), "episode-01.mkv");
        assert_eq!(sanitize_filename("Feature Cut.mp4").unwrap(), "Feature Cut.mp4");
        assert_eq!(sanitize_filename("raw_audio").unwrap(), "raw_audio");
    }

    #[test]
    fn rejects_path_shapes() {
        assert!(sanitize_filename("../../etc/passwd").is_err());
        assert!(sanitize_filename("dir/file.mkv").is_err());
        assert!(sanitize_filename("dir\\file.mkv").is_err());
        assert!(sanitize_filename(".hidden.mkv").is_err());
        assert!(sanitize_filename("").is_err());
        assert!(sanitize_filename(".").is_err());
    }

    #[test]
    fn rejects_double_extensions_and_bad_suffixes() {
        assert!(sanitize_filename("movie.tar.gz").is_err());
        assert!(sanitize_filename("payload.mkv.exe").is_err());
        assert!(sanitize_filename("script.sh").is_err());
        assert!(sanitize_filename("tool.EXE").is_err());
        assert!(sanitize_filename("movie.").is_err());
    }
}
