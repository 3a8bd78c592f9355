use std::path::{Path, PathBuf};

use log::debug;
use url::Url;

pub const SUPPORTED_MEDIA_EXTENSIONS: [&str; 6] = ["ogg", "mp3", "webm", "m4a", "flac", "wav"];
pub const DEFAULT_MEDIA_EXTENSION: &str = "ogg";

const ILLEGAL_NAME_CHARS: [char; 9] = ['\\', '/', '*', '?', ':', '"', '<', '>', '|'];

/// Strips characters no common filesystem accepts in a path component.
pub fn sanitize_component(name: &str) -> String {
    name.chars()
        .filter(|ch| !ILLEGAL_NAME_CHARS.contains(ch) && !ch.is_control())
        .collect::<String>()
        .trim()
        .trim_end_matches('.')
        .trim()
        .to_string()
}

/// File extension for a media link, taken from its path when recognized.
pub fn extension_from_link(link: &str) -> String {
    Url::parse(link.trim())
        .ok()
        .and_then(|url| {
            let last_segment = url.path_segments()?.next_back()?.to_string();
            let (_, extension) = last_segment.rsplit_once('.')?;
            Some(extension.to_ascii_lowercase())
        })
        .filter(|extension| {
            SUPPORTED_MEDIA_EXTENSIONS
                .iter()
                .any(|supported| extension == supported)
        })
        .unwrap_or_else(|| DEFAULT_MEDIA_EXTENSION.to_string())
}

/// Appends ` (2)`, ` (3)`, ... to the stem until `is_taken` rejects the name.
pub fn unique_file_name(stem: &str, extension: &str, is_taken: impl Fn(&str) -> bool) -> String {
    let first = format!("{stem}.{extension}");
    if !is_taken(&first) {
        return first;
    }
    (2..)
        .map(|counter| format!("{stem} ({counter}).{extension}"))
        .find(|candidate| !is_taken(candidate))
        .unwrap_or(first)
}

/// Every regular file under `root`, as `(absolute path, '/'-joined relative name)`, sorted.
pub fn collect_files_for_archive(root: &Path) -> Vec<(PathBuf, String)> {
    let mut pending_directories = vec![root.to_path_buf()];
    let mut files = Vec::new();

    while let Some(directory) = pending_directories.pop() {
        let entries = match std::fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(err) => {
                debug!("Failed to read directory {}: {}", directory.display(), err);
                continue;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(
                        "Failed to read a directory entry in {}: {}",
                        directory.display(),
                        err
                    );
                    continue;
                }
            };

            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(err) => {
                    debug!("Failed to inspect {}: {}", path.display(), err);
                    continue;
                }
            };

            if file_type.is_dir() {
                pending_directories.push(path);
                continue;
            }

            if file_type.is_file() {
                let Ok(relative) = path.strip_prefix(root) else {
                    continue;
                };
                let name = relative
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push((path, name));
            }
        }
    }

    files.sort_unstable_by(|left, right| left.1.cmp(&right.1));
    files
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{collect_files_for_archive, extension_from_link, sanitize_component, unique_file_name};

    #[test]
    fn test_sanitize_component_strips_illegal_characters() {
        assert_eq!(sanitize_component(" Re:Zero? <Part/2> "), "ReZero Part2");
        assert_eq!(sanitize_component("Title..."), "Title");
        assert_eq!(sanitize_component("???"), "");
    }

    #[test]
    fn test_extension_from_link_defaults_to_ogg() {
        assert_eq!(extension_from_link("https://a.animethemes.moe/Show-OP1.ogg"), "ogg");
        assert_eq!(extension_from_link("https://cdn.example.test/a/Song.MP3?x=1"), "mp3");
        assert_eq!(extension_from_link("https://v.animethemes.moe/Show-OP1.webm"), "webm");
        assert_eq!(extension_from_link("https://cdn.example.test/stream"), "ogg");
        assert_eq!(extension_from_link("https://cdn.example.test/file.exe"), "ogg");
    }

    #[test]
    fn test_unique_file_name_adds_counter_suffix() {
        let taken = ["OP1 - Song.ogg".to_string(), "OP1 - Song (2).ogg".to_string()];
        let name = unique_file_name("OP1 - Song", "ogg", |candidate| {
            taken.iter().any(|existing| existing == candidate)
        });
        assert_eq!(name, "OP1 - Song (3).ogg");
        assert_eq!(unique_file_name("ED1 - Song", "ogg", |_| false), "ED1 - Song.ogg");
    }

    #[test]
    fn test_collect_files_for_archive_returns_sorted_relative_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("Show B")).expect("mkdir");
        fs::create_dir_all(dir.path().join("Show A/nested")).expect("mkdir");
        fs::write(dir.path().join("Show B/OP1 - x.ogg"), b"b").expect("write");
        fs::write(dir.path().join("Show A/ED1 - y.ogg"), b"a").expect("write");
        fs::write(dir.path().join("Show A/nested/z.mp3"), b"z").expect("write");

        let names: Vec<String> = collect_files_for_archive(dir.path())
            .into_iter()
            .map(|(_, name)| name)
            .collect();

        assert_eq!(
            names,
            vec!["Show A/ED1 - y.ogg", "Show A/nested/z.mp3", "Show B/OP1 - x.ogg"]
        );
    }
}
