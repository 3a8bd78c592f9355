//! MyAnimeList import document writer.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use log::info;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::error::ExportError;
use crate::protocol::AcquisitionTarget;

pub const DEFAULT_REQUESTER_ID: &str = "bahamut_user";
const INDENT_WIDTH: usize = 4;
const EXPORT_TYPE_ANIME: &str = "1";

/// Fixed per-item fields; only id and title come from the input.
const ITEM_DEFAULTS: [(&str, &str); 8] = [
    ("series_type", ""),
    ("series_episodes", "0"),
    ("my_watched_episodes", "0"),
    ("my_start_date", "0000-00-00"),
    ("my_finish_date", "0000-00-00"),
    ("my_score", "0"),
    ("my_status", "Completed"),
    ("update_on_import", "1"),
];

fn write_error(error: impl Display) -> ExportError {
    ExportError::Write(error.to_string())
}

fn start(writer: &mut Writer<Vec<u8>>, name: &str) -> Result<(), ExportError> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(write_error)
}

fn end(writer: &mut Writer<Vec<u8>>, name: &str) -> Result<(), ExportError> {
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(write_error)
}

fn text_node(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<(), ExportError> {
    writer
        .create_element(name)
        .write_text_content(BytesText::new(text))
        .map(|_| ())
        .map_err(write_error)
}

/// Builds the import document: one `anime` node per target, in input order.
///
/// Identical input always yields byte-identical output.
pub fn serialize(targets: &[AcquisitionTarget], requester_id: &str) -> Result<String, ExportError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', INDENT_WIDTH);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(write_error)?;

    start(&mut writer, "myanimelist")?;
    start(&mut writer, "myinfo")?;
    text_node(&mut writer, "user_id", requester_id)?;
    text_node(&mut writer, "user_name", requester_id)?;
    text_node(&mut writer, "user_export_type", EXPORT_TYPE_ANIME)?;
    end(&mut writer, "myinfo")?;

    for target in targets {
        start(&mut writer, "anime")?;
        text_node(&mut writer, "series_animedb_id", &target.canonical_id.to_string())?;
        text_node(&mut writer, "series_title", &target.title)?;
        for (name, value) in ITEM_DEFAULTS {
            text_node(&mut writer, name, value)?;
        }
        end(&mut writer, "anime")?;
    }
    end(&mut writer, "myanimelist")?;

    let mut document = String::from_utf8(writer.into_inner())?;
    document.push('\n');
    Ok(document)
}

/// Conventional file name for a requester's import document.
pub fn document_file_name(requester_id: &str) -> String {
    format!("{requester_id}_mal_import.xml")
}

/// Writes `document` into `output_dir`, returning the full path.
pub fn save(document: &str, output_dir: &Path, requester_id: &str) -> Result<PathBuf, ExportError> {
    std::fs::create_dir_all(output_dir).map_err(|source| ExportError::Save {
        path: output_dir.to_path_buf(),
        source,
    })?;
    let path = output_dir.join(document_file_name(requester_id));
    std::fs::write(&path, document).map_err(|source| ExportError::Save {
        path: path.clone(),
        source,
    })?;
    info!("Export: wrote {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::{save, serialize};
    use crate::protocol::AcquisitionTarget;

    fn target(id: u64, title: &str) -> AcquisitionTarget {
        AcquisitionTarget {
            canonical_id: id,
            title: title.to_string(),
        }
    }

    #[test]
    fn test_serialize_writes_one_node_per_item_in_order() {
        let targets = vec![target(30, "Third"), target(10, "First"), target(20, "Second")];
        let document = serialize(&targets, "someone").expect("document should build");

        assert_eq!(document.matches("<anime>").count(), 3);
        let positions: Vec<usize> = ["<series_animedb_id>30<", "<series_animedb_id>10<", "<series_animedb_id>20<"]
            .iter()
            .map(|needle| document.find(needle).expect("id present"))
            .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(document.contains("<series_title>Second</series_title>"));
        assert!(document.contains("<user_name>someone</user_name>"));
        assert!(document.contains("<my_status>Completed</my_status>"));
    }

    #[test]
    fn test_serialize_is_deterministic_and_indented() {
        let targets = vec![target(1, "A & B <Movie>")];
        let first = serialize(&targets, "someone").expect("document should build");
        let second = serialize(&targets, "someone").expect("document should build");

        assert_eq!(first, second);
        assert!(first.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(first.contains("\n    <myinfo>"));
        assert!(first.contains("\n        <series_title>A &amp; B &lt;Movie&gt;</series_title>"));
    }

    #[test]
    fn test_serialize_with_no_items_has_only_metadata() {
        let document = serialize(&[], "someone").expect("document should build");
        assert_eq!(document.matches("<anime>").count(), 0);
        assert!(document.contains("<user_export_type>1</user_export_type>"));
    }

    #[test]
    fn test_save_writes_requester_named_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = save("<x/>", &dir.path().join("out"), "someone").expect("save should work");

        assert!(path.ends_with("someone_mal_import.xml"));
        assert_eq!(std::fs::read_to_string(path).expect("readable"), "<x/>");
    }
}
