//! Folder names for torrents in the virtual tree.

use std::collections::HashSet;
use std::path::Path;

use crate::config::FolderNaming;
use crate::store::Torrent;

/// Name of the folder holding every visible torrent.
pub const ALL_FOLDER: &str = "__all__";

/// The preferred folder name of a torrent, before collision handling.
pub fn folder_name(torrent: &Torrent, naming: FolderNaming) -> String {
    let raw = match naming {
        FolderNaming::Id => return sanitize(&torrent.id, &torrent.id),
        FolderNaming::Original => torrent.name.as_str(),
        FolderNaming::OriginalNoExt => strip_single_file_ext(torrent),
    };
    sanitize(raw, &torrent.id)
}

/// A single-file torrent is usually named after its file; drop the file's
/// extension from the name in that case.
fn strip_single_file_ext(torrent: &Torrent) -> &str {
    let [file] = torrent.files.as_slice() else {
        return &torrent.name;
    };
    let ext = |s: &str| {
        Path::new(s)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    };
    match (ext(&torrent.name), ext(file.name())) {
        (Some(name_ext), Some(file_ext)) if name_ext == file_ext => {
            &torrent.name[..torrent.name.len() - name_ext.len() - 1]
        }
        _ => &torrent.name,
    }
}

fn sanitize(raw: &str, fallback: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => fallback.to_string(),
        _ => cleaned,
    }
}

/// Assigns unique folder names. Feed torrents in id order: the first
/// torrent keeps a contested name and later ones get ` (<id>)` appended.
#[derive(Debug, Default)]
pub struct FolderNamer {
    taken: HashSet<String>,
}

impl FolderNamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, torrent: &Torrent, naming: FolderNaming) -> String {
        let preferred = folder_name(torrent, naming);
        let name = if self.taken.contains(&preferred) || preferred == ALL_FOLDER {
            format!("{} ({})", preferred, torrent.id)
        } else {
            preferred
        };
        self.taken.insert(name.clone());
        name
    }
}
