//! Read-only virtual filesystem over the torrent store.
//!
//! ```text
//! /
//! /__all__/<folder>/<file path>      every visible torrent
//! /<custom directory>/<folder>/...   torrents matching its filters
//! ```

mod index;
mod naming;
mod types;

pub use index::{DirListing, VirtualFs};
pub use naming::{folder_name, FolderNamer, ALL_FOLDER};
pub use types::{DirEntry, FileStream, VfsError};
