//! Where Lectern stores its own data (config and the persisted vector store).
//!
//! Source documents stay wherever the user keeps them. Only app state lives here.

use std::path::PathBuf;

const STORE_DIR: &str = "store";

/// Returns the directory where Lectern stores config and the vector store.
/// On macOS: `~/Library/Application Support/Lectern/`.
/// Creates the directory if it doesn't exist; returns `None` if we can't determine the path.
pub fn app_data_dir() -> Option<PathBuf> {
    let dir = directories::ProjectDirs::from("app", "Lectern", "Lectern")?.data_local_dir().to_path_buf();
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir)
}

/// Directory backing the file key-value medium that holds the persisted store.
pub fn store_dir() -> Option<PathBuf> {
    Some(app_data_dir()?.join(STORE_DIR))
}
