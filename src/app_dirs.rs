use directories::ProjectDirs;
use std::path::PathBuf;

/// Centralized application directory resolution
pub struct AppDirs;

impl AppDirs {
    /// Default location of the progress database
    pub fn db_path() -> Option<PathBuf> {
        if let Ok(home) = std::env::var("HOME") {
            let state_dir = PathBuf::from(home)
                .join(".local")
                .join("state")
                .join("tingxie");
            Some(state_dir.join("progress.db"))
        } else {
            ProjectDirs::from("", "", "tingxie")
                .map(|proj_dirs| proj_dirs.data_local_dir().join("progress.db"))
        }
    }

    pub fn config_path() -> PathBuf {
        match ProjectDirs::from("", "", "tingxie") {
            Some(pd) => pd.config_dir().join("config.json"),
            None => PathBuf::from("tingxie_config.json"),
        }
    }
}
