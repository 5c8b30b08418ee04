use atw_core::ports::{FileGlobber, PortError};
use globset::GlobBuilder;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// `FileGlobber` over the real filesystem: glob patterns are matched against
/// paths relative to the walk root.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobsetFileGlobber;

impl FileGlobber for GlobsetFileGlobber {
    fn glob(&self, pattern: &str, root: &Path) -> Result<Vec<PathBuf>, PortError> {
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(false)
            .build()
            .map_err(|err| PortError::new(format!("invalid glob {pattern}: {err}")))?
            .compile_matcher();

        let mut matches = Vec::new();
        for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            if matcher.is_match(relative) {
                matches.push(entry.path().to_path_buf());
            }
        }
        matches.sort();
        Ok(matches)
    }
}
