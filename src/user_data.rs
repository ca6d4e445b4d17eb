//! Loading of cloud-init user data and playbook paths given on the command
//! line.
//!
//! Files are read through `cap-std`, relative to the working directory unless
//! absolute. A leading `~/` is expanded first.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use crate::settings::expand_tilde;

/// Errors raised while reading a user-data file.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum UserDataError {
    /// The path is empty or only whitespace.
    #[error("user-data file path must not be empty")]
    PathEmpty,
    /// The file holds nothing but whitespace.
    #[error("user-data file `{path}` is empty")]
    Empty {
        /// Expanded path of the file.
        path: String,
    },
    /// The file could not be read.
    #[error("failed to read user-data file `{path}`: {message}")]
    Read {
        /// Expanded path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

/// Reads the user data in `file`, if one was given.
///
/// The payload is returned unmodified; it is encoded only when submitted.
///
/// # Errors
///
/// Returns [`UserDataError`] when the path is blank, the file cannot be read,
/// or it is empty.
pub fn load_user_data(file: Option<&str>) -> Result<Option<String>, UserDataError> {
    let Some(path) = file else {
        return Ok(None);
    };
    if path.trim().is_empty() {
        return Err(UserDataError::PathEmpty);
    }

    let expanded = expand_tilde(path);
    let content = read_to_string_ambient(&expanded).map_err(|message| UserDataError::Read {
        path: expanded.clone(),
        message,
    })?;
    if content.trim().is_empty() {
        return Err(UserDataError::Empty { path: expanded });
    }
    Ok(Some(content))
}

/// Expands `~/` in an operator-supplied path.
#[must_use]
pub fn operator_path(path: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(expand_tilde(path))
}

fn read_to_string_ambient(path: &str) -> Result<String, String> {
    let path_buf = Utf8Path::new(path);

    let (dir_path, file_path) = if path_buf.is_absolute() {
        let parent = path_buf
            .parent()
            .ok_or_else(|| format!("path has no parent directory: {path_buf}"))?;
        let file_name = path_buf
            .file_name()
            .ok_or_else(|| format!("path has no file name: {path_buf}"))?;
        (parent, Utf8Path::new(file_name))
    } else {
        (Utf8Path::new("."), path_buf)
    };

    let dir =
        Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(file_path).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn write_temp(contents: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("user-data");
        std::fs::write(&path, contents).expect("write user data");
        let rendered = path.to_str().expect("utf8 temp path").to_owned();
        (dir, rendered)
    }

    #[rstest]
    fn absent_file_yields_no_user_data() {
        assert_eq!(load_user_data(None), Ok(None));
    }

    #[rstest]
    fn file_contents_are_returned_verbatim() {
        let (_dir, path) = write_temp("#cloud-config\npackages: [git]\n");
        assert_eq!(
            load_user_data(Some(&path)),
            Ok(Some(String::from("#cloud-config\npackages: [git]\n")))
        );
    }

    #[rstest]
    #[case("   ")]
    #[case("")]
    fn blank_paths_are_rejected(#[case] path: &str) {
        assert_eq!(load_user_data(Some(path)), Err(UserDataError::PathEmpty));
    }

    #[rstest]
    fn whitespace_only_file_is_rejected() {
        let (_dir, path) = write_temp(" \n\t\n");
        assert!(matches!(
            load_user_data(Some(&path)),
            Err(UserDataError::Empty { .. })
        ));
    }

    #[rstest]
    fn missing_file_reports_its_path() {
        let err = load_user_data(Some("/nonexistent/novaspawn/user-data"))
            .expect_err("file is missing");
        assert!(matches!(
            err,
            UserDataError::Read { ref path, .. } if path == "/nonexistent/novaspawn/user-data"
        ));
    }
}
