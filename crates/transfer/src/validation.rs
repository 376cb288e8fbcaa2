use std::path::{Component, Path};

use crate::TransferError;

/// Validates that a relative file path does not escape its base directory.
///
/// Rejects empty paths, absolute paths, `..` components and Windows
/// prefixes (`C:`, `\\server`). Backslashes are treated as separators so a
/// Windows runner cannot smuggle `..\` past a Unix master.
pub fn validate_upload_path(file_path: &str) -> Result<(), TransferError> {
    check(file_path, "path")
}

/// Validates an upload directory name such as `Project/Windows64`.
pub fn validate_directory_name(name: &str) -> Result<(), TransferError> {
    check(name, "directory")
}

fn check(value: &str, what: &str) -> Result<(), TransferError> {
    if value.is_empty() {
        return Err(TransferError::InvalidPath(format!("empty {what}")));
    }
    if value.contains('\0') {
        return Err(TransferError::InvalidPath(format!("NUL byte in {what}: {value:?}")));
    }

    let normalized = value.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(TransferError::InvalidPath(format!(
            "absolute {what} not allowed: {value}"
        )));
    }
    // Drive letters are only a prefix component on Windows; reject them everywhere.
    let bytes = normalized.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(TransferError::InvalidPath(format!(
            "drive prefix not allowed: {value}"
        )));
    }

    for component in Path::new(&normalized).components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {value}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute {what} not allowed: {value}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_path() {
        assert!(validate_upload_path("").is_err());
        assert!(validate_directory_name("").is_err());
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        assert!(validate_upload_path("../../../etc/passwd").is_err());
        assert!(validate_upload_path("sub/../../../escape").is_err());
        assert!(validate_upload_path("..").is_err());
    }

    #[test]
    fn rejects_backslash_traversal() {
        assert!(validate_upload_path("..\\..\\boot.ini").is_err());
        assert!(validate_directory_name("P\\..\\..").is_err());
    }

    #[test]
    fn rejects_absolute_paths() {
        assert!(validate_upload_path("/tmp/malicious").is_err());
        assert!(validate_upload_path("\\\\server\\share").is_err());
        assert!(validate_directory_name("/srv/builds").is_err());
    }

    #[test]
    fn rejects_drive_prefix() {
        assert!(validate_upload_path("C:\\Windows\\evil").is_err());
        assert!(validate_upload_path("d:/data").is_err());
    }

    #[test]
    fn accepts_nested_paths() {
        assert!(validate_upload_path("Game.exe").is_ok());
        assert!(validate_upload_path("Game_Data/Managed/Assembly.dll").is_ok());
        assert!(validate_upload_path("./Game.exe").is_ok());
        assert!(validate_upload_path(".config/settings.json").is_ok());
        assert!(validate_directory_name("Project/Windows64").is_ok());
    }
}
