// ABOUTME: Input validation for sandbox requests
// ABOUTME: Rejects sandbox ids and generated file paths that could escape the sandbox root

use crate::types::{SandboxError, SandboxResult};
use std::path::{Component, Path};

const MAX_SANDBOX_ID_LEN: usize = 128;

/// Validates a sandbox id.
///
/// The id names the sandbox's project directory, so it must be non-empty, at most
/// 128 characters, and only contain ASCII alphanumerics, hyphens and underscores.
///
/// # Examples
///
/// ```
/// use appforge_preview::validation::validate_sandbox_id;
///
/// assert!(validate_sandbox_id("workflow-42").is_ok());
/// assert!(validate_sandbox_id("").is_err());
/// assert!(validate_sandbox_id("../etc").is_err());
/// ```
pub fn validate_sandbox_id(sandbox_id: &str) -> SandboxResult<()> {
    let reject = |reason: &str| {
        Err(SandboxError::InvalidSandboxId {
            sandbox_id: sandbox_id.to_string(),
            reason: reason.to_string(),
        })
    };

    if sandbox_id.is_empty() {
        return reject("Sandbox ID cannot be empty");
    }

    if sandbox_id.len() > MAX_SANDBOX_ID_LEN {
        return reject("Sandbox ID is longer than 128 characters");
    }

    if sandbox_id.contains("..") || sandbox_id.contains('/') || sandbox_id.contains('\\') {
        return reject("Sandbox ID cannot contain path traversal sequences (.. / \\)");
    }

    if !sandbox_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return reject(
            "Sandbox ID can only contain alphanumeric characters, hyphens, and underscores",
        );
    }

    Ok(())
}

/// Validates a generated file path relative to the project root.
///
/// Absolute paths, drive prefixes and `..` components are rejected so a generated
/// file can never be written outside its sandbox directory.
pub fn validate_relative_path(path: &str) -> SandboxResult<()> {
    let reject = |reason: &str| {
        Err(SandboxError::InvalidFilePath {
            path: path.to_string(),
            reason: reason.to_string(),
        })
    };

    if path.trim().is_empty() {
        return reject("File path cannot be empty");
    }

    if path.contains('\0') {
        return reject("File path contains a null byte");
    }

    let mut has_normal = false;
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) => has_normal = true,
            Component::CurDir => {}
            Component::ParentDir => return reject("File path cannot contain '..'"),
            Component::RootDir | Component::Prefix(_) => {
                return reject("File path must be relative to the project root")
            }
        }
    }

    if !has_normal {
        return reject("File path does not name a file");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_sandbox_ids() {
        assert!(validate_sandbox_id("s1").is_ok());
        assert!(validate_sandbox_id("workflow_123-abc").is_ok());
        assert!(validate_sandbox_id(&"a".repeat(128)).is_ok());
    }

    #[test]
    fn test_sandbox_id_path_traversal() {
        assert!(validate_sandbox_id("../../../etc/passwd").is_err());
        assert!(validate_sandbox_id("..\\windows").is_err());
        assert!(validate_sandbox_id("project/sub").is_err());
        assert!(validate_sandbox_id("..").is_err());
    }

    #[test]
    fn test_sandbox_id_rejects_special_characters() {
        assert!(validate_sandbox_id("").is_err());
        assert!(validate_sandbox_id("has space").is_err());
        assert!(validate_sandbox_id("semi;colon").is_err());
        assert!(validate_sandbox_id("line\nbreak").is_err());
        assert!(validate_sandbox_id("café").is_err());
        assert!(validate_sandbox_id(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_relative_paths_accepted() {
        assert!(validate_relative_path("app/page.tsx").is_ok());
        assert!(validate_relative_path("./components/Button.tsx").is_ok());
        assert!(validate_relative_path("README.md").is_ok());
    }

    #[test]
    fn test_escaping_paths_rejected() {
        assert!(validate_relative_path("").is_err());
        assert!(validate_relative_path("   ").is_err());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("../outside.txt").is_err());
        assert!(validate_relative_path("app/../../outside.txt").is_err());
        assert!(validate_relative_path(".").is_err());
    }

    #[test]
    fn test_error_variant_names_the_input() {
        match validate_relative_path("../x") {
            Err(SandboxError::InvalidFilePath { path, .. }) => assert_eq!(path, "../x"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
