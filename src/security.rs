use std::path::{Component, Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::ToolError;

const SENSITIVE_KEYS: [&str; 6] = [
    "db_password",
    "password",
    "admin_passwd",
    "api_key",
    "secret",
    "token",
];

pub const MASKED: &str = "***MASKED***";

/// Rejects traversal and relative paths, then resolves symlinks along the
/// longest existing prefix so the returned path names the real target.
pub fn validate_path(raw: &str, allow_relative: bool) -> Result<PathBuf, ToolError> {
    if raw.trim().is_empty() {
        return Err(ToolError::invalid("Invalid path: Path cannot be empty"));
    }

    let path = Path::new(raw);
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ToolError::invalid("Invalid path: Path traversal not allowed"));
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else if allow_relative {
        std::env::current_dir()
            .map_err(|err| ToolError::failed(format!("Failed to resolve working directory: {err}")))?
            .join(path)
    } else {
        return Err(ToolError::invalid("Invalid path: Absolute path required"));
    };

    Ok(resolve_existing_prefix(&absolute))
}

fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut remainder = Vec::new();

    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut resolved = canonical;
            for part in remainder.iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }

        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                remainder.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

pub fn mask_sensitive_config(values: &Map<String, Value>) -> Map<String, Value> {
    values
        .iter()
        .map(|(key, value)| {
            let masked = match value {
                Value::Object(nested) => Value::Object(mask_sensitive_config(nested)),
                _ if is_sensitive(key) => {
                    if is_truthy(value) {
                        Value::String(MASKED.to_string())
                    } else {
                        Value::Null
                    }
                }
                _ => value.clone(),
            };
            (key.clone(), masked)
        })
        .collect()
}

fn is_sensitive(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|needle| lowered.contains(needle))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{mask_sensitive_config, validate_path, MASKED};

    #[test]
    fn rejects_traversal_empty_and_relative_paths() {
        assert!(validate_path("", false).is_err());
        assert!(validate_path("/var/../etc/passwd", false).is_err());
        let err = validate_path("relative/file.txt", false).expect_err("relative rejected");
        assert_eq!(err.to_string(), "Invalid path: Absolute path required");
    }

    #[test]
    fn resolves_symlinked_parent_for_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let real = dir.path().join("real");
        std::fs::create_dir(&real).expect("mkdir");
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).expect("symlink");

        let resolved =
            validate_path(&link.join("new.txt").display().to_string(), false).expect("valid");
        assert_eq!(
            resolved,
            real.canonicalize().expect("canonical").join("new.txt")
        );
    }

    #[test]
    fn masks_sensitive_keys_recursively() {
        let input = json!({
            "db_host": "localhost",
            "db_password": "hunter2",
            "admin_passwd": "",
            "smtp": {"smtp_password": "x", "smtp_port": 25},
            "API_KEY": "abc",
        });
        let Value::Object(map) = input else {
            panic!("object expected");
        };

        let masked = Value::Object(mask_sensitive_config(&map));
        assert_eq!(masked["db_host"], "localhost");
        assert_eq!(masked["db_password"], MASKED);
        assert_eq!(masked["admin_passwd"], Value::Null);
        assert_eq!(masked["smtp"]["smtp_password"], MASKED);
        assert_eq!(masked["smtp"]["smtp_port"], 25);
        assert_eq!(masked["API_KEY"], MASKED);
    }
}
