use std::{
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tokio::{fs, io::AsyncWriteExt, task};

use super::parse_args;
use crate::{
    audit::AuditEntry,
    config_store::{ConfigStoreExt, MAX_READ_SIZE_MB, MAX_WRITE_SIZE_MB},
    context::ToolContext,
    error::ToolError,
    registry::{tool_def, Arguments, ToolDescriptor},
    security::validate_path,
};

pub fn read_file_def() -> ToolDescriptor {
    tool_def(
        "read_file",
        "Read the contents of a file on the host filesystem",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Absolute path to the file"},
                "encoding": {"type": "string", "enum": ["utf-8", "binary"], "default": "utf-8"},
                "offset": {"type": "integer", "description": "Line number to start from (1-based, 0 = start)", "default": 0},
                "limit": {"type": "integer", "description": "Maximum number of lines (0 = entire file)", "default": 0}
            },
            "required": ["path"]
        }),
    )
}

pub fn write_file_def() -> ToolDescriptor {
    tool_def(
        "write_file",
        "Write content to a file on the host filesystem",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Absolute path to the file"},
                "content": {"type": "string", "description": "Content to write (base64 when encoding is binary)"},
                "encoding": {"type": "string", "enum": ["utf-8", "binary"], "default": "utf-8"},
                "mode": {"type": "string", "enum": ["overwrite", "append"], "default": "overwrite"},
                "create_directories": {"type": "boolean", "default": true}
            },
            "required": ["path", "content"]
        }),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Utf8,
    Binary,
}

impl Encoding {
    fn parse(raw: &str) -> Result<Self, ToolError> {
        match raw.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "binary" => Ok(Self::Binary),
            other => Err(ToolError::invalid(format!(
                "Unsupported encoding: {other} (expected utf-8 or binary)"
            ))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Binary => "binary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WriteMode {
    Overwrite,
    Append,
}

impl WriteMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Overwrite => "overwrite",
            Self::Append => "append",
        }
    }
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn default_mode() -> WriteMode {
    WriteMode::Overwrite
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadFileArgs {
    path: String,
    #[serde(default = "default_encoding")]
    encoding: String,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WriteFileArgs {
    path: String,
    content: String,
    #[serde(default = "default_encoding")]
    encoding: String,
    #[serde(default = "default_mode")]
    mode: WriteMode,
    #[serde(default = "default_true")]
    create_directories: bool,
}

pub async fn read_file(ctx: ToolContext, args: Arguments) -> Result<Value, ToolError> {
    let args: ReadFileArgs = parse_args("read_file", args)?;
    ctx.check_rate_limit("file_read", 50, Duration::from_secs(60))?;

    let encoding = Encoding::parse(&args.encoding)?;
    let max_mb = ctx.params().get_u64(MAX_READ_SIZE_MB, 10);
    let max_bytes = ctx.params().get_megabytes(MAX_READ_SIZE_MB, 10);
    let path = validate_path(&args.path, false)?;

    let metadata = match fs::metadata(&path).await {
        Ok(metadata) => metadata,
        Err(_) => return Err(ToolError::failed(format!("File not found: {}", args.path))),
    };
    if !metadata.is_file() {
        return Err(ToolError::invalid(format!("Path is not a file: {}", args.path)));
    }
    let size_bytes = metadata.len();

    if encoding == Encoding::Binary && size_bytes > max_bytes {
        return Err(ToolError::invalid(format!(
            "File too large for binary read: {size_bytes} bytes (max {max_mb}MB)"
        )));
    }
    let bytes = fs::read(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let result = match encoding {
        Encoding::Binary => ReadOutcome {
            content: STANDARD.encode(&bytes),
            lines_returned: 0,
            total_lines: 0,
            truncated: false,
        },
        Encoding::Utf8 => {
            let text = String::from_utf8(bytes).map_err(|_| {
                ToolError::invalid(
                    "File encoding error. Try encoding='binary' for binary files.",
                )
            })?;
            slice_lines(&text, args.offset, args.limit, max_bytes)
        }
    };

    ctx.audit(
        AuditEntry::new("read_file")
            .field("path", &args.path)
            .field("size_bytes", size_bytes)
            .field("lines", result.lines_returned)
            .field("encoding", encoding.as_str()),
    )
    .await;

    Ok(json!({
        "path": path.display().to_string(),
        "content": result.content,
        "size_bytes": size_bytes,
        "lines_returned": result.lines_returned,
        "total_lines": result.total_lines,
        "truncated": result.truncated,
        "encoding": encoding.as_str(),
    }))
}

#[derive(Debug, PartialEq, Eq)]
struct ReadOutcome {
    content: String,
    lines_returned: usize,
    total_lines: usize,
    truncated: bool,
}

/// Applies a 1-based line offset and a line limit (0 = unbounded), then caps
/// the joined content at `max_bytes` on a character boundary.
fn slice_lines(text: &str, offset: usize, limit: usize, max_bytes: u64) -> ReadOutcome {
    let lines = text.split_inclusive('\n').collect::<Vec<_>>();
    let total_lines = lines.len();

    let start = offset.saturating_sub(1).min(total_lines);
    let mut selected = &lines[start..];
    let mut truncated = false;
    if limit > 0 && selected.len() > limit {
        selected = &selected[..limit];
        truncated = true;
    }

    let mut content = selected.concat();
    let cap = usize::try_from(max_bytes).unwrap_or(usize::MAX);
    if content.len() > cap {
        let mut cut = cap;
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        content.truncate(cut);
        truncated = true;
    }

    ReadOutcome {
        content,
        lines_returned: selected.len(),
        total_lines,
        truncated,
    }
}

pub async fn write_file(ctx: ToolContext, args: Arguments) -> Result<Value, ToolError> {
    let args: WriteFileArgs = parse_args("write_file", args)?;
    ctx.check_rate_limit("file_write", 30, Duration::from_secs(60))?;

    let encoding = Encoding::parse(&args.encoding)?;
    let max_mb = ctx.params().get_u64(MAX_WRITE_SIZE_MB, 50);
    let max_bytes = ctx.params().get_megabytes(MAX_WRITE_SIZE_MB, 50);
    let path = validate_path(&args.path, false)?;

    let payload = match encoding {
        Encoding::Binary => STANDARD
            .decode(args.content.trim())
            .map_err(|err| ToolError::invalid(format!("Invalid base64 content: {err}")))?,
        Encoding::Utf8 => args.content.clone().into_bytes(),
    };
    if payload.len() as u64 > max_bytes {
        return Err(ToolError::invalid(format!(
            "Content too large: {} bytes (max {max_mb}MB)",
            payload.len()
        )));
    }

    let created = !fs::try_exists(&path).await.unwrap_or(false);
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| ToolError::invalid("Invalid path: no parent directory"))?;
    if args.create_directories {
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let bytes_written = payload.len();
    match args.mode {
        WriteMode::Append if !created => append(&path, &payload).await?,
        _ => replace_atomically(path.clone(), parent, payload).await?,
    }

    ctx.audit(
        AuditEntry::new("write_file")
            .field("path", &args.path)
            .field("bytes", bytes_written)
            .field("mode", args.mode.as_str())
            .field("created", created),
    )
    .await;

    Ok(json!({
        "path": path.display().to_string(),
        "bytes_written": bytes_written,
        "created": created,
    }))
}

async fn append(path: &Path, payload: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open {} for append", path.display()))?;
    file.write_all(payload)
        .await
        .with_context(|| format!("Failed to append to {}", path.display()))?;
    file.flush().await?;
    Ok(())
}

/// Writes into a sibling temp file and renames it over `path`, so readers
/// see either the old or the new content.
async fn replace_atomically(path: PathBuf, dir: PathBuf, payload: Vec<u8>) -> anyhow::Result<()> {
    task::spawn_blocking(move || -> anyhow::Result<()> {
        let mut temp = NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        temp.write_all(&payload)
            .with_context(|| format!("Failed writing temp file for {}", path.display()))?;
        temp.as_file().sync_all()?;
        temp.persist(&path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    })
    .await
    .context("File write task failed")?
}
