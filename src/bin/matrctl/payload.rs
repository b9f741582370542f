//! Payload construction from the `run-code` flags.

use std::path::Path;

use matryoshka::runner::{sort_files_by_depth, Payload, PayloadFile};
use stacked_errors::{bail, Result, StackableErr};
use uuid::Uuid;

use crate::RunCodeArgs;

/// Assembles the payload from `-data`, or from `-language` plus one of
/// `-filepath`, `-directory`, `-content`. The timeout flag and any hook
/// commands apply either way.
pub fn build_payload(args: &RunCodeArgs) -> Result<Payload> {
    let mut payload = if let Some(data) = args.data.as_deref() {
        parse_data_payload(data)?
    } else if let Some(language) = args
        .language
        .as_deref()
        .filter(|_| args.filepath.is_some() || args.directory.is_some() || args.content.is_some())
    {
        let mut payload = Payload {
            language: language.to_owned(),
            ..Default::default()
        };
        if let Some(filepath) = args.filepath.as_deref() {
            payload.files.push(parse_file_payload(filepath)?);
        } else if let Some(directory) = args.directory.as_deref() {
            payload.files = parse_directory_payload(directory)?;
        } else if let Some(content) = args.content.as_deref() {
            payload
                .files
                .push(parse_content_payload(&payload.language, content));
        }
        payload
    } else {
        bail!("payload data is required")
    };

    if let Some(os) = args.os.as_deref() {
        payload.operating_system = os.to_owned();
    }
    if let Some(arch) = args.arch.as_deref() {
        payload.architecture = arch.to_owned();
    }
    payload.timeout = args.timeout;
    payload
        .pre_build_commands
        .extend(args.pre_build_commands.iter().cloned());
    payload
        .post_build_commands
        .extend(args.post_build_commands.iter().cloned());
    payload
        .pre_run_commands
        .extend(args.pre_run_commands.iter().cloned());
    payload
        .post_run_commands
        .extend(args.post_run_commands.iter().cloned());
    Ok(payload)
}

/// Parses inline JSON payload data; an `@path` prefix means read the JSON
/// from that file instead.
pub fn parse_data_payload(data: &str) -> Result<Payload> {
    let contents = match data.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .stack_err_with(|| format!("failed to read file '{path}'"))?,
        None => data.to_owned(),
    };
    serde_json::from_str(&contents).stack_err("failed to parse payload")
}

/// Reads one file into a payload record named after its basename.
pub fn parse_file_payload(filepath: &str) -> Result<PayloadFile> {
    let content = std::fs::read_to_string(filepath)
        .stack_err_with(|| format!("failed to read file '{filepath}'"))?;
    let name = Path::new(filepath)
        .file_name()
        .stack_err_with(|| format!("'{filepath}' has no file name"))?
        .to_string_lossy()
        .into_owned();
    Ok(PayloadFile {
        name,
        path: String::new(),
        content,
    })
}

/// Wraps inline code in a record with a generated `<random32>.<language>`
/// file name.
pub fn parse_content_payload(language: &str, content: &str) -> PayloadFile {
    PayloadFile {
        name: format!("{}.{}", Uuid::new_v4().simple(), language),
        path: String::new(),
        content: content.to_owned(),
    }
}

/// Walks a directory tree and emits one record per regular file. Paths are
/// kept relative to the *parent* of the supplied directory, so the top
/// directory name prefixes every record, and records are ordered by
/// ancestor depth, shallowest first.
pub fn parse_directory_payload(directory: &str) -> Result<Vec<PayloadFile>> {
    let root = Path::new(directory);
    let parent = root.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
    let mut files = Vec::new();
    visit_directory(root, &parent, &mut files)?;
    sort_files_by_depth(&mut files);
    Ok(files)
}

fn visit_directory(dir: &Path, parent: &Path, files: &mut Vec<PayloadFile>) -> Result<()> {
    let entries =
        std::fs::read_dir(dir).stack_err_with(|| format!("failed to read directory {dir:?}"))?;
    for entry in entries {
        let entry = entry.stack()?;
        let path = entry.path();
        let file_type = entry.file_type().stack()?;
        if file_type.is_dir() {
            visit_directory(&path, parent, files)?;
        } else if file_type.is_file() {
            let content = std::fs::read_to_string(&path)
                .stack_err_with(|| format!("failed to read file {path:?}"))?;
            let rel_dir = path
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .strip_prefix(parent)
                .unwrap_or_else(|_| Path::new(""));
            let mut rel = rel_dir.to_string_lossy().into_owned();
            if !rel.is_empty() && !rel.ends_with('/') {
                rel.push('/');
            }
            files.push(PayloadFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: rel,
                content,
            });
        }
    }
    Ok(())
}
