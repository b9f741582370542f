use std::path::{Path, PathBuf};
use std::time::Duration;

use stacked_errors::{Result, StackableErr};
use tokio::{
    fs::{DirBuilder, OpenOptions},
    io::{stdin, stdout, AsyncBufReadExt, AsyncWriteExt, BufReader},
    signal::unix::{signal, SignalKind},
};
use tracing::{debug, error};
use uuid::Uuid;

use crate::runner::{
    parse_language, run_pipeline, Payload, PayloadFile, RunResult, TemplateContext,
};

/// Where one bundle's files landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedTree {
    /// Absolute path of the `src` root the files were written under.
    pub src_root: PathBuf,
    /// Paths of the written files relative to the agent's working directory,
    /// in input order. The first entry is the entry file.
    pub files: Vec<PathBuf>,
}

impl UnpackedTree {
    /// The substitution context for this tree; `entry_dir` is the directory
    /// of the entry file.
    pub fn template_context(&self) -> TemplateContext {
        let entry_dir = self
            .files
            .first()
            .and_then(|file| file.parent())
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_default();
        TemplateContext {
            src_root: self.src_root.to_string_lossy().into_owned(),
            entry_dir,
        }
    }
}

/// Unpacks payload files into a freshly created private scratch tree rooted
/// at `<workdir>/tmp/<random32>/src/`. Directories are created with mode
/// 0700, files with mode 0644, contents verbatim. The scratch tree is never
/// cleaned up, the container around the agent is discarded instead.
pub async fn unpack_files(workdir: &Path, files: &[PayloadFile]) -> Result<UnpackedTree> {
    let src_root = workdir
        .join("tmp")
        .join(Uuid::new_v4().simple().to_string())
        .join("src");
    let mut written = Vec::with_capacity(files.len());
    for file in files {
        let dir = src_root.join(&file.path);
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)
            .await
            .stack_err_with(|| format!("failed to create directory {dir:?}"))?;
        let location = dir.join(&file.name);
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&location)
            .await
            .stack_err_with(|| format!("failed to create file {location:?}"))?;
        f.write_all(file.content.as_bytes())
            .await
            .stack_err_with(|| format!("failed to write file {location:?}"))?;
        f.flush()
            .await
            .stack_err_with(|| format!("failed to flush file {location:?}"))?;
        written.push(
            location
                .strip_prefix(workdir)
                .stack_err("written file landed outside the working directory")?
                .to_path_buf(),
        );
    }
    Ok(UnpackedTree { src_root, files: written })
}

/// Processes one line-delimited bundle: parse, unpack, resolve the language,
/// drive the pipeline. Failures of the agent itself come back as a result
/// with `error` populated, never as a process exit.
pub async fn run_bundle(workdir: &Path, line: &[u8]) -> RunResult {
    let payload: Payload = match serde_json::from_slice(line) {
        Ok(payload) => payload,
        Err(err) => return RunResult::from_error(err.to_string()),
    };
    if let Err(err) = payload.validate() {
        return RunResult::from_error(err.to_string());
    }
    let tree = match unpack_files(workdir, &payload.files).await {
        Ok(tree) => tree,
        Err(err) => return RunResult::from_error(format!("failed to unpack files: {err}")),
    };
    let definition = match parse_language(&payload.language) {
        Ok(definition) => definition,
        Err(err) => return RunResult::from_error(err.to_string()),
    };
    let run_timeout = Duration::from_secs(payload.run_timeout_secs());
    run_pipeline(definition, &tree.template_context(), &payload, run_timeout).await
}

/// Reads newline-delimited bundles from stdin and emits exactly one result
/// line per bundle on stdout, flushed immediately. In one-shot mode the
/// agent exits after the first bundle; in daemon mode it processes until
/// stdin closes or a termination signal arrives.
///
/// Nothing but result lines may be written to stdout, logging goes to
/// stderr.
pub async fn serve(once: bool) -> Result<()> {
    let workdir = std::env::current_dir().stack()?;
    let mut lines = BufReader::new(stdin()).lines();
    let mut sigterm = signal(SignalKind::terminate()).stack()?;
    let mut out = stdout();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.stack()?,
            _ = sigterm.recv() => {
                debug!("received termination signal");
                break
            }
        };
        let Some(line) = line else {
            // stdin closed
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        let result = run_bundle(&workdir, line.as_bytes()).await;
        if !result.error.is_empty() {
            error!("error running code: {}", result.error);
        }
        let mut encoded = serde_json::to_vec(&result).stack()?;
        encoded.push(b'\n');
        out.write_all(&encoded).await.stack()?;
        out.flush().await.stack()?;
        if once {
            break;
        }
    }
    Ok(())
}
