use serde::{Deserialize, Serialize};

/// Run timeout applied when a payload does not ask for one, in seconds.
pub const DEFAULT_RUN_TIMEOUT: i64 = 30;

/// One unit of work for the agent: a programming language, the source files
/// to unpack, the image selectors, and optional per-stage command hooks.
///
/// The first element of `files` is the entry file; its directory becomes the
/// `{entry_dir}` of the command templates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub language: String,
    pub files: Vec<PayloadFile>,

    // together these select the image tag `<os>-<arch>`
    #[serde(default)]
    pub operating_system: String,
    #[serde(default)]
    pub architecture: String,

    /// Wall-clock limit for each run-side command, in seconds. Values below 1
    /// fall back to [DEFAULT_RUN_TIMEOUT].
    #[serde(default)]
    pub timeout: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_build_commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_build_commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_run_commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_run_commands: Vec<String>,
}

/// The content and placement of one file in a [Payload].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadFile {
    /// Basename of the file, no separators.
    pub name: String,
    /// Directory relative to the unpack root, may be empty or end in `/`.
    #[serde(default)]
    pub path: String,
    pub content: String,
}

impl PayloadFile {
    /// Number of directory components in `path`.
    pub fn depth(&self) -> usize {
        self.path.split('/').filter(|part| !part.is_empty()).count()
    }
}

/// A [Payload] that cannot be unpacked safely.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidPayload {
    #[error("payload has no files")]
    NoFiles,
    #[error("file name \"{0}\" is empty or contains path separators")]
    BadFileName(String),
    #[error("file path \"{0}\" escapes the unpack root")]
    BadFilePath(String),
}

impl Payload {
    /// Checks the file-record invariants before anything touches the
    /// filesystem: at least one file, basenames without separators, and
    /// relative paths that stay under the unpack root.
    pub fn validate(&self) -> Result<(), InvalidPayload> {
        if self.files.is_empty() {
            return Err(InvalidPayload::NoFiles);
        }
        for file in &self.files {
            if file.name.is_empty() || file.name.contains(['/', '\\']) {
                return Err(InvalidPayload::BadFileName(file.name.clone()));
            }
            let path = &file.path;
            if path.starts_with('/')
                || path.contains('\\')
                || path.split('/').any(|part| part == "..")
            {
                return Err(InvalidPayload::BadFilePath(path.clone()));
            }
        }
        Ok(())
    }

    /// The run timeout in whole seconds after applying the default.
    pub fn run_timeout_secs(&self) -> u64 {
        if self.timeout < 1 {
            DEFAULT_RUN_TIMEOUT as u64
        } else {
            self.timeout as u64
        }
    }
}

/// Orders file records by ancestor depth, shallowest first, then by path and
/// name so the order is stable for records at the same depth.
pub fn sort_files_by_depth(files: &mut [PayloadFile]) {
    files.sort_by(|a, b| {
        a.depth()
            .cmp(&b.depth())
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// One executed command: the exact line that ran and its captured streams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTranscript {
    pub command: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// What the agent sends back for one [Payload]: the ordered transcripts of
/// the build-side and run-side stages, and an `error` that is non-empty only
/// when the pipeline or the agent itself failed. A command exiting non-zero
/// is reported through `error` *and* keeps its transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    #[serde(default)]
    pub build_commands: Vec<CommandTranscript>,
    #[serde(default)]
    pub run_commands: Vec<CommandTranscript>,
    #[serde(default)]
    pub error: String,
}

impl RunResult {
    pub fn from_error(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Default::default()
        }
    }

    /// Whether this carries no information at all. The orchestrator uses this
    /// to discard structurally-valid JSON lines that are not results.
    pub fn is_empty(&self) -> bool {
        self.build_commands.is_empty() && self.run_commands.is_empty() && self.error.is_empty()
    }
}
