use std::{path::Path, process::Stdio, time::Duration};

use tokio::{io::AsyncReadExt, process::Command, time::timeout};

use crate::runner::{CommandTranscript, Payload, RunResult};

/// Fixed wall-clock ceiling for each build-side command.
pub const BUILD_STAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// The substitution points available to command templates. `src_root` is the
/// absolute path of the unpacked source tree; `entry_dir` is the directory of
/// the entry file, relative to the agent's working directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateContext {
    pub src_root: String,
    pub entry_dir: String,
}

impl TemplateContext {
    /// Substitutes `{src_root}` and `{entry_dir}` and trims surrounding
    /// whitespace. Lines without placeholders pass through untouched.
    pub fn expand(&self, template: &str) -> String {
        template
            .replace("{src_root}", &self.src_root)
            .replace("{entry_dir}", &self.entry_dir)
            .trim()
            .to_owned()
    }
}

/// How to build and run programs for one language label. The pipeline shape
/// is language-invariant; a language is only this record.
#[derive(Debug, Clone, Copy)]
pub struct LanguageDefinition {
    pub label: &'static str,
    /// Alternative labels accepted by [parse_language].
    pub aliases: &'static [&'static str],
    pub build_templates: &'static [&'static str],
    pub run_templates: &'static [&'static str],
    /// Extra environment passed to every command of a bundle. Kept on the
    /// child processes only, the agent's own environment is never mutated.
    pub env: fn(&TemplateContext) -> Vec<(String, String)>,
}

fn no_env(_: &TemplateContext) -> Vec<(String, String)> {
    Vec::new()
}

// GOPATH points at the nearest ancestor of the scratch tree named `src` so
// the standard `$GOPATH/src/...` layout resolves
fn go_env(context: &TemplateContext) -> Vec<(String, String)> {
    let mut dir = Some(Path::new(context.src_root.as_str()));
    while let Some(d) = dir {
        if d.file_name().is_some_and(|name| name == "src") {
            if let Some(parent) = d.parent() {
                return vec![("GOPATH".to_owned(), parent.to_string_lossy().into_owned())];
            }
        }
        dir = d.parent();
    }
    Vec::new()
}

pub const LANGUAGE_C: LanguageDefinition = LanguageDefinition {
    label: "c",
    aliases: &[],
    build_templates: &["make -f {src_root}/Makefile -C {entry_dir}"],
    run_templates: &["{entry_dir}/a.out"],
    env: no_env,
};

pub const LANGUAGE_GO: LanguageDefinition = LanguageDefinition {
    label: "go",
    aliases: &["golang"],
    build_templates: &["go build -o a.out ./{entry_dir}"],
    run_templates: &["./a.out"],
    env: go_env,
};

/// Every language the agent knows how to drive.
pub const LANGUAGES: &[LanguageDefinition] = &[LANGUAGE_C, LANGUAGE_GO];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown language: {0}")]
pub struct UnknownLanguage(pub String);

/// Resolves a label against the registry, case-insensitively.
pub fn parse_language(label: &str) -> Result<&'static LanguageDefinition, UnknownLanguage> {
    LANGUAGES
        .iter()
        .find(|def| {
            def.label.eq_ignore_ascii_case(label)
                || def.aliases.iter().any(|a| a.eq_ignore_ascii_case(label))
        })
        .ok_or_else(|| UnknownLanguage(label.to_owned()))
}

/// Renders a whole-second duration the way timeout errors report it.
pub(crate) fn format_secs(duration: Duration) -> String {
    format!("{}s", duration.as_secs())
}

/// Splits an expanded command line on ASCII spaces into program and args.
fn tokenize(line: &str) -> Option<(&str, Vec<&str>)> {
    let mut parts = line.split(' ').filter(|part| !part.is_empty());
    let program = parts.next()?;
    Some((program, parts.collect()))
}

fn exit_failure(status: std::process::ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_owned(),
    }
}

/// Runs one command line with a deadline, capturing both streams verbatim.
/// Returns the transcript and, on failure, the cause. A process still running
/// when the deadline fires is killed and reaped before this returns.
async fn execute(
    line: String,
    envs: &[(String, String)],
    deadline: Duration,
) -> (CommandTranscript, Option<String>) {
    let mut transcript = CommandTranscript {
        command: line.clone(),
        ..Default::default()
    };
    let Some((program, args)) = tokenize(&line) else {
        return (transcript, Some("empty command line".to_owned()));
    };
    let mut command = Command::new(program);
    command
        .args(&args)
        .envs(envs.iter().map(|(key, val)| (key, val)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => return (transcript, Some(err.to_string())),
    };
    // drain the pipes concurrently so a chatty process cannot fill them up
    // and stall ahead of the deadline
    let mut stdout_pipe = child.stdout.take().unwrap();
    let mut stderr_pipe = child.stderr.take().unwrap();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });
    let failure = match timeout(deadline, child.wait()).await {
        Ok(Ok(status)) if status.success() => None,
        Ok(Ok(status)) => Some(exit_failure(status)),
        Ok(Err(err)) => Some(err.to_string()),
        Err(_elapsed) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Some(format!(
                "execution timeout exceeded ({})",
                format_secs(deadline)
            ))
        }
    };
    transcript.stdout =
        String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
    transcript.stderr =
        String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();
    (transcript, failure)
}

/// Drives the six stages in fixed order, short-circuiting on the first
/// failing command:
///
/// ```text
/// pre_build[*] -> build[*] -> post_build[*] -> pre_run[*] -> run[*] -> post_run[*]
/// ```
///
/// Build-side transcripts land in `build_commands`, run-side transcripts in
/// `run_commands`. The failing command's transcript is kept and the stages
/// after it are skipped.
pub async fn run_pipeline(
    definition: &LanguageDefinition,
    context: &TemplateContext,
    payload: &Payload,
    run_timeout: Duration,
) -> RunResult {
    let envs = (definition.env)(context);
    let mut result = RunResult::default();

    let build_lines = payload
        .pre_build_commands
        .iter()
        .map(String::as_str)
        .chain(definition.build_templates.iter().copied())
        .chain(payload.post_build_commands.iter().map(String::as_str));
    for line in build_lines {
        let line = context.expand(line);
        if line.is_empty() {
            continue;
        }
        let (transcript, failure) = execute(line, &envs, BUILD_STAGE_TIMEOUT).await;
        result.build_commands.push(transcript);
        if let Some(cause) = failure {
            result.error = format!("Error while building: {cause}");
            return result;
        }
    }

    let run_lines = payload
        .pre_run_commands
        .iter()
        .map(String::as_str)
        .chain(definition.run_templates.iter().copied())
        .chain(payload.post_run_commands.iter().map(String::as_str));
    for line in run_lines {
        let line = context.expand(line);
        if line.is_empty() {
            continue;
        }
        let (transcript, failure) = execute(line, &envs, run_timeout).await;
        result.run_commands.push(transcript);
        if let Some(cause) = failure {
            result.error = format!("Error while running: {cause}");
            return result;
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> TemplateContext {
        TemplateContext {
            src_root: "/work/tmp/abc/src".to_owned(),
            entry_dir: "tmp/abc/src".to_owned(),
        }
    }

    #[test]
    fn parse_language_resolves_labels_and_aliases() {
        assert_eq!(parse_language("c").unwrap().label, "c");
        assert_eq!(parse_language("Go").unwrap().label, "go");
        assert_eq!(parse_language("Golang").unwrap().label, "go");
        let err = parse_language("rust").unwrap_err();
        assert_eq!(err.to_string(), "unknown language: rust");
    }

    #[test]
    fn expand_substitutes_and_trims() {
        let cx = context();
        assert_eq!(
            cx.expand("make -f {src_root}/Makefile -C {entry_dir}"),
            "make -f /work/tmp/abc/src/Makefile -C tmp/abc/src"
        );
        assert_eq!(cx.expand("  echo plain  "), "echo plain");
    }

    #[test]
    fn go_env_walks_up_to_src_parent() {
        let envs = go_env(&context());
        assert_eq!(envs, vec![("GOPATH".to_owned(), "/work/tmp/abc".to_owned())]);
    }

    #[tokio::test]
    async fn pipeline_runs_stages_in_order() {
        let definition = LanguageDefinition {
            label: "fake",
            aliases: &[],
            build_templates: &["echo build {entry_dir}"],
            run_templates: &["echo run"],
            env: no_env,
        };
        let payload = Payload {
            pre_build_commands: vec!["echo pre-build".to_owned()],
            post_build_commands: vec!["echo post-build".to_owned()],
            pre_run_commands: vec!["echo pre-run".to_owned()],
            post_run_commands: vec!["echo post-run".to_owned()],
            ..Default::default()
        };
        let result =
            run_pipeline(&definition, &context(), &payload, Duration::from_secs(5)).await;
        assert_eq!(result.error, "");
        let build: Vec<&str> = result
            .build_commands
            .iter()
            .map(|t| t.stdout.as_str())
            .collect();
        assert_eq!(build, ["pre-build\n", "build tmp/abc/src\n", "post-build\n"]);
        let run: Vec<&str> = result
            .run_commands
            .iter()
            .map(|t| t.stdout.as_str())
            .collect();
        assert_eq!(run, ["pre-run\n", "run\n", "post-run\n"]);
    }

    #[tokio::test]
    async fn pipeline_short_circuits_on_build_failure() {
        let definition = LanguageDefinition {
            label: "fake",
            aliases: &[],
            build_templates: &["false"],
            run_templates: &["echo never"],
            env: no_env,
        };
        let payload = Payload::default();
        let result =
            run_pipeline(&definition, &context(), &payload, Duration::from_secs(5)).await;
        assert_eq!(result.build_commands.len(), 1);
        assert_eq!(result.build_commands[0].command, "false");
        assert!(result.run_commands.is_empty());
        assert_eq!(result.error, "Error while building: exit status 1");
    }

    #[tokio::test]
    async fn pipeline_reports_run_timeout() {
        let definition = LanguageDefinition {
            label: "fake",
            aliases: &[],
            build_templates: &[],
            run_templates: &["sleep 5"],
            env: no_env,
        };
        let payload = Payload::default();
        let started = std::time::Instant::now();
        let result =
            run_pipeline(&definition, &context(), &payload, Duration::from_secs(1)).await;
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(result.run_commands.len(), 1);
        assert_eq!(result.run_commands[0].stdout, "");
        assert_eq!(
            result.error,
            "Error while running: execution timeout exceeded (1s)"
        );
    }

    #[tokio::test]
    async fn failed_command_keeps_captured_streams() {
        let definition = LanguageDefinition {
            label: "fake",
            aliases: &[],
            build_templates: &["cat {src_root}/definitely-missing"],
            run_templates: &[],
            env: no_env,
        };
        let payload = Payload::default();
        let result =
            run_pipeline(&definition, &context(), &payload, Duration::from_secs(5)).await;
        assert_eq!(result.build_commands.len(), 1);
        assert!(result.build_commands[0].stderr.contains("definitely-missing"));
        assert!(result.error.starts_with("Error while building: exit status"));
    }

    #[tokio::test]
    async fn missing_program_reports_spawn_error() {
        let definition = LanguageDefinition {
            label: "fake",
            aliases: &[],
            build_templates: &["definitely-not-a-program-zzz"],
            run_templates: &[],
            env: no_env,
        };
        let payload = Payload::default();
        let result =
            run_pipeline(&definition, &context(), &payload, Duration::from_secs(5)).await;
        assert_eq!(result.build_commands.len(), 1);
        assert_eq!(result.build_commands[0].stdout, "");
        assert!(result.error.starts_with("Error while building: "));
    }
}
