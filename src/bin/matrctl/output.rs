//! Plain and JSON rendering for the CLI.

use chrono::SecondsFormat;
use matryoshka::{runner::RunResult, ImageSummary};
use serde::Serialize;
use stacked_errors::{Result, StackableErr};

/// Formats a byte count in base-1000 SI units, one fractional digit above
/// 1 kB.
pub fn format_size(size: i64) -> String {
    const UNIT: i64 = 1000;
    if size < UNIT {
        return format!("{size} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = size / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!(
        "{:.1} {}B",
        size as f64 / div as f64,
        ["k", "M", "G", "T", "P", "E"][exp]
    )
}

/// Pretty-prints any serializable value with four-space indent.
pub fn render_json<T: Serialize>(value: &T) -> Result<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value
        .serialize(&mut serializer)
        .stack_err("failed to render JSON output")?;
    String::from_utf8(buf).stack()
}

/// One `key=value` line per field, image blocks separated by a blank line.
pub fn render_images_plain(images: &[ImageSummary]) -> String {
    let mut out = String::new();
    for image in images {
        out += &format!("ID={}\n", image.short_id());
        out += &format!("Repository={}\n", image.repository);
        out += &format!("Tag={}\n", image.tag);
        out += &format!(
            "CreatedAt={}\n",
            image.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        out += &format!("Size={}\n", format_size(image.size));
        out.push('\n');
    }
    out
}

/// Transcript blocks in pipeline order, in the same `key=value` shape as the
/// image listing.
pub fn render_result_plain(result: &RunResult) -> String {
    let mut out = String::new();
    for transcript in result.build_commands.iter().chain(&result.run_commands) {
        out += &format!("Command={}\n", transcript.command);
        out += &format!("Stdout={}\n", transcript.stdout);
        out += &format!("Stderr={}\n", transcript.stderr);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use matryoshka::runner::CommandTranscript;

    use super::*;

    fn test_image() -> ImageSummary {
        ImageSummary {
            id: "1a2b3c4d5e6f7890".to_owned(),
            repository: "matryoshka/test".to_owned(),
            tag: "debian-amd64".to_owned(),
            created_at: DateTime::parse_from_rfc3339("2011-03-02T22:11:00Z")
                .unwrap()
                .with_timezone(&Utc),
            size: 630_600_000,
        }
    }

    #[test]
    fn sizes_use_si_units() {
        assert_eq!(format_size(100), "100 B");
        assert_eq!(format_size(1000), "1.0 kB");
        assert_eq!(format_size(1_000_000), "1.0 MB");
        assert_eq!(format_size(1_000_000_000), "1.0 GB");
        assert_eq!(format_size(630_600_000), "630.6 MB");
    }

    #[test]
    fn plain_image_blocks_are_key_value_lines() {
        assert_eq!(
            render_images_plain(&[test_image()]),
            "ID=1a2b3c4d5e6f\nRepository=matryoshka/test\nTag=debian-amd64\n\
             CreatedAt=2011-03-02T22:11:00Z\nSize=630.6 MB\n\n"
        );
    }

    #[test]
    fn plain_result_blocks_follow_pipeline_order() {
        let result = RunResult {
            build_commands: vec![CommandTranscript {
                command: "make -C src".to_owned(),
                stdout: "cc -o a.out main.c\n".to_owned(),
                stderr: String::new(),
            }],
            run_commands: vec![CommandTranscript {
                command: "src/a.out".to_owned(),
                stdout: "hi\n".to_owned(),
                stderr: String::new(),
            }],
            error: String::new(),
        };
        let rendered = render_result_plain(&result);
        assert!(rendered.starts_with("Command=make -C src\n"));
        let build_at = rendered.find("make -C src").unwrap();
        let run_at = rendered.find("src/a.out").unwrap();
        assert!(build_at < run_at);
    }

    #[test]
    fn json_output_uses_four_space_indent() {
        let rendered = render_json(&vec![test_image()]).unwrap();
        assert!(rendered.starts_with("[\n    {\n        \"id\""));
    }
}
