//! Markdown summary of the artifacts under a crash output directory.
use crate::crash::DetectionKind;
use regex::Regex;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::LazyLock;

pub const NO_ISSUES: &str =
    "No crashes, filesystem corruption issues, or kernel warnings were detected on this run.";

static ANSI_ESCAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").unwrap());

const DECODED: &str = ".decoded";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    pub kind: DetectionKind,
    pub file: String,
    pub content: String,
}

/// Strip terminal escapes and non-printable characters; drop blank lines.
pub fn clean_lines(text: &str) -> String {
    text.lines()
        .map(|line| {
            ANSI_ESCAPE_RE
                .replace_all(line, "")
                .chars()
                .filter(|c| *c == '\t' || (' '..='~').contains(c))
                .collect::<String>()
        })
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn classify(name: &str) -> Option<(DetectionKind, bool)> {
    let (stem, ext) = name.rsplit_once('.')?;
    let kind = match ext {
        "crash" => DetectionKind::Crash,
        "corruption" => DetectionKind::Corruption,
        "warning" => DetectionKind::Warning,
        _ => return None,
    };
    Some((kind, stem.ends_with(DECODED)))
}

/// Artifacts of one host, sorted by name. A decoded artifact stands in for
/// its raw counterpart.
pub fn collect_host_logs(host_dir: &Path) -> std::io::Result<Vec<ReportEntry>> {
    let mut names: Vec<String> = std::fs::read_dir(host_dir)?
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    let superseded: HashSet<String> = names
        .iter()
        .filter_map(|name| match classify(name)? {
            (DetectionKind::Warning, _) | (_, false) => None,
            (_, true) => Some(name.replacen(DECODED, "", 1)),
        })
        .collect();

    let mut entries = Vec::new();
    for name in names {
        let Some((kind, _)) = classify(&name) else {
            continue;
        };
        if superseded.contains(&name) {
            continue;
        }
        let bytes = std::fs::read(host_dir.join(&name))?;
        entries.push(ReportEntry {
            kind,
            content: clean_lines(&String::from_utf8_lossy(&bytes)),
            file: name,
        });
    }
    Ok(entries)
}

/// Render the report for every host directory under `dir`.
pub fn render_report(dir: &Path) -> std::io::Result<String> {
    if !dir.exists() {
        return Ok(format!("{NO_ISSUES}\n"));
    }

    let mut hosts: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    hosts.sort();

    let mut out = String::from("# Kernel crash report summary\n\n");
    for host_dir in hosts {
        let entries = collect_host_logs(&host_dir)?;
        if entries.is_empty() {
            continue;
        }
        let host = host_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let _ = writeln!(out, "## Host: {host}\n");
        for entry in entries {
            let tag = entry.kind.extension().to_uppercase();
            let _ = writeln!(out, "### [{tag}] {}", entry.file);
            let _ = writeln!(out, "```\n{}\n```\n", entry.content);
        }
    }
    Ok(out)
}
