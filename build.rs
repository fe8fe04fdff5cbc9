use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const FORBIDDEN_WORDS: &[&str] = &[
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

// Directories that hold no project sources.
const SKIPPED_DIRS: &[&str] = &["./target", "./examples"];

/// One source-hygiene rule: a line regex plus a filter that decides whether a
/// matching line is a real violation.
struct Check {
    title: &'static str,
    pattern: String,
    include_build_script: bool,
    is_violation: fn(&str) -> bool,
    advice: &'static str,
}

/// Collects the violating lines of a single file.
struct LineCollector {
    path: PathBuf,
    is_violation: fn(&str) -> bool,
    hits: Vec<String>,
}

impl Sink for LineCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.is_violation)(line) {
            let number = mat.line_number().unwrap_or(0);
            self.hits.push(format!("{number}:{line}"));
        }
        Ok(true)
    }
}

impl LineCollector {
    fn report(&self, check: &Check) -> Option<String> {
        if self.hits.is_empty() {
            return None;
        }
        let mut message = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.hits.len(),
            check.title,
            self.path.display()
        );
        for hit in &self.hits {
            message.push_str(&format!("   {hit}\n"));
        }
        message.push_str(&format!("\n⚠️ {}\n", check.advice));
        Some(message)
    }
}

fn is_comment_line(line: &str) -> bool {
    line.trim_start().starts_with("//") || line.contains("/*")
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///")
}

fn underscore_in_code(line: &str) -> bool {
    if is_comment_line(line) && !line.contains("*/match") && !line.contains("*/let") {
        return false;
    }
    // Odd segments between quotes are string contents.
    let quoted = line
        .split('"')
        .enumerate()
        .any(|(index, part)| index % 2 == 1 && part.contains('_'));
    !quoted
}

fn forbidden_word(line: &str) -> bool {
    FORBIDDEN_WORDS.iter().any(|word| line.contains(word))
}

fn stars_outside_docs(line: &str) -> bool {
    !(is_doc_comment(line) && !forbidden_word(line))
}

fn comment_body(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///") {
        return Some(rest.trim());
    }
    if let Some(rest) = trimmed.strip_prefix("//") {
        return Some(rest.trim());
    }
    let start = line.find("/*")? + 2;
    let tail = &line[start..];
    Some(match tail.find("*/") {
        Some(end) => tail[..end].trim(),
        None => tail.trim(),
    })
}

fn shouting_comment(line: &str) -> bool {
    let Some(body) = comment_body(line) else {
        return false;
    };
    let mut letters = body.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

fn always(_: &str) -> bool {
    true
}

fn checks() -> Vec<Check> {
    vec![
        Check {
            title: "underscore-prefixed identifiers",
            pattern: r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            include_build_script: true,
            is_violation: underscore_in_code,
            advice: "Underscore-prefixed names are not allowed. Use the binding or remove it.",
        },
        Check {
            title: "forbidden comment words",
            pattern: format!(r"(//|/\*|///).*(?:{})", FORBIDDEN_WORDS.join("|")),
            include_build_script: false,
            is_violation: always,
            advice: "Comments narrating edits are STRICTLY FORBIDDEN. Delete them rather than commenting them out.",
        },
        Check {
            title: "'**' patterns in regular comments",
            pattern: r"(//|/\*).*\*\*".to_string(),
            include_build_script: false,
            is_violation: stars_outside_docs,
            advice: "The '**' pattern is only allowed in doc comments.",
        },
        Check {
            title: "comments with all uppercase alphabetic characters",
            pattern: r"(//|/\*|///).*".to_string(),
            include_build_script: false,
            is_violation: shouting_comment,
            advice: "Comments where every letter is uppercase are STRICTLY FORBIDDEN. Consider deleting the comment.",
        },
        Check {
            title: "#[allow(dead_code)] attributes",
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            include_build_script: false,
            is_violation: always,
            advice: "Use the code or remove it completely.",
        },
    ]
}

fn rust_sources() -> Vec<PathBuf> {
    WalkDir::new(".")
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            !SKIPPED_DIRS
                .iter()
                .any(|dir| entry.path().starts_with(Path::new(dir)))
        })
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|entry| entry.into_path())
        .collect()
}

fn run_checks() -> Result<(), Box<dyn Error>> {
    let sources = rust_sources();
    let mut searcher = Searcher::new();
    for check in checks() {
        let matcher = RegexMatcher::new_line_matcher(&check.pattern)?;
        for path in &sources {
            if !check.include_build_script && path.file_name().is_some_and(|n| n == "build.rs") {
                continue;
            }
            let mut collector = LineCollector {
                path: path.clone(),
                is_violation: check.is_violation,
                hits: Vec::new(),
            };
            searcher.search_path(&matcher, path, &mut collector)?;
            if let Some(report) = collector.report(&check) {
                return Err(report.into());
            }
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in ["engine", "cli", "tests", "benches"] {
        println!("cargo:rerun-if-changed={dir}");
    }

    if let Err(e) = run_checks() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
