use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Only the crate's own sources are policed; vendored or reference trees are not.
const SOURCE_DIRS: &[&str] = &["power", "src", "tests", "benches"];

const FORBIDDEN_WORDS: &str = r"(//|/\*).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)";

#[derive(Clone, Copy)]
enum Policy {
    UnderscorePrefix,
    ForbiddenWords,
    StarsInComment,
    ShoutingComment,
    AllowDeadCode,
}

impl Policy {
    fn pattern(self) -> &'static str {
        match self {
            Self::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b",
            Self::ForbiddenWords => FORBIDDEN_WORDS,
            Self::StarsInComment => r"(//|/\*).*\*\*",
            Self::ShoutingComment => r"(//|/\*).*",
            Self::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        }
    }

    fn explanation(self) -> &'static str {
        match self {
            Self::UnderscorePrefix => "Underscore-prefixed names are not allowed in this project.",
            Self::ForbiddenWords => "Comments describe the code as it is, not its edit history.",
            Self::StarsInComment => "Markdown emphasis belongs in doc comments only.",
            Self::ShoutingComment => "Comments written entirely in capitals are not allowed.",
            Self::AllowDeadCode => "Either use the code or remove it; #[allow(dead_code)] is forbidden.",
        }
    }

    // Decides whether a regex hit on `line` is a real violation.
    fn is_violation(self, line: &str) -> bool {
        let trimmed = line.trim_start();
        match self {
            Self::UnderscorePrefix => !trimmed.starts_with("//") && !inside_string_literal(line),
            Self::ForbiddenWords | Self::AllowDeadCode => true,
            Self::StarsInComment => !trimmed.starts_with("///") && !trimmed.starts_with("//!"),
            Self::ShoutingComment => comment_text(trimmed).is_some_and(|text| {
                let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
                !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
            }),
        }
    }
}

fn inside_string_literal(line: &str) -> bool {
    line.split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn comment_text(trimmed: &str) -> Option<&str> {
    for prefix in ["///", "//!", "//"] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            return Some(rest.trim());
        }
    }
    None
}

struct PolicyCollector {
    policy: Policy,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl PolicyCollector {
    fn new(policy: Policy, file_path: &Path) -> Self {
        Self {
            policy,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut message = format!(
            "\n❌ ERROR: {} code policy violation(s) in {}:\n",
            self.violations.len(),
            self.file_path.display()
        );
        for violation in &self.violations {
            message.push_str(&format!("   {violation}\n"));
        }
        message.push_str(&format!("\n⚠️ {}\n", self.policy.explanation()));
        Some(message)
    }
}

impl Sink for PolicyCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.policy.is_violation(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SOURCE_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
}

fn scan(policy: Policy) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(policy.pattern())?;
    let mut searcher = Searcher::new();
    for path in rust_sources() {
        let mut collector = PolicyCollector::new(policy, &path);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(message) = collector.error_message() {
            return Err(message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let policies = [
        Policy::UnderscorePrefix,
        Policy::ForbiddenWords,
        Policy::StarsInComment,
        Policy::ShoutingComment,
        Policy::AllowDeadCode,
    ];
    for policy in policies {
        if let Err(e) = scan(policy) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
