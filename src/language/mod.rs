//! Supported target languages and the runtime each one maps to inside the sandbox.
//!
//! Every [`Language`] has exactly one [`LanguageRuntime`] implementation that
//! knows the source file name, the container image and the shell commands that
//! compile and run a candidate. Adding a language means adding a variant and a
//! runtime module; nothing in the retry loop changes.

mod c;
mod cpp;
mod go;
mod java;
mod javascript;
mod python;

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The fixed set of languages a job may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    Java,
    C,
    Cpp,
    Go,
}

impl Language {
    pub const ALL: [Language; 6] = [
        Language::Python,
        Language::Javascript,
        Language::Java,
        Language::C,
        Language::Cpp,
        Language::Go,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::Java => "java",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Go => "go",
        }
    }

    /// The runtime variant that executes this language.
    pub fn runtime(&self) -> &'static dyn LanguageRuntime {
        match self {
            Language::Python => &python::Python,
            Language::Javascript => &javascript::Javascript,
            Language::Java => &java::Java,
            Language::C => &c::C,
            Language::Cpp => &cpp::Cpp,
            Language::Go => &go::Go,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown language: {0}")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" | "nodejs" => Ok(Language::Javascript),
            "java" => Ok(Language::Java),
            "c" => Ok(Language::C),
            "cpp" | "c++" | "cxx" => Ok(Language::Cpp),
            "go" | "golang" => Ok(Language::Go),
            other => Err(UnknownLanguage(other.to_string())),
        }
    }
}

/// Shell commands for one candidate, relative to the directory holding the source.
///
/// `compile` is `None` for interpreted languages. `run` is executed with `exec`
/// so the candidate replaces the wrapping shell and receives the kill signal directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    pub compile: Option<String>,
    pub run: String,
}

/// Per-language knowledge needed to execute a candidate inside a sandbox.
pub trait LanguageRuntime: Send + Sync {
    fn language(&self) -> Language;

    /// File name the candidate source is written to.
    fn source_file(&self) -> &'static str;

    /// Default container image; config may override it.
    fn image(&self) -> &'static str;

    /// Commands to build and run the candidate. `build_dir` is writable scratch
    /// space for compiler output and caches.
    fn commands(&self, build_dir: &str) -> CommandPlan;

    /// Pattern that recognizes compiler/parser diagnostics on stderr.
    fn compile_error_pattern(&self) -> &'static Regex;

    fn looks_like_compile_error(&self, stderr: &str) -> bool {
        self.compile_error_pattern().is_match(stderr)
    }

    /// Full `/bin/sh -c` script: optional compile step, then the run step with
    /// stdin redirected from `stdin_path`.
    fn shell_script(&self, build_dir: &str, stdin_path: &str) -> String {
        let plan = self.commands(build_dir);
        let run = format!("exec {} < {stdin_path}", plan.run);
        match plan.compile {
            Some(compile) => format!("{compile} && {run}"),
            None => run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases() {
        assert_eq!("py".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("Node".parse::<Language>().unwrap(), Language::Javascript);
        assert_eq!("c++".parse::<Language>().unwrap(), Language::Cpp);
        assert_eq!("golang".parse::<Language>().unwrap(), Language::Go);
        assert!("cobol".parse::<Language>().is_err());
    }

    #[test]
    fn every_language_maps_to_its_own_runtime() {
        for language in Language::ALL {
            assert_eq!(language.runtime().language(), language);
            assert_eq!(language.to_string(), language.as_str());
        }
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let json = serde_json::to_string(&Language::Cpp).unwrap();
        assert_eq!(json, r#""cpp""#);
        let parsed: Language = serde_json::from_str(r#""javascript""#).unwrap();
        assert_eq!(parsed, Language::Javascript);
    }

    #[test]
    fn interpreted_script_execs_with_stdin() {
        let script = Language::Python.runtime().shell_script("/tmp", "stdin.txt");
        assert_eq!(script, "exec python3 -B main.py < stdin.txt");
    }

    #[test]
    fn compiled_script_builds_before_running() {
        let script = Language::C.runtime().shell_script("/tmp", "stdin.txt");
        assert!(script.starts_with("gcc "));
        assert!(script.contains("&& exec /tmp/program < stdin.txt"));
    }

    #[test]
    fn compile_error_detection_is_language_specific() {
        let py = Language::Python.runtime();
        assert!(py.looks_like_compile_error(
            "  File \"main.py\", line 1\n    print(\nSyntaxError: '(' was never closed"
        ));
        assert!(!py.looks_like_compile_error("ZeroDivisionError: division by zero"));

        let java = Language::Java.runtime();
        assert!(java.looks_like_compile_error("Main.java:3: error: ';' expected"));
        assert!(!java.looks_like_compile_error(
            "Exception in thread \"main\" java.lang.NullPointerException"
        ));

        let cpp = Language::Cpp.runtime();
        assert!(cpp.looks_like_compile_error("main.cpp:4:5: error: 'x' was not declared"));
        assert!(!cpp.looks_like_compile_error("terminate called after throwing"));
    }
}
