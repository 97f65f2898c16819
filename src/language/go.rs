use std::sync::LazyLock;

use regex::Regex;

use super::{CommandPlan, Language, LanguageRuntime};

static COMPILE_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^# command-line-arguments|\.go:\d+:\d+: ").expect("valid regex")
});

#[derive(Debug, Clone, Copy, Default)]
pub struct Go;

impl LanguageRuntime for Go {
    fn language(&self) -> Language {
        Language::Go
    }

    fn source_file(&self) -> &'static str {
        "main.go"
    }

    fn image(&self) -> &'static str {
        "golang:1.21-alpine"
    }

    // The toolchain needs writable HOME and cache dirs; the source dir is read-only.
    fn commands(&self, build_dir: &str) -> CommandPlan {
        CommandPlan {
            compile: Some(format!(
                "HOME={build_dir} GOCACHE={build_dir}/cache GOPATH={build_dir}/go \
                 go build -o {build_dir}/program main.go"
            )),
            run: format!("{build_dir}/program"),
        }
    }

    fn compile_error_pattern(&self) -> &'static Regex {
        &COMPILE_ERROR
    }
}
