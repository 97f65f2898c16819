use std::sync::LazyLock;

use regex::Regex;

use super::{CommandPlan, Language, LanguageRuntime};

static COMPILE_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.c:\d+:\d+: (fatal )?error:|undefined reference to").expect("valid regex")
});

#[derive(Debug, Clone, Copy, Default)]
pub struct C;

impl LanguageRuntime for C {
    fn language(&self) -> Language {
        Language::C
    }

    fn source_file(&self) -> &'static str {
        "main.c"
    }

    fn image(&self) -> &'static str {
        "gcc:13"
    }

    fn commands(&self, build_dir: &str) -> CommandPlan {
        CommandPlan {
            compile: Some(format!("gcc -std=c17 -O2 -o {build_dir}/program main.c -lm")),
            run: format!("{build_dir}/program"),
        }
    }

    fn compile_error_pattern(&self) -> &'static Regex {
        &COMPILE_ERROR
    }
}
