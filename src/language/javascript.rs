use std::sync::LazyLock;

use regex::Regex;

use super::{CommandPlan, Language, LanguageRuntime};

static COMPILE_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^SyntaxError\b").expect("valid regex"));

#[derive(Debug, Clone, Copy, Default)]
pub struct Javascript;

impl LanguageRuntime for Javascript {
    fn language(&self) -> Language {
        Language::Javascript
    }

    fn source_file(&self) -> &'static str {
        "main.js"
    }

    fn image(&self) -> &'static str {
        "node:18-slim"
    }

    fn commands(&self, _build_dir: &str) -> CommandPlan {
        CommandPlan {
            compile: None,
            run: "node main.js".to_string(),
        }
    }

    fn compile_error_pattern(&self) -> &'static Regex {
        &COMPILE_ERROR
    }
}
