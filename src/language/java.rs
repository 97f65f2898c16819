use std::sync::LazyLock;

use regex::Regex;

use super::{CommandPlan, Language, LanguageRuntime};

static COMPILE_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.java:\d+: error:").expect("valid regex"));

/// The candidate must declare `public class Main`; the generation prompt asks for it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Java;

impl LanguageRuntime for Java {
    fn language(&self) -> Language {
        Language::Java
    }

    fn source_file(&self) -> &'static str {
        "Main.java"
    }

    fn image(&self) -> &'static str {
        "eclipse-temurin:17-jdk"
    }

    fn commands(&self, build_dir: &str) -> CommandPlan {
        CommandPlan {
            compile: Some(format!("javac -d {build_dir} Main.java")),
            run: format!("java -Xss16m -cp {build_dir} Main"),
        }
    }

    fn compile_error_pattern(&self) -> &'static Regex {
        &COMPILE_ERROR
    }
}
