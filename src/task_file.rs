//! Plain-text task files.
//!
//! ```text
//! Language: Python
//!
//! Problem:
//! Read two integers from stdin and print their sum.
//!
//! Requirements:
//! - no third-party packages
//! ```
//!
//! The language comes from a `Language:` (or `Programming language:`) line, or
//! from a first line that names nothing but a language. `Problem:` and `Task:`
//! headers are dropped. A `Requirements:` header starts a list that ends at
//! the first blank line after an item, with list markers stripped from each item.
//!
//! A file may hold several questions. Lines starting `Q1.` or `Question 2:`
//! always open a question. Bare `1.` / `2)` markers do too when the body text
//! opens with one, as long as they count up by one. Text and requirements
//! before the first question are shared by all of them.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::language::{Language, UnknownLanguage};
use crate::state_machine::TaskSpec;

static LANGUAGE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:programming\s+)?language\s*:\s*(.+?)\s*$").expect("valid regex")
});

static HEADER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:problem|task|description)\s*(?::\s*(.*?))?\s*$").expect("valid regex")
});

static REQUIREMENTS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^requirements?\s*(?::\s*(.*?))?\s*$").expect("valid regex")
});

static QUESTION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(q(?:uestion)?\s*)?(\d+)\s*[.):]\s*(.*?)\s*$").expect("valid regex")
});

static LIST_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*•]|\d+[.)])\s+").expect("valid regex"));

#[derive(Debug, Error)]
pub enum TaskFileError {
    #[error("task file is empty")]
    Empty,

    #[error(transparent)]
    Language(#[from] UnknownLanguage),

    #[error("task file has no problem description")]
    MissingDescription,

    #[error("question {0} has no problem description")]
    EmptyQuestion(u32),
}

/// One task read from a text file.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFileEntry {
    /// Question number, for multi-question files.
    pub number: Option<u32>,
    /// Language named in the file, if any.
    pub language: Option<Language>,
    pub task: TaskSpec,
}

#[derive(Debug, Default)]
struct Block {
    number: Option<u32>,
    language: Option<Language>,
    description: Vec<String>,
    requirements: Vec<String>,
    in_requirements: bool,
    // Items pushed since the last `Requirements:` header.
    section_items: usize,
}

impl Block {
    fn push(&mut self, line: &str) {
        if self.in_requirements {
            let item = LIST_MARKER.replace(line.trim(), "");
            if !item.is_empty() {
                self.requirements.push(item.into_owned());
                self.section_items += 1;
            }
        } else {
            self.description.push(line.trim_end().to_string());
        }
    }

    fn blank(&mut self) {
        if self.in_requirements && self.section_items == 0 {
            return;
        }
        self.in_requirements = false;
        self.description.push(String::new());
    }

    fn description(&self) -> String {
        self.description.join("\n").trim().to_string()
    }
}

/// Parses a task file into one entry per question.
pub fn parse(text: &str) -> Result<Vec<TaskFileEntry>, TaskFileError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(TaskFileError::Empty);
    }

    let mut lines: Vec<&str> = text.lines().collect();
    let mut preamble = Block::default();
    if let Ok(language) = lines[0].trim().parse::<Language>() {
        preamble.language = Some(language);
        lines.remove(0);
    }

    // Decided by the first line of body text.
    let mut bare_numbering: Option<bool> = None;
    let mut questions: Vec<Block> = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if bare_numbering.is_none()
            && !trimmed.is_empty()
            && !preamble.in_requirements
            && !is_header(trimmed)
        {
            bare_numbering = Some(QUESTION_LINE.is_match(trimmed));
        }
        let last = questions.last().and_then(|q| q.number);
        if let Some((number, rest)) =
            question_start(trimmed, last, bare_numbering.unwrap_or(false))
        {
            let mut question = Block {
                number: Some(number),
                ..Block::default()
            };
            if !rest.is_empty() {
                question.push(rest);
            }
            questions.push(question);
            continue;
        }

        let current = match questions.last_mut() {
            Some(question) => question,
            None => &mut preamble,
        };
        if trimmed.is_empty() {
            current.blank();
        } else if let Some(caps) = LANGUAGE_LINE.captures(trimmed) {
            current.language = Some(caps[1].parse()?);
        } else if let Some(caps) = HEADER_LINE.captures(trimmed) {
            current.in_requirements = false;
            if let Some(rest) = caps.get(1).filter(|m| !m.is_empty()) {
                current.push(rest.as_str());
            }
        } else if let Some(caps) = REQUIREMENTS_LINE.captures(trimmed) {
            current.in_requirements = true;
            current.section_items = 0;
            if let Some(rest) = caps.get(1).filter(|m| !m.is_empty()) {
                current.push(rest.as_str());
            }
        } else {
            current.push(line);
        }
    }

    if questions.is_empty() {
        let description = preamble.description();
        if description.is_empty() {
            return Err(TaskFileError::MissingDescription);
        }
        return Ok(vec![TaskFileEntry {
            number: None,
            language: preamble.language,
            task: task(description, &preamble.requirements),
        }]);
    }

    let shared = preamble.description();
    questions
        .into_iter()
        .map(|question| {
            let number = question.number.unwrap_or_default();
            let own = question.description();
            if own.is_empty() {
                return Err(TaskFileError::EmptyQuestion(number));
            }
            let description = if shared.is_empty() {
                own
            } else {
                format!("{shared}\n\n{own}")
            };
            let mut requirements = preamble.requirements.clone();
            requirements.extend(question.requirements);
            Ok(TaskFileEntry {
                number: Some(number),
                language: question.language.or(preamble.language),
                task: task(description, &requirements),
            })
        })
        .collect()
}

fn is_header(line: &str) -> bool {
    LANGUAGE_LINE.is_match(line) || HEADER_LINE.is_match(line) || REQUIREMENTS_LINE.is_match(line)
}

// Number and trailing text of a line that opens a new question.
fn question_start(line: &str, last: Option<u32>, bare_numbering: bool) -> Option<(u32, &str)> {
    let caps = QUESTION_LINE.captures(line)?;
    let number: u32 = caps[2].parse().ok()?;
    let prefixed = caps.get(1).is_some();
    let in_sequence = last.is_none_or(|last| last.checked_add(1) == Some(number));
    let rest = caps.get(3).map_or("", |m| m.as_str());
    (prefixed || (bare_numbering && in_sequence)).then_some((number, rest))
}

fn task(description: String, requirements: &[String]) -> TaskSpec {
    let mut task = TaskSpec::new(description);
    if !requirements.is_empty() {
        task.requirements = Some(requirements.join("\n"));
    }
    task
}
