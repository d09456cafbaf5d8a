// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Commit message derivation from edit instructions.
//!
//! Subjects are the instruction, cleaned up: trimmed, polite prefixes
//! stripped, capitalized, tagged with a short instruction id, and cut at
//! the conventional 72-character limit. The body carries whatever the
//! subject had to drop, a file list when an edit touches many paths, and
//! machine-readable trailers.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

/// Conventional git subject-line limit.
pub const SUBJECT_LIMIT: usize = 72;

/// Column to wrap body text at.
const BODY_WRAP: usize = 72;

/// Changed-path count above which the body lists the files.
const PATH_LIST_THRESHOLD: usize = 3;

static POLITE_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(please|kindly|can you|could you|would you|will you)[,\s]+").unwrap()
});

/// A derived subject plus optional body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMessage {
    /// Subject line, at most [`SUBJECT_LIMIT`] characters.
    pub subject: String,
    /// Body text, wrapped at 72 columns, when the subject alone is not
    /// enough.
    pub body: Option<String>,
}

/// Derive the commit message for an instruction.
///
/// The subject gets a `[{id-prefix}]` tag from the first eight characters
/// of the instruction id (all of them when the id is shorter). A body is
/// emitted only when the subject was truncated or more than three paths
/// changed; it then also carries trailers for the instruction id, user,
/// and timestamp.
pub fn derive_commit_message(
    instruction: &str,
    message_id: &str,
    user: &str,
    changed_paths: &[String],
    timestamp: DateTime<Utc>,
) -> CommitMessage {
    let cleaned = clean_instruction(instruction);
    let id_prefix: String = message_id.chars().take(8).collect();
    let full_subject = format!("[{id_prefix}] {cleaned}");
    let subject = truncate_chars(&full_subject, SUBJECT_LIMIT);
    let truncated = subject.chars().count() < full_subject.chars().count();

    let needs_body = truncated || changed_paths.len() > PATH_LIST_THRESHOLD;
    if !needs_body {
        return CommitMessage {
            subject,
            body: None,
        };
    }

    let mut sections: Vec<String> = Vec::new();
    if truncated {
        sections.push(wrap_text(instruction.trim(), BODY_WRAP));
    }
    if changed_paths.len() > PATH_LIST_THRESHOLD {
        let list: Vec<String> = changed_paths.iter().map(|p| format!("- {p}")).collect();
        sections.push(format!("Changed paths:\n{}", list.join("\n")));
    }
    sections.push(format!(
        "Instruction-Id: {message_id}\nUser: {user}\nTimestamp: {}",
        timestamp.to_rfc3339()
    ));

    CommitMessage {
        subject,
        body: Some(sections.join("\n\n")),
    }
}

/// Subject used for the work-in-progress commit created when an
/// instruction is aborted mid-flight. Uses the raw instruction; the job
/// never got far enough to earn its normal subject.
pub fn wip_subject(instruction: &str) -> String {
    truncate_chars(
        &format!("WIP: interrupted — {}", instruction.trim()),
        SUBJECT_LIMIT,
    )
}

fn clean_instruction(instruction: &str) -> String {
    let mut text = instruction.trim().to_string();
    loop {
        let stripped = POLITE_PREFIX.replace(&text, "").into_owned();
        if stripped == text {
            break;
        }
        text = stripped.trim_start().to_string();
    }
    capitalize(&text)
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        text.chars().take(limit).collect::<String>().trim_end().to_string()
    }
}

fn wrap_text(text: &str, width: usize) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if current.is_empty() {
            current = word.to_string();
        } else if current.chars().count() + 1 + word.chars().count() <= width {
            current.push(' ');
            current.push_str(word);
        } else {
            lines.push(std::mem::take(&mut current));
            current = word.to_string();
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines.join("\n")
}
