use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::PollError;

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Trims and collapses internal whitespace runs to one space.
pub fn normalize(text: &str) -> String {
    WHITESPACE_RUN.replace_all(text.trim(), " ").into_owned()
}

/// Normalizes a poll's title and options, rejecting an empty title, an empty option
/// list, blank options, and options that differ only by case or spacing.
pub fn poll_fields(title: &str, options: &[String]) -> Result<(String, Vec<String>), PollError> {
    let title = normalize(title);
    if title.is_empty() {
        return Err(PollError::Validation("title must not be empty".to_owned()));
    }

    if options.is_empty() {
        return Err(PollError::Validation("a poll needs at least one option".to_owned()));
    }

    let mut seen = HashSet::new();
    let mut opts = Vec::with_capacity(options.len());

    for (i, option) in options.iter().enumerate() {
        let option = normalize(option);
        if option.is_empty() {
            return Err(PollError::Validation(format!("option {} is empty", i + 1)));
        }
        if !seen.insert(option.to_lowercase()) {
            return Err(PollError::Validation(format!("duplicate option '{}'", option)));
        }
        opts.push(option);
    }

    Ok((title, opts))
}
