//! Parsing of the `/bisect` issue-comment command.
//!
//! Grammar: `/bisect <good_sha> <bad_sha> <test_command...>`. The test
//! command is the untouched remainder of the line; it is never expanded by a
//! host shell.

use thiserror::Error;

use crate::security::{validate_sha, validate_test_command, ValidationError};

pub const COMMAND_PREFIX: &str = "/bisect";

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BisectCommand {
    pub good_sha: String,
    pub bad_sha: String,
    pub test_command: String,
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// The comment does not start with `/bisect` at all; not our business.
    #[error("not a bisect command")]
    NotACommand,
    #[error("usage: `/bisect <good_sha> <bad_sha> <test_command>`")]
    MissingArguments,
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl BisectCommand {
    /// Parses a comment body. Only the first line is considered; everything
    /// after the two SHAs on that line is the test command, verbatim.
    pub fn parse(body: &str) -> Result<Self, CommandError> {
        let line = body.trim_start();
        if !line.starts_with(COMMAND_PREFIX) {
            return Err(CommandError::NotACommand);
        }
        let line = line.lines().next().unwrap_or_default();
        let rest = line[COMMAND_PREFIX.len()..].trim();
        if rest.is_empty() || !line[COMMAND_PREFIX.len()..].starts_with(char::is_whitespace) {
            return Err(if rest.is_empty() {
                CommandError::MissingArguments
            } else {
                // e.g. `/bisection`, some other slash command.
                CommandError::NotACommand
            });
        }

        let (good, rest) = split_token(rest).ok_or(CommandError::MissingArguments)?;
        let (bad, test_command) = split_token(rest).ok_or(CommandError::MissingArguments)?;
        if test_command.is_empty() {
            return Err(CommandError::MissingArguments);
        }

        Ok(Self {
            good_sha: validate_sha(good, "good_sha")?,
            bad_sha: validate_sha(bad, "bad_sha")?,
            test_command: validate_test_command(test_command)?,
        })
    }
}

fn split_token(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start();
    if input.is_empty() {
        return None;
    }
    match input.split_once(char::is_whitespace) {
        Some((token, rest)) => Some((token, rest.trim_start())),
        None => Some((input, "")),
    }
}
