use crate::{ShellInputError, VirshboxResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The longest string, in bytes, accepted on a shell command line.
pub const MAX_SHELL_INPUT_LEN: usize = 4096;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Rejects strings that are too long or carry bytes a shell must never see.
///
/// Tab and newline are the only control characters let through.
pub fn validate_shell_input(input: &str) -> Result<(), ShellInputError> {
    if input.len() > MAX_SHELL_INPUT_LEN {
        return Err(ShellInputError::TooLong {
            len: input.len(),
            max: MAX_SHELL_INPUT_LEN,
        });
    }

    for (position, ch) in input.char_indices() {
        if ch == '\0' {
            return Err(ShellInputError::NullByte);
        }

        if ch.is_control() && ch != '\t' && ch != '\n' {
            return Err(ShellInputError::ControlChar { position, ch });
        }
    }

    Ok(())
}

/// Validates `input` and wraps it in single quotes for a POSIX shell.
pub fn shell_escape(input: &str) -> VirshboxResult<String> {
    validate_shell_input(input)?;
    Ok(shell_quote(input))
}

/// Wraps `input` in single quotes, closing and reopening the quote around embedded ones.
///
/// Callers must have validated `input` if it came from outside the process.
pub fn shell_quote(input: &str) -> String {
    format!("'{}'", input.replace('\'', r#"'"'"'"#))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
