//! Splits a raw command line into argv. No quoting, no escapes, no shell
//! metacharacters — a submitted command is executed directly via `execve`,
//! never through a shell.

/// Splits `cmd` on any run of tab, CR, LF, or space, dropping empty tokens.
/// `argv[0]` is the program name.
pub fn split_argv(cmd: &[u8]) -> Vec<Vec<u8>> {
    cmd.split(|b| matches!(b, b'\t' | b'\r' | b'\n' | b' '))
        .filter(|tok| !tok.is_empty())
        .map(|tok| tok.to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_plain_spaces() {
        assert_eq!(
            split_argv(b"sleep 5"),
            vec![b"sleep".to_vec(), b"5".to_vec()]
        );
    }

    #[test]
    fn collapses_runs_of_whitespace() {
        assert_eq!(
            split_argv(b"echo\t\thello\r\nworld"),
            vec![b"echo".to_vec(), b"hello".to_vec(), b"world".to_vec()]
        );
    }

    #[test]
    fn ignores_leading_and_trailing_whitespace() {
        assert_eq!(split_argv(b"  true  "), vec![b"true".to_vec()]);
    }

    #[test]
    fn empty_command_yields_empty_argv() {
        assert!(split_argv(b"   ").is_empty());
    }
}
