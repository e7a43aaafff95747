//! Rendering command lines the way a POSIX shell would accept them back.

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c)
}

pub fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && arg.chars().all(is_shell_safe) {
        return arg.to_owned();
    }
    format!("'{}'", arg.replace('\'', r#"'"'"'"#))
}

/// Joins a command line into one string that can be pasted into a shell.
pub fn command_to_string<S: AsRef<str>>(command: &[S]) -> String {
    command
        .iter()
        .map(|arg| quote_arg(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
