//! Shell quoting for XSMP command-string reconstruction (spec §4.2.6,
//! used for both `get_app_name` and the `Exec=`/discard-command keys
//! written by the save/restore codec).

/// Quotes `s` with single quotes, using the `'\''` idiom to embed a
/// literal single quote, unless `s` contains only characters that
/// never need escaping in a shell word.
pub fn shell_quote(s: &str) -> String {
    let needs_quote = s.is_empty()
        || s.bytes().any(|b| !(b.is_ascii_alphanumeric() || b"_=:./-".contains(&b)));
    if !needs_quote {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Reconstructs a shell command line from a list of XSMP byte-string
/// values (e.g. `SmProgram`, `SmRestartCommand`, `SmDiscardCommand`).
pub fn command_string(values: &[Vec<u8>]) -> String {
    values
        .iter()
        .map(|v| shell_quote(&String::from_utf8_lossy(v)))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_embedded_single_quote() {
        let cmd = command_string(&[
            b"my app".to_vec(),
            b"--file=/tmp/a'b".to_vec(),
        ]);
        assert_eq!(cmd, r#"'my app' '--file=/tmp/a'\''b'"#);
    }

    #[test]
    fn leaves_plain_tokens_unquoted() {
        assert_eq!(shell_quote("xterm"), "xterm");
        assert_eq!(shell_quote("/usr/bin/foo"), "/usr/bin/foo");
        assert_eq!(shell_quote("FOO=bar"), "FOO=bar");
    }

    #[test]
    fn empty_token_is_quoted() {
        assert_eq!(shell_quote(""), "''");
    }
}
