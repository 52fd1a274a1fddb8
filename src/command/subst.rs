//! Scanning for `$(KIND args)` sequences in a command string
//! (`spec.md` §4.6).
//!
//! Sequence arguments are label text and never contain parentheses in
//! practice, so a single-pass scan for the first matching `)` after
//! `$(` is sufficient; there is no need for a general-purpose
//! balanced-parens parser or a regex dependency.

/// One `$(kind args)` occurrence, with its byte span in the original
/// string (`start` is the index of `$`, `end` is one past the `)`).
pub struct Occurrence<'a> {
    pub kind: &'a str,
    pub args: &'a str,
    pub start: usize,
    pub end: usize,
}

pub fn scan(command: &str) -> Vec<Occurrence<'_>> {
    let mut occurrences = Vec::new();
    let bytes = command.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'(') {
            if let Some(close) = command[i + 2..].find(')') {
                let inner = &command[i + 2..i + 2 + close];
                let (kind, args) = match inner.find(char::is_whitespace) {
                    Some(idx) => (&inner[..idx], inner[idx..].trim_start()),
                    None => (inner, ""),
                };
                occurrences.push(Occurrence {
                    kind,
                    args,
                    start: i,
                    end: i + 2 + close + 1,
                });
                i += 2 + close + 1;
                continue;
            }
        }
        i += 1;
    }
    occurrences
}

/// Values containing shell metacharacters are wrapped in double
/// quotes before being substituted in.
pub fn quote_if_needed(value: &str) -> String {
    if value.chars().any(|c| "|&;()<>".contains(c)) {
        format!("\"{value}\"")
    } else {
        value.to_string()
    }
}
