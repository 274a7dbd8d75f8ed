//! The argument model: an ordered token sequence, plus `@file` response
//! file expansion. After expansion the sequence is the canonical command
//! line that all later queries (relevant args, input files, build files)
//! operate on.

use crate::paths;
use crate::prelude::*;
use std::ffi::OsString;
use std::fs;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArgList {
    args: Vec<String>,
}

impl ArgList {
    pub fn new(args: Vec<String>) -> ArgList {
        ArgList { args }
    }

    /// Argv as handed to us by the OS. Compiler command lines are required
    /// to be UTF-8 here; anything else makes the invocation non-cacheable
    /// rather than mis-hashed.
    pub fn from_raw(raw: &[OsString]) -> Result<ArgList, WrapperError> {
        let mut args = Vec::with_capacity(raw.len());
        for arg in raw {
            match arg.to_str() {
                Some(s) => args.push(s.to_string()),
                None => {
                    return Err(WrapperError::Unparseable(format!(
                        "non-UTF-8 argument {:?}",
                        arg
                    )))
                }
            }
        }
        Ok(ArgList { args })
    }

    pub fn as_slice(&self) -> &[String] {
        &self.args
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.args.iter()
    }

    /// Replace every `@file` token, in place and recursively, with the
    /// tokenized contents of that file. Duplicate flags are preserved and
    /// order is significant -- the underlying tool's semantics govern.
    pub fn expand_response_files(&self) -> Result<ArgList, WrapperError> {
        let mut out = Vec::with_capacity(self.args.len());
        let mut in_flight = Vec::new();
        for arg in &self.args {
            expand_into(arg, &mut out, &mut in_flight)?;
        }
        Ok(ArgList { args: out })
    }
}

fn expand_into(
    arg: &str,
    out: &mut Vec<String>,
    in_flight: &mut Vec<String>,
) -> Result<(), WrapperError> {
    let name = match arg.strip_prefix('@') {
        // a bare "@" is not a response file reference
        Some(name) if !name.is_empty() => name,
        _ => {
            out.push(arg.to_string());
            return Ok(());
        }
    };

    let canon = paths::canonicalize(name);
    if in_flight.contains(&canon) {
        return Err(WrapperError::Unparseable(format!(
            "response file cycle through {name}"
        )));
    }
    let text = fs::read_to_string(name).map_err(|e| {
        WrapperError::Unparseable(format!("cannot read response file {name}: {e}"))
    })?;

    in_flight.push(canon);
    for token in tokenize(&text)? {
        expand_into(&token, out, in_flight)?;
    }
    in_flight.pop();
    Ok(())
}

/// Split response-file text on whitespace, honoring quoting: single quotes
/// take everything literally, double quotes group but let backslash escape
/// `"` and `\`, and a bare backslash escapes the next character.
pub fn tokenize(text: &str) -> Result<Vec<String>, WrapperError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut pending = false;
    let mut chars = text.chars();

    loop {
        let c = match chars.next() {
            Some(c) => c,
            None => break,
        };
        match c {
            c if c.is_whitespace() => {
                if pending {
                    tokens.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            '\'' => {
                pending = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => {
                            return Err(WrapperError::Unparseable(
                                "unterminated single quote in response file".into(),
                            ))
                        }
                    }
                }
            }
            '"' => {
                pending = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => {
                                return Err(WrapperError::Unparseable(
                                    "unterminated double quote in response file".into(),
                                ))
                            }
                        },
                        Some(c) => current.push(c),
                        None => {
                            return Err(WrapperError::Unparseable(
                                "unterminated double quote in response file".into(),
                            ))
                        }
                    }
                }
            }
            '\\' => match chars.next() {
                Some(c) => {
                    current.push(c);
                    pending = true;
                }
                None => {
                    return Err(WrapperError::Unparseable(
                        "trailing backslash in response file".into(),
                    ))
                }
            },
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    fn strs(args: &ArgList) -> Vec<&str> {
        args.iter().map(|s| s.as_str()).collect()
    }

    #[test]
    fn test_tokenize() -> Result<()> {
        assert_eq!(tokenize("-c a.c -o a.o")?, vec!["-c", "a.c", "-o", "a.o"]);
        assert_eq!(
            tokenize(indoc! {r#"
                -DGREETING="hello world"
                -I 'dir with spaces'
                -DPATH=a\ b
            "#})?,
            vec!["-DGREETING=hello world", "-I", "dir with spaces", "-DPATH=a b"],
        );
        // empty quoted string still yields a token
        assert_eq!(tokenize("'' -c")?, vec!["", "-c"]);
        assert!(tokenize("\"oops").is_err());
        assert!(tokenize("oops\\").is_err());
        Ok(())
    }

    #[test]
    fn test_expansion_matches_inline_tokens() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let resp = tmp.path().join("resp.txt");
        fs::write(&resp, "-c a.c -o a.o")?;

        let via_file = ArgList::new(vec![format!("@{}", resp.display())])
            .expand_response_files()?;
        let inline = ArgList::new(
            ["-c", "a.c", "-o", "a.o"].map(String::from).to_vec(),
        );
        assert_eq!(via_file, inline);
        Ok(())
    }

    #[test]
    fn test_recursive_expansion_preserves_order() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let inner = tmp.path().join("inner.rsp");
        let outer = tmp.path().join("outer.rsp");
        fs::write(&inner, "-DINNER=1")?;
        fs::write(&outer, format!("-DBEFORE @{} -DAFTER", inner.display()))?;

        let args = ArgList::new(vec![
            "-c".into(),
            format!("@{}", outer.display()),
            "a.c".into(),
        ])
        .expand_response_files()?;
        assert_eq!(
            strs(&args),
            vec!["-c", "-DBEFORE", "-DINNER=1", "-DAFTER", "a.c"],
        );
        Ok(())
    }

    #[test]
    fn test_cycle_detection() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let a = tmp.path().join("a.rsp");
        let b = tmp.path().join("b.rsp");
        fs::write(&a, format!("@{}", b.display()))?;
        fs::write(&b, format!("@{}", a.display()))?;

        let result =
            ArgList::new(vec![format!("@{}", a.display())]).expand_response_files();
        assert!(matches!(result, Err(WrapperError::Unparseable(_))));
        Ok(())
    }

    #[test]
    fn test_unreadable_response_file() {
        let result = ArgList::new(vec!["@/definitely/not/a/file.rsp".into()])
            .expand_response_files();
        assert!(matches!(result, Err(WrapperError::Unparseable(_))));
    }

    #[test]
    fn test_bare_at_is_not_a_response_file() -> Result<()> {
        let args = ArgList::new(vec!["@".into()]).expand_response_files()?;
        assert_eq!(strs(&args), vec!["@"]);
        Ok(())
    }
}
