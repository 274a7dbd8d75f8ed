//! Lexical path manipulation. Everything here works on plain strings and
//! never touches the filesystem -- compiler command lines are strings, and
//! fingerprinting needs the same answer whether or not a path exists yet.

#[cfg(windows)]
pub const SEP: char = '\\';
#[cfg(not(windows))]
pub const SEP: char = '/';

#[cfg(windows)]
fn is_sep(c: char) -> bool {
    c == '/' || c == '\\'
}

#[cfg(not(windows))]
fn is_sep(c: char) -> bool {
    c == '/'
}

/// Concatenate with exactly one separator. Neither side is canonicalized;
/// an empty side yields the other unchanged.
pub fn append(dir: &str, file: &str) -> String {
    if dir.is_empty() {
        file.to_string()
    } else if file.is_empty() {
        dir.to_string()
    } else {
        format!("{dir}{SEP}{file}")
    }
}

/// Everything before the last separator ("" if there is none).
pub fn dir_part(p: &str) -> &str {
    match p.rfind(is_sep) {
        Some(idx) => &p[..idx],
        None => "",
    }
}

/// Everything after the last separator (the whole string if there is none).
pub fn file_part(p: &str) -> &str {
    match p.rfind(is_sep) {
        Some(idx) => &p[idx + 1..],
        None => p,
    }
}

/// The suffix of the file part starting at its last `.`, or "" if the file
/// part contains no dot.
pub fn extension(p: &str) -> &str {
    let file = file_part(p);
    match file.rfind('.') {
        Some(idx) => &file[idx..],
        None => "",
    }
}

/// The file part with its extension (if any) removed.
pub fn stem(p: &str) -> &str {
    let file = file_part(p);
    match file.rfind('.') {
        Some(idx) => &file[..idx],
        None => file,
    }
}

/// The whole path with the file part's extension replaced by `ext` (which
/// should include its leading dot).
pub fn with_extension(p: &str, ext: &str) -> String {
    append(dir_part(p), &format!("{}{}", stem(p), ext))
}

/// Purely lexical normalization: resolves `.` and `..`, collapses repeated
/// separators, emits the platform separator, uppercases Windows drive
/// letters, and strips any trailing separator except at the root. `..`
/// above the root is absorbed. Symlinks are NOT dereferenced.
pub fn canonicalize(p: &str) -> String {
    let mut out = String::with_capacity(p.len());

    #[cfg(windows)]
    let rest = {
        let bytes = p.as_bytes();
        if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
            out.push(bytes[0].to_ascii_uppercase() as char);
            out.push(':');
            &p[2..]
        } else {
            p
        }
    };
    #[cfg(not(windows))]
    let rest = p;

    let absolute = rest.starts_with(is_sep);
    let mut parts: Vec<&str> = Vec::new();
    for piece in rest.split(is_sep) {
        match piece {
            "" | "." => {}
            ".." => {
                if parts.last().copied().unwrap_or("..") == ".." && !absolute {
                    // a relative path may legitimately start with ../../
                    parts.push("..");
                } else {
                    parts.pop();
                }
            }
            piece => parts.push(piece),
        }
    }

    if absolute {
        out.push(SEP);
    }
    for (idx, piece) in parts.iter().enumerate() {
        if idx > 0 {
            out.push(SEP);
        }
        out.push_str(piece);
    }
    out
}
