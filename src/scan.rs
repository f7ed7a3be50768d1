//! Scanning primitives shared by the evaluator, the substitution engine and
//! the directive preprocessor: character classes, identifier spans and the
//! comment-stripping pass. Source text is never mutated; everything works on
//! immutable input and produces fresh buffers.

use crate::error::{PreshadeError, PreshadeResult};

pub(crate) fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

pub(crate) fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// A well-formed macro name: identifier-start followed by identifier chars.
pub(crate) fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if is_ident_start(c) => chars.all(is_ident_char),
        _ => false,
    }
}

/// First identifier run in `s`, skipping anything that precedes it.
pub(crate) fn first_identifier(s: &str) -> Option<&str> {
    let start = s.find(is_ident_start)?;
    let rest = &s[start..];
    let end = rest
        .find(|c: char| !is_ident_char(c))
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Strips comments in one forward pass, ahead of line splitting.
///
/// Block comments `/* ... */` are deleted, but one newline is kept for each
/// line break they span so later lines keep their source numbers; an
/// unterminated block comment is fatal. Line comments `// ...` are deleted to
/// end-of-line. Carriage returns are dropped, and whitespace directly after a
/// `#` is squeezed out so `#  define` scans as `#define`.
pub fn strip_comments(src: &str) -> PreshadeResult<String> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = String::with_capacity(src.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '/' && chars.get(i + 1) == Some(&'*') {
            let mut j = i + 2;
            loop {
                if j + 1 >= chars.len() {
                    let context: String = chars[i..].iter().take(32).collect();
                    return Err(PreshadeError::comment(format!(
                        "unterminated comment, starting at: {context}"
                    )));
                }
                if chars[j] == '*' && chars[j + 1] == '/' {
                    break;
                }
                j += 1;
            }
            for k in i..j + 2 {
                if chars[k] == '\n' {
                    out.push('\n');
                }
            }
            i = j + 2;
            continue;
        }

        if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        if c != '\r' {
            out.push(c);
            if c == '#' {
                i += 1;
                while i < chars.len() && (chars[i] == ' ' || chars[i] == '\t') {
                    i += 1;
                }
                continue;
            }
        }
        i += 1;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_comments_are_deleted() {
        assert_eq!(strip_comments("a/* x */b").unwrap(), "ab");
        assert_eq!(strip_comments("/*a*//*b*/c").unwrap(), "c");
    }

    #[test]
    fn block_comments_keep_spanned_newlines() {
        assert_eq!(strip_comments("a/* x\ny */b").unwrap(), "a\nb");
        assert_eq!(strip_comments("/* one\ntwo\nthree */last").unwrap(), "\n\nlast");
    }

    #[test]
    fn line_comments_are_deleted_to_eol() {
        assert_eq!(strip_comments("a // rest\nb").unwrap(), "a \nb");
        assert_eq!(strip_comments("// only").unwrap(), "");
    }

    #[test]
    fn unterminated_block_comment_is_fatal() {
        let err = strip_comments("a /* never closed").unwrap_err();
        assert!(err.to_string().contains("unterminated comment"));
    }

    #[test]
    fn carriage_returns_are_dropped() {
        assert_eq!(strip_comments("a\r\nb").unwrap(), "a\nb");
    }

    #[test]
    fn whitespace_after_hash_is_squeezed() {
        assert_eq!(strip_comments("#   define A 1").unwrap(), "#define A 1");
        assert_eq!(strip_comments("  # \t ifdef X").unwrap(), "  #ifdef X");
    }

    #[test]
    fn identifier_helpers() {
        assert!(is_valid_identifier("FOO_2"));
        assert!(is_valid_identifier("_x"));
        assert!(!is_valid_identifier("2FOO"));
        assert!(!is_valid_identifier("FOO(x)"));
        assert!(!is_valid_identifier(""));

        assert_eq!(first_identifier("  NAME rest"), Some("NAME"));
        assert_eq!(first_identifier("  12abc"), Some("abc"));
        assert_eq!(first_identifier(" 123 "), None);
    }
}
