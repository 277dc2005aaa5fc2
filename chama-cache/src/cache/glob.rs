//! Shell-glob key patterns.
//!
//! Callers describe key sets with shell globs where `*` matches any run of
//! characters and `?` matches exactly one. Every other character is literal,
//! including `[`, `]` and `\`, which carry meaning in the remote store's
//! native dialect and are escaped on translation.

use chama_core::ValidationError;
use regex::Regex;

/// Characters that are special in the native pattern dialect but literal in
/// a shell glob.
const NATIVE_SPECIALS: &[char] = &['[', ']', '\\'];

/// A parsed shell glob.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    matcher: Regex,
}

impl GlobPattern {
    /// Parse a shell glob.
    pub fn parse(pattern: &str) -> Result<Self, ValidationError> {
        if pattern.is_empty() {
            return Err(ValidationError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern must not be empty".to_string(),
            });
        }

        let mut re = String::with_capacity(pattern.len() * 2 + 6);
        re.push_str("(?s)^");
        for c in pattern.chars() {
            match c {
                '*' => re.push_str(".*"),
                '?' => re.push('.'),
                other => push_literal(&mut re, other),
            }
        }
        re.push('$');

        let matcher = Regex::new(&re).map_err(|e| ValidationError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            source: pattern.to_string(),
            matcher,
        })
    }

    /// The glob as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `key` matches the glob.
    pub fn matches(&self, key: &str) -> bool {
        self.matcher.is_match(key)
    }

    /// Render the glob in the remote store's native pattern dialect.
    pub fn to_native(&self) -> String {
        let mut out = String::with_capacity(self.source.len() + 4);
        for c in self.source.chars() {
            if NATIVE_SPECIALS.contains(&c) {
                out.push('\\');
            }
            out.push(c);
        }
        out
    }
}

fn push_literal(re: &mut String, c: char) {
    let mut buf = [0u8; 4];
    re.push_str(&regex::escape(c.encode_utf8(&mut buf)));
}

/// Compile a pattern in the native dialect into a matcher.
///
/// Supports `*`, `?`, `\` escapes and `[...]` classes with `^` negation and
/// `a-z` ranges. An unterminated class matches its opening bracket literally.
pub(crate) fn compile_native(pattern: &str) -> Result<Regex, ValidationError> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut re = String::with_capacity(pattern.len() * 2 + 6);
    re.push_str("(?s)^");

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '\\' if i + 1 < chars.len() => {
                i += 1;
                push_literal(&mut re, chars[i]);
            }
            '[' => match chars[i + 1..].iter().position(|&c| c == ']') {
                Some(len) if len > 0 => {
                    let class = &chars[i + 1..i + 1 + len];
                    re.push('[');
                    let mut body = class;
                    if body.first() == Some(&'^') {
                        re.push('^');
                        body = &body[1..];
                    }
                    for &c in body {
                        if c == '-' {
                            re.push('-');
                        } else {
                            push_literal(&mut re, c);
                        }
                    }
                    re.push(']');
                    i += len + 1;
                }
                _ => push_literal(&mut re, '['),
            },
            other => push_literal(&mut re, other),
        }
        i += 1;
    }
    re.push('$');

    Regex::new(&re).map_err(|e| ValidationError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}
