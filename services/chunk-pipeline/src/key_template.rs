//! Object key templates.
//!
//! A key template is the path portion of the storage URL, e.g.
//! `{name}/{time}/items.{chunk:07d}.jl.gz`. It is parsed once when the
//! pipeline is configured and rendered on every flush with the current
//! chunk offset, the session timestamp and the caller's named attributes.
//!
//! Placeholders follow the familiar `{name}` / `{name:spec}` form, where
//! `spec` is a small subset of the usual format mini-language:
//! `[[fill]align][0][width][type]` with `align` one of `<`, `>`, `^` and
//! `type` one of `d` (integers) or `s` (text). `{{` and `}}` are literal braces.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Widest padding a placeholder may ask for; object keys are capped at
/// 1024 bytes by both S3 and GCS
const MAX_WIDTH: usize = 1024;

/// Errors raised while parsing or rendering a key template
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Unbalanced '{brace}' at position {position} in key template {template:?}")]
    UnbalancedBrace {
        template: String,
        position: usize,
        brace: char,
    },

    #[error("Empty placeholder at position {position} in key template {template:?}")]
    EmptyPlaceholder { template: String, position: usize },

    #[error("Invalid format spec '{spec}' for placeholder '{name}': {reason}")]
    InvalidFormat {
        name: String,
        spec: String,
        reason: String,
    },

    #[error("Unknown placeholder '{0}' in key template")]
    UnknownPlaceholder(String),
}

/// A value that can be substituted into a key template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateValue {
    Integer(i64),
    Text(String),
}

impl fmt::Display for TemplateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateValue::Integer(n) => write!(f, "{}", n),
            TemplateValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for TemplateValue {
    fn from(value: i64) -> Self {
        TemplateValue::Integer(value)
    }
}

impl From<u64> for TemplateValue {
    fn from(value: u64) -> Self {
        TemplateValue::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<usize> for TemplateValue {
    fn from(value: usize) -> Self {
        TemplateValue::from(value as u64)
    }
}

impl From<&str> for TemplateValue {
    fn from(value: &str) -> Self {
        TemplateValue::Text(value.to_string())
    }
}

impl From<String> for TemplateValue {
    fn from(value: String) -> Self {
        TemplateValue::Text(value)
    }
}

/// Named values available to a template at render time
pub type TemplateParams = HashMap<String, TemplateValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Align {
    Left,
    Right,
    Center,
    /// Padding goes between the sign and the digits
    AfterSign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presentation {
    Decimal,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct FormatSpec {
    fill: Option<char>,
    align: Option<Align>,
    zero: bool,
    width: usize,
    presentation: Option<Presentation>,
}

impl FormatSpec {
    fn parse(name: &str, spec: &str) -> Result<Self, TemplateError> {
        let invalid = |reason: &str| TemplateError::InvalidFormat {
            name: name.to_string(),
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let chars: Vec<char> = spec.chars().collect();
        let mut parsed = FormatSpec::default();
        let mut i = 0;

        if chars.len() >= 2 && align_of(chars[1]).is_some() {
            parsed.fill = Some(chars[0]);
            parsed.align = align_of(chars[1]);
            i = 2;
        } else if let Some(align) = chars.first().copied().and_then(align_of) {
            parsed.align = Some(align);
            i = 1;
        }

        if chars.get(i) == Some(&'0') {
            parsed.zero = true;
            i += 1;
        }

        let width_start = i;
        while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
        if i > width_start {
            let digits: String = chars[width_start..i].iter().collect();
            parsed.width = digits
                .parse::<usize>()
                .ok()
                .filter(|width| *width <= MAX_WIDTH)
                .ok_or_else(|| invalid("width exceeds the maximum object key length"))?;
        }

        match chars.get(i) {
            None => {}
            Some('d') => {
                parsed.presentation = Some(Presentation::Decimal);
                i += 1;
            }
            Some('s') => {
                parsed.presentation = Some(Presentation::Text);
                i += 1;
            }
            Some(_) => return Err(invalid("unsupported presentation type")),
        }

        if i != chars.len() {
            return Err(invalid("trailing characters"));
        }

        Ok(parsed)
    }

    fn render(&self, name: &str, value: &TemplateValue) -> Result<String, TemplateError> {
        let mismatch = |reason: &str| TemplateError::InvalidFormat {
            name: name.to_string(),
            spec: self.to_string(),
            reason: reason.to_string(),
        };

        let fill = self.fill.unwrap_or(if self.zero { '0' } else { ' ' });

        match value {
            TemplateValue::Integer(n) => {
                if self.presentation == Some(Presentation::Text) {
                    return Err(mismatch("'s' format applied to an integer"));
                }
                let sign = if *n < 0 { "-" } else { "" };
                let digits = n.unsigned_abs().to_string();
                let align = match (self.align, self.zero) {
                    (Some(align), _) => align,
                    (None, true) => Align::AfterSign,
                    (None, false) => Align::Right,
                };
                Ok(pad(sign, &digits, fill, align, self.width))
            }
            TemplateValue::Text(s) => {
                if self.presentation == Some(Presentation::Decimal) {
                    return Err(mismatch("'d' format applied to text"));
                }
                if self.align == Some(Align::AfterSign) {
                    return Err(mismatch("sign-aware padding applied to text"));
                }
                Ok(pad("", s, fill, self.align.unwrap_or(Align::Left), self.width))
            }
        }
    }
}

impl fmt::Display for FormatSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(fill) = self.fill {
            write!(f, "{}", fill)?;
        }
        if let Some(align) = self.align {
            let c = match align {
                Align::Left => '<',
                Align::Right => '>',
                Align::Center => '^',
                Align::AfterSign => '=',
            };
            write!(f, "{}", c)?;
        }
        if self.zero {
            f.write_str("0")?;
        }
        if self.width > 0 {
            write!(f, "{}", self.width)?;
        }
        match self.presentation {
            Some(Presentation::Decimal) => f.write_str("d"),
            Some(Presentation::Text) => f.write_str("s"),
            None => Ok(()),
        }
    }
}

fn align_of(c: char) -> Option<Align> {
    match c {
        '<' => Some(Align::Left),
        '>' => Some(Align::Right),
        '^' => Some(Align::Center),
        '=' => Some(Align::AfterSign),
        _ => None,
    }
}

fn pad(sign: &str, body: &str, fill: char, align: Align, width: usize) -> String {
    let len = sign.chars().count() + body.chars().count();
    if len >= width {
        return format!("{}{}", sign, body);
    }

    let padding = width - len;
    let repeat = |n: usize| std::iter::repeat(fill).take(n).collect::<String>();

    match align {
        Align::Left => format!("{}{}{}", sign, body, repeat(padding)),
        Align::Right => format!("{}{}{}", repeat(padding), sign, body),
        Align::Center => {
            let left = padding / 2;
            format!("{}{}{}{}", repeat(left), sign, body, repeat(padding - left))
        }
        Align::AfterSign => format!("{}{}{}", sign, repeat(padding), body),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field { name: String, spec: FormatSpec },
}

/// A parsed object key template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl KeyTemplate {
    /// Parse a template, validating brace balance and format specs.
    ///
    /// Placeholder names are not checked here: which attributes exist is only
    /// known once the session has been opened.
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.char_indices().peekable();

        while let Some((position, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    literal.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    literal.push('}');
                }
                '}' => {
                    return Err(TemplateError::UnbalancedBrace {
                        template: template.to_string(),
                        position,
                        brace: '}',
                    });
                }
                '{' => {
                    let mut field = String::new();
                    let mut closed = false;
                    for (inner_position, inner) in chars.by_ref() {
                        match inner {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => {
                                return Err(TemplateError::UnbalancedBrace {
                                    template: template.to_string(),
                                    position: inner_position,
                                    brace: '{',
                                });
                            }
                            _ => field.push(inner),
                        }
                    }
                    if !closed {
                        return Err(TemplateError::UnbalancedBrace {
                            template: template.to_string(),
                            position,
                            brace: '{',
                        });
                    }

                    let (name, spec) = match field.split_once(':') {
                        Some((name, spec)) => (name, spec),
                        None => (field.as_str(), ""),
                    };
                    if name.is_empty() {
                        return Err(TemplateError::EmptyPlaceholder {
                            template: template.to_string(),
                            position,
                        });
                    }

                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field {
                        name: name.to_string(),
                        spec: FormatSpec::parse(name, spec)?,
                    });
                }
                _ => literal.push(c),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    /// The template exactly as configured
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Names of all placeholders, in order of appearance
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Field { name, .. } => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Render the template with the given parameters
    pub fn resolve(&self, params: &TemplateParams) -> Result<String, TemplateError> {
        let mut key = String::with_capacity(self.source.len());

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => key.push_str(text),
                Segment::Field { name, spec } => {
                    let value = params
                        .get(name)
                        .ok_or_else(|| TemplateError::UnknownPlaceholder(name.clone()))?;
                    key.push_str(&spec.render(name, value)?);
                }
            }
        }

        Ok(key)
    }
}

impl fmt::Display for KeyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse and render a template in one step
pub fn resolve(template: &str, params: &TemplateParams) -> Result<String, TemplateError> {
    KeyTemplate::parse(template)?.resolve(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, TemplateValue)]) -> TemplateParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_default_items_template() {
        let template = KeyTemplate::parse("{name}/{time}/items.{chunk:07d}.jl.gz").unwrap();
        let params = params(&[
            ("name", "test".into()),
            ("time", "2024-01-15T10-30-45".into()),
            ("chunk", 0u64.into()),
        ]);

        assert_eq!(
            template.resolve(&params).unwrap(),
            "test/2024-01-15T10-30-45/items.0000000.jl.gz"
        );
    }

    #[test]
    fn test_placeholders_in_order() {
        let template = KeyTemplate::parse("{name}/{time}/items.{chunk:07d}.jl").unwrap();
        let names: Vec<_> = template.placeholders().collect();
        assert_eq!(names, vec!["name", "time", "chunk"]);
    }

    #[test]
    fn test_zero_padding_grows_past_width() {
        let p = params(&[("chunk", 123456789u64.into())]);
        assert_eq!(resolve("items.{chunk:07d}", &p).unwrap(), "items.123456789");
    }

    #[test]
    fn test_negative_zero_padding_keeps_sign_first() {
        let p = params(&[("n", TemplateValue::Integer(-42))]);
        assert_eq!(resolve("{n:06d}", &p).unwrap(), "-00042");
    }

    #[test]
    fn test_alignment_and_fill() {
        let p = params(&[("name", "ab".into()), ("chunk", 7u64.into())]);
        assert_eq!(resolve("[{name:>5}]", &p).unwrap(), "[   ab]");
        assert_eq!(resolve("[{name:*^6s}]", &p).unwrap(), "[**ab**]");
        assert_eq!(resolve("[{name:5}]", &p).unwrap(), "[ab   ]");
        assert_eq!(resolve("[{chunk:4}]", &p).unwrap(), "[   7]");
        assert_eq!(resolve("[{chunk:<4d}]", &p).unwrap(), "[7   ]");
    }

    #[test]
    fn test_escaped_braces() {
        let p = params(&[("chunk", 3u64.into())]);
        assert_eq!(resolve("{{literal}}/{chunk}", &p).unwrap(), "{literal}/3");
    }

    #[test]
    fn test_unknown_placeholder_is_a_resolve_error() {
        // Parsing succeeds; the name is only checked once params are known.
        let template = KeyTemplate::parse("{spider}/{chunk}").unwrap();
        let p = params(&[("chunk", 0u64.into())]);

        assert_eq!(
            template.resolve(&p),
            Err(TemplateError::UnknownPlaceholder("spider".to_string()))
        );
    }

    #[test]
    fn test_unbalanced_braces() {
        assert!(matches!(
            KeyTemplate::parse("items.{chunk"),
            Err(TemplateError::UnbalancedBrace { brace: '{', .. })
        ));
        assert!(matches!(
            KeyTemplate::parse("items.chunk}"),
            Err(TemplateError::UnbalancedBrace { brace: '}', .. })
        ));
        assert!(matches!(
            KeyTemplate::parse("{a{b}}"),
            Err(TemplateError::UnbalancedBrace { .. })
        ));
    }

    #[test]
    fn test_empty_placeholder() {
        assert!(matches!(
            KeyTemplate::parse("items.{}.jl"),
            Err(TemplateError::EmptyPlaceholder { position: 6, .. })
        ));
    }

    #[test]
    fn test_invalid_format_spec() {
        assert!(matches!(
            KeyTemplate::parse("{chunk:07x}"),
            Err(TemplateError::InvalidFormat { .. })
        ));
        assert!(matches!(
            KeyTemplate::parse("{chunk:.2f}"),
            Err(TemplateError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_width_is_capped_at_parse() {
        assert!(KeyTemplate::parse("{chunk:01024d}").is_ok());
        for template in ["{chunk:1025}", "{chunk:999999999999}", "{name:x<99999999999999999999999}"] {
            assert!(
                matches!(KeyTemplate::parse(template), Err(TemplateError::InvalidFormat { .. })),
                "accepted {template}"
            );
        }
    }

    #[test]
    fn test_type_mismatch_at_resolve() {
        let p = params(&[("name", "spider".into()), ("chunk", 1u64.into())]);
        assert!(matches!(
            resolve("{name:d}", &p),
            Err(TemplateError::InvalidFormat { .. })
        ));
        assert!(matches!(
            resolve("{chunk:s}", &p),
            Err(TemplateError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_display_round_trips_source() {
        let source = "{name}/{{x}}/{chunk:07d}";
        assert_eq!(KeyTemplate::parse(source).unwrap().to_string(), source);
    }
}
