//! String templates with embedded `${{ ... }}` fragments.

use serde_json::{Map, Value};

use super::ast::Expr;
use super::parser::parse_expression;
use super::{EvaluationError, ExpressionError, ParseError};
use crate::workflow::context::ExecutionContext;

const OPEN: [char; 3] = ['$', '{', '{'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Expr(Expr),
}

/// A parsed string field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
    /// The field is exactly one fragment, modulo surrounding whitespace.
    whole: bool,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let chars: Vec<char> = source.chars().collect();
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut pos = 0;

        while pos < chars.len() {
            if !chars[pos..].starts_with(&OPEN) {
                literal.push(chars[pos]);
                pos += 1;
                continue;
            }

            let inner_start = pos + OPEN.len();
            let close = find_close(&chars, inner_start).ok_or_else(|| {
                ParseError::new("unterminated '${{' fragment", pos, source)
            })?;
            let inner: String = chars[inner_start..close].iter().collect();
            let expr = parse_expression(&inner).map_err(|e| e.rebase(inner_start, source))?;

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Expr(expr));
            pos = close + 2;
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        let mut fragments = segments.iter().filter(|s| matches!(s, Segment::Expr(_)));
        let whole = fragments.next().is_some()
            && fragments.next().is_none()
            && segments.iter().all(|s| match s {
                Segment::Literal(text) => text.trim().is_empty(),
                Segment::Expr(_) => true,
            });

        Ok(Self { segments, whole })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_literal(&self) -> bool {
        self.expressions().next().is_none()
    }

    /// The single expression of a whole-fragment template.
    pub fn as_single(&self) -> Option<&Expr> {
        if !self.whole {
            return None;
        }
        self.expressions().next()
    }

    pub fn expressions(&self) -> impl Iterator<Item = &Expr> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Expr(expr) => Some(expr),
            Segment::Literal(_) => None,
        })
    }

    /// Render against `ctx`.
    ///
    /// A whole-fragment template yields the typed value; anything else
    /// yields a string.
    pub fn render(&self, ctx: &ExecutionContext) -> Result<Value, EvaluationError> {
        if let Some(expr) = self.as_single() {
            return expr.evaluate(ctx);
        }

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Expr(expr) => match expr.evaluate(ctx)? {
                    Value::String(s) => out.push_str(&s),
                    Value::Null => {}
                    other => out.push_str(&other.to_string()),
                },
            }
        }
        Ok(Value::String(out))
    }
}

/// Find the `}}` closing a fragment, ignoring braces inside quoted strings.
fn find_close(chars: &[char], start: usize) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut pos = start;
    while pos < chars.len() {
        let c = chars[pos];
        match quote {
            Some(_) if c == '\\' => pos += 1,
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == '}' && chars.get(pos + 1) == Some(&'}') => return Some(pos),
            None => {}
        }
        pos += 1;
    }
    None
}

/// Parse a `when` or `for_each` field, written either as a single fragment
/// or as a bare expression.
pub fn parse_condition(source: &str) -> Result<Expr, ParseError> {
    if !source.contains("${{") {
        return parse_expression(source);
    }
    let template = Template::parse(source)?;
    template.as_single().cloned().ok_or_else(|| {
        ParseError::new(
            "condition must be a single '${{ ... }}' fragment or a bare expression",
            0,
            source,
        )
    })
}

/// Render every string inside `value` as a template, recursing through
/// arrays and objects. Non-string scalars pass through unchanged.
pub fn render_value(value: &Value, ctx: &ExecutionContext) -> Result<Value, ExpressionError> {
    match value {
        Value::String(s) => Ok(Template::parse(s)?.render(ctx)?),
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut rendered = Map::with_capacity(map.len());
            for (key, item) in map {
                rendered.insert(key.clone(), render_value(item, ctx)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn context() -> ExecutionContext {
        let inputs = match json!({"name": "Ava", "count": 3, "tags": ["x"], "none": null}) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        ExecutionContext::new(inputs)
    }

    #[test]
    fn test_literal_template() {
        let template = Template::parse("plain text").unwrap();
        assert!(template.is_literal());
        assert_eq!(template.render(&context()).unwrap(), json!("plain text"));
    }

    #[test]
    fn test_whole_fragment_keeps_type() {
        let ctx = context();
        assert_eq!(Template::parse("${{ inputs.count }}").unwrap().render(&ctx).unwrap(), json!(3));
        assert_eq!(Template::parse("  ${{inputs.tags}} ").unwrap().render(&ctx).unwrap(), json!(["x"]));
    }

    #[test]
    fn test_interpolation_renders_text() {
        let ctx = context();
        let template = Template::parse("Hi ${{ inputs.name }} x${{ inputs.count }} ${{ inputs.tags }}[${{ inputs.none }}]").unwrap();
        assert_eq!(template.render(&ctx).unwrap(), json!("Hi Ava x3 [\"x\"][]"));
    }

    #[test]
    fn test_two_fragments_are_not_whole() {
        let template = Template::parse("${{ inputs.count }}${{ inputs.count }}").unwrap();
        assert!(template.as_single().is_none());
        assert_eq!(template.render(&context()).unwrap(), json!("33"));
    }

    #[test]
    fn test_closing_braces_inside_quotes() {
        let template = Template::parse("${{ item['a}}b'] }}").unwrap();
        assert_eq!(template.expressions().count(), 1);
    }

    #[test]
    fn test_unterminated_fragment() {
        let err = Template::parse("Hello ${{ inputs.name").unwrap_err();
        assert!(err.message.contains("unterminated"), "got: {err}");
        assert_eq!(err.offset, 6);
    }

    #[test]
    fn test_inner_error_offset_is_rebased() {
        let err = Template::parse("Hello ${{ inputs.name. }}").unwrap_err();
        assert_eq!(err.text, "Hello ${{ inputs.name. }}");
        assert_eq!(err.offset, 23);
        assert!(err.caret().ends_with(&format!("{}^", " ".repeat(23))));
    }

    #[test]
    fn test_parse_condition_accepts_both_forms() {
        let bare = parse_condition("not inputs.skip").unwrap();
        let fragment = parse_condition("${{ not inputs.skip }}").unwrap();
        assert_eq!(bare, fragment);

        let err = parse_condition("skip ${{ inputs.skip }}").unwrap_err();
        assert!(err.message.contains("single"), "got: {err}");
    }

    #[test]
    fn test_render_value_recurses() {
        let ctx = context();
        let args = json!({
            "greeting": "Hi ${{ inputs.name }}",
            "count": "${{ inputs.count }}",
            "nested": {"list": ["${{ inputs.name }}", 7]},
            "flag": true,
        });
        assert_eq!(
            render_value(&args, &ctx).unwrap(),
            json!({
                "greeting": "Hi Ava",
                "count": 3,
                "nested": {"list": ["Ava", 7]},
                "flag": true,
            })
        );
    }

    #[test]
    fn test_render_value_surfaces_errors() {
        let ctx = context();
        assert!(matches!(
            render_value(&json!({"x": "${{ inputs.missing }}"}), &ctx),
            Err(ExpressionError::Evaluation(_))
        ));
        assert!(matches!(
            render_value(&json!(["${{ nope }}"]), &ctx),
            Err(ExpressionError::Parse(_))
        ));
    }
}
