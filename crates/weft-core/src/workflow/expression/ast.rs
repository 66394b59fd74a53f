//! Expression syntax tree.

use std::fmt;

/// One step of a reference path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accessor {
    /// `.name` or `['name']`.
    Key(String),
    /// `[3]` or `[-1]`; negative values count from the end.
    Index(i64),
}

impl fmt::Display for Accessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Accessor::Key(key) if is_plain_name(key) => write!(f, ".{key}"),
            Accessor::Key(key) => write!(f, "['{}']", key.replace('\\', "\\\\").replace('\'', "\\'")),
            Accessor::Index(i) => write!(f, "[{i}]"),
        }
    }
}

fn is_plain_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && !matches!(s, "and" | "or" | "not" | "if" | "else")
}

/// Parsed `${{ ... }}` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// `inputs.<name><path>`
    Input { name: String, path: Vec<Accessor> },
    /// `steps.<step>.output<path>`
    Step { step: String, path: Vec<Accessor> },
    /// `item<path>`
    Item(Vec<Accessor>),
    /// `index`
    Index,
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    /// `then if condition else otherwise`
    Ternary {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

/// A root reference found in an expression, used for static analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference<'a> {
    Input(&'a str),
    Step(&'a str),
    Item,
    Index,
}

impl Expr {
    /// Every reference in the expression, in source order.
    pub fn references(&self) -> Vec<Reference<'_>> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<Reference<'a>>) {
        match self {
            Expr::Input { name, .. } => out.push(Reference::Input(name)),
            Expr::Step { step, .. } => out.push(Reference::Step(step)),
            Expr::Item(_) => out.push(Reference::Item),
            Expr::Index => out.push(Reference::Index),
            Expr::Not(inner) => inner.collect_references(out),
            Expr::And(items) | Expr::Or(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => {
                then.collect_references(out);
                condition.collect_references(out);
                otherwise.collect_references(out);
            }
        }
    }
}

/// Render a root plus accessor path, e.g. `steps.build.output.files[0]`.
pub(crate) fn render_path(root: &str, path: &[Accessor]) -> String {
    let mut rendered = root.to_string();
    for accessor in path {
        rendered.push_str(&accessor.to_string());
    }
    rendered
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Input { name, path } => {
                let root = render_path("inputs", &[Accessor::Key(name.clone())]);
                write!(f, "{}", render_path(&root, path))
            }
            Expr::Step { step, path } => {
                let root = render_path(
                    "steps",
                    &[Accessor::Key(step.clone()), Accessor::Key("output".to_string())],
                );
                write!(f, "{}", render_path(&root, path))
            }
            Expr::Item(path) => write!(f, "{}", render_path("item", path)),
            Expr::Index => f.write_str("index"),
            Expr::Not(inner) => write!(f, "not {inner}"),
            Expr::And(items) => write_joined(f, items, " and "),
            Expr::Or(items) => write_joined(f, items, " or "),
            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => write!(f, "{then} if {condition} else {otherwise}"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[Expr], sep: &str) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}
