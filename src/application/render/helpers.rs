use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use comrak::options::Options;
use minijinja::{Environment, Error, ErrorKind, HtmlEscape, State, Value, value::Kwargs};

use super::scope::Scope;

/// Names reserved for helpers; scope keys with these names are dropped.
pub const HELPER_NAMES: &[&str] = &["markdown", "link", "button", "css_class"];

const DEFAULT_CSS_CLASS: &str = "landing";

/// Markdown rendered from inside markdown nests at most this deep.
const MAX_MARKDOWN_DEPTH: usize = 16;

pub(crate) fn markdown_options() -> Options<'static> {
    let mut options = Options::default();
    let ext = &mut options.extension;
    ext.strikethrough = true;
    ext.table = true;
    ext.autolink = true;
    ext.tasklist = true;
    options.render.r#unsafe = true;
    options
}

/// Scope-independent helpers, registered once on the shared environment.
pub(crate) fn register(env: &mut Environment<'static>) {
    env.add_function("link", link);
    env.add_function("button", button);
    env.add_function("css_class", css_class);
}

/// `markdown` needs the page scope, so it is bound per render.
pub(crate) fn register_markdown(env: &mut Environment<'static>, scope: Scope) {
    let depth = Arc::new(AtomicUsize::new(0));

    let function_scope = scope.clone();
    let function_depth = Arc::clone(&depth);
    env.add_function(
        "markdown",
        move |state: &State, body: Option<String>, kwargs: Kwargs| -> Result<Value, Error> {
            let key: Option<String> = kwargs.get("key")?;
            kwargs.assert_all_used()?;
            render_markdown(state, &function_scope, body, key, &function_depth)
        },
    );
    env.add_filter(
        "markdown",
        move |state: &State, body: String| -> Result<Value, Error> {
            render_markdown(state, &scope, Some(body), None, &depth)
        },
    );
}

fn render_markdown(
    state: &State,
    scope: &Scope,
    body: Option<String>,
    key: Option<String>,
    depth: &AtomicUsize,
) -> Result<Value, Error> {
    let source = match &key {
        Some(key) => scope.str_value(key),
        None => body,
    };
    let Some(source) = source else {
        return Ok(Value::from_safe_string(String::new()));
    };

    if depth.fetch_add(1, Ordering::SeqCst) >= MAX_MARKDOWN_DEPTH {
        depth.fetch_sub(1, Ordering::SeqCst);
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            "markdown nested too deeply",
        ));
    }
    let html = comrak::markdown_to_html(&source, &markdown_options());
    let rendered = state.env().render_str(&html, scope.value());
    depth.fetch_sub(1, Ordering::SeqCst);
    let rendered = rendered?;

    let output = match key {
        Some(key) => edit_wrapper(scope.id(), &key, &rendered),
        None => rendered,
    };
    Ok(Value::from_safe_string(output))
}

/// Marks markdown rendered from a document field so an editor can find it.
fn edit_wrapper(id: &str, key: &str, html: &str) -> String {
    format!(
        "<div class=\"edit\" data-id={} data-key={}>{html}</div>",
        json_attr(id),
        json_attr(key)
    )
}

fn link(kwargs: Kwargs) -> Result<Value, Error> {
    let to: Option<String> = kwargs.get("to")?;
    let label: Option<String> = kwargs.get("label")?;
    let text: Option<String> = kwargs.get("text")?;
    let kind: Option<String> = kwargs.get("type")?;
    kwargs.assert_all_used()?;

    let label = label.or(text).unwrap_or_default();
    let kind = kind.unwrap_or_default();
    let inner = if kind == "button" {
        boxed(&label).join("<br>")
    } else {
        escape(&label)
    };
    Ok(Value::from_safe_string(format!(
        "<a class={} href=\"{}\">{inner}</a>",
        json_attr(&kind),
        escape(to.as_deref().unwrap_or_default())
    )))
}

fn button(kwargs: Kwargs) -> Result<Value, Error> {
    let label: Option<String> = kwargs.get("label")?;
    let kind: Option<String> = kwargs.get("type")?;
    let class: Option<String> = kwargs.get("class")?;
    kwargs.assert_all_used()?;

    Ok(Value::from_safe_string(format!(
        "<button type={} class={}>{}</button>",
        json_attr(kind.as_deref().unwrap_or("button")),
        json_attr(class.as_deref().unwrap_or_default()),
        boxed(label.as_deref().unwrap_or_default()).join("<br>")
    )))
}

fn css_class(value: Option<String>) -> String {
    let value = value
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_CSS_CLASS.to_string());
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// A label drawn inside an ASCII box, one string per line.
pub fn boxed(label: &str) -> [String; 3] {
    let escaped = escape(label);
    let edge = format!("+{}+", "-".repeat(label.chars().count()));
    [edge.clone(), format!("|{escaped}|"), edge]
}

fn json_attr(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    quoted.replace('<', "\\u003c").replace('>', "\\u003e")
}

fn escape(text: &str) -> String {
    HtmlEscape(text).to_string()
}
