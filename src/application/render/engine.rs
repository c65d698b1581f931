use std::{collections::BTreeMap, time::Instant};

use metrics::histogram;
use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use tracing::{debug, warn};

use crate::domain::{CompiledTemplate, logical_name};

use super::{RenderError, helpers, scope::Scope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Html,
    Literal,
}

/// Templates and partials of one builder, keyed by logical name.
#[derive(Debug)]
pub struct TemplateEngine {
    env: Environment<'static>,
    sources: BTreeMap<String, Source>,
    failed: BTreeMap<String, RenderError>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::Html);
        env.set_undefined_behavior(UndefinedBehavior::Lenient);
        env.set_keep_trailing_newline(true);
        helpers::register(&mut env);
        Self {
            env,
            sources: BTreeMap::new(),
            failed: BTreeMap::new(),
        }
    }

    /// Compiles an HTML template under the logical name of `file_name`,
    /// replacing any earlier template or literal partial of that name.
    ///
    /// A failed compile is remembered: rendering that name reports the
    /// compile error until a later compile succeeds.
    pub fn compile(
        &mut self,
        file_name: &str,
        source: &str,
    ) -> Result<CompiledTemplate, RenderError> {
        let name = logical_name(file_name).to_string();
        match self.env.add_template_owned(name.clone(), source.to_string()) {
            Ok(()) => {
                self.failed.remove(&name);
                self.sources.insert(name.clone(), Source::Html);
                debug!(
                    target = "staticplus::application::render",
                    template = %name,
                    "template compiled"
                );
                Ok(CompiledTemplate::new(name))
            }
            Err(err) => {
                let error = RenderError::Compile {
                    name: name.clone(),
                    message: format!("{err:#}"),
                };
                warn!(
                    target = "staticplus::application::render",
                    template = %name,
                    error = %error,
                    "template failed to compile"
                );
                self.failed.insert(name, error.clone());
                Err(error)
            }
        }
    }

    /// Registers non-HTML text (stylesheets, scripts) as a partial that is
    /// included verbatim. HTML templates of the same name take precedence.
    pub fn literal(&mut self, file_name: &str, text: &str) -> bool {
        let name = logical_name(file_name).to_string();
        if self.sources.get(&name) == Some(&Source::Html) {
            return false;
        }
        if text.contains("endraw") {
            debug!(
                target = "staticplus::application::render",
                partial = %name,
                "partial cannot be quoted; skipped"
            );
            return false;
        }
        let quoted = format!("{{% raw %}}{text}{{% endraw %}}");
        match self.env.add_template_owned(name.clone(), quoted) {
            Ok(()) => {
                self.sources.insert(name, Source::Literal);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name) || self.failed.contains_key(name)
    }

    /// Renders the template `name` against `scope`. Helpers are bound to
    /// the scope for this call only.
    pub fn render(&self, name: &str, scope: &Scope) -> Result<String, RenderError> {
        if let Some(error) = self.failed.get(name) {
            return Err(error.clone());
        }
        let started = Instant::now();

        let mut env = self.env.clone();
        helpers::register_markdown(&mut env, scope.clone());
        let template = env.get_template(name).map_err(|_| RenderError::Missing {
            name: name.to_string(),
        })?;
        let html = template
            .render(scope.value())
            .map_err(|err| RenderError::Execute {
                name: name.to_string(),
                message: format!("{err:#}"),
            })?;

        histogram!("staticplus_render_ms").record(started.elapsed().as_secs_f64() * 1000.0);
        Ok(html)
    }
}
