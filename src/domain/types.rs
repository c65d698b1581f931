//! Build policies shared by configuration and the build pipeline.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// What happens to a page whose render step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderFailurePolicy {
    /// The build dies with the render error.
    Abort,
    /// The page body becomes the error diagnostic, served as `text/plain`.
    #[default]
    DiagnosticPage,
}

/// What happens when the feed reports a deleted document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletedPolicy {
    /// Log and drop the event; published output is left alone.
    #[default]
    Ignore,
    /// Remove the page previously derived from the document.
    Retract,
    /// Treat deletion as a fatal build error.
    Fail,
}

/// Which cached documents become pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueRule {
    /// Every non-design document, keyed by its id.
    #[default]
    EveryDocument,
    /// Only documents carrying a string `path`, keyed by that path.
    WithPath,
    /// Documents carrying both `path` and `template`, keyed by path.
    WithPathAndTemplate,
}

impl RenderFailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            RenderFailurePolicy::Abort => "abort",
            RenderFailurePolicy::DiagnosticPage => "diagnostic_page",
        }
    }
}

impl DeletedPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            DeletedPolicy::Ignore => "ignore",
            DeletedPolicy::Retract => "retract",
            DeletedPolicy::Fail => "fail",
        }
    }
}

impl QueueRule {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueRule::EveryDocument => "every_document",
            QueueRule::WithPath => "with_path",
            QueueRule::WithPathAndTemplate => "with_path_and_template",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPolicy {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} `{}`", self.kind, self.value)
    }
}

impl std::error::Error for UnknownPolicy {}

impl FromStr for RenderFailurePolicy {
    type Err = UnknownPolicy;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "abort" => Ok(Self::Abort),
            "diagnostic_page" | "diagnostic" => Ok(Self::DiagnosticPage),
            _ => Err(UnknownPolicy {
                kind: "render failure policy",
                value: value.to_string(),
            }),
        }
    }
}

impl FromStr for DeletedPolicy {
    type Err = UnknownPolicy;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "retract" => Ok(Self::Retract),
            "fail" => Ok(Self::Fail),
            _ => Err(UnknownPolicy {
                kind: "deleted document policy",
                value: value.to_string(),
            }),
        }
    }
}

impl FromStr for QueueRule {
    type Err = UnknownPolicy;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "every_document" | "all" => Ok(Self::EveryDocument),
            "with_path" | "path" => Ok(Self::WithPath),
            "with_path_and_template" => Ok(Self::WithPathAndTemplate),
            _ => Err(UnknownPolicy {
                kind: "queue rule",
                value: value.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policies_parse_from_config_spellings() {
        assert_eq!(
            "diagnostic-page".parse::<RenderFailurePolicy>(),
            Ok(RenderFailurePolicy::DiagnosticPage)
        );
        assert_eq!("Retract".parse::<DeletedPolicy>(), Ok(DeletedPolicy::Retract));
        assert_eq!("with_path".parse::<QueueRule>(), Ok(QueueRule::WithPath));
        let err = "sometimes".parse::<DeletedPolicy>().unwrap_err();
        assert_eq!(err.to_string(), "unknown deleted document policy `sometimes`");
    }
}
