//! Load failures.

/// Error produced while loading a module or one of its dependencies.
///
/// Cloneable because a single in-flight load is shared by every caller that
/// requested the same URL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("Not found: {url}")]
    NotFound { url: String },

    #[error("Failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("Failed to compile {url} (line {line}): {message}")]
    Transform {
        url: String,
        line: usize,
        message: String,
    },

    /// Module code failed at run time. `stack` lists the importer chain,
    /// innermost module first.
    #[error("{message}")]
    Execution {
        url: String,
        message: String,
        stack: Vec<String>,
    },

    #[error("Could not resolve package '{specifier}' imported by {importer}")]
    Package { specifier: String, importer: String },

    #[error("Load of {url} was cancelled")]
    Cancelled { url: String },
}

impl LoadError {
    /// Stable machine-readable code, where one exists.
    #[must_use]
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::NotFound { .. } => Some("NOT_FOUND"),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// URL of the module the error originated in.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::NotFound { url }
            | Self::Fetch { url, .. }
            | Self::Transform { url, .. }
            | Self::Execution { url, .. }
            | Self::Cancelled { url } => url,
            Self::Package { importer, .. } => importer,
        }
    }

    /// Human-readable trace: the message followed by one `at` line per module.
    #[must_use]
    pub fn trace(&self) -> String {
        let mut out = self.to_string();
        match self {
            Self::Execution { stack, .. } if !stack.is_empty() => {
                for url in stack {
                    out.push_str("\n    at ");
                    out.push_str(url);
                }
            }
            _ => {
                out.push_str("\n    at ");
                out.push_str(self.url());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_code() {
        let err = LoadError::NotFound {
            url: "/_app/routes/missing.mod".to_string(),
        };
        assert_eq!(err.code(), Some("NOT_FOUND"));
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Not found: /_app/routes/missing.mod");
    }

    #[test]
    fn test_trace_lists_importer_chain() {
        let err = LoadError::Execution {
            url: "/c.mod".to_string(),
            message: "boom".to_string(),
            stack: vec!["/c.mod".to_string(), "/b.mod".to_string(), "/a.mod".to_string()],
        };
        assert_eq!(err.code(), None);
        assert_eq!(err.trace(), "boom\n    at /c.mod\n    at /b.mod\n    at /a.mod");
    }

    #[test]
    fn test_trace_without_stack_uses_url() {
        let err = LoadError::Package {
            specifier: "left-pad".to_string(),
            importer: "/a.mod".to_string(),
        };
        assert!(err.trace().ends_with("\n    at /a.mod"));
    }
}
