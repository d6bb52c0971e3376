use std::fmt;

use crate::Error;

/// A URI path pattern: components plus a wildcard flag (a trailing `/*`).
///
/// Mount-point paths are further constrained: components draw from
/// alphanumerics plus `-_.` and start and end alphanumeric.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathKey {
    components: Vec<String>,
    wildcard: bool,
}

impl PathKey {
    pub fn new(components: Vec<String>, wildcard: bool) -> Self {
        Self {
            components,
            wildcard,
        }
    }

    /// Parses a mount-point path such as `/`, `/florp/`, or `/a/b/*`,
    /// enforcing the mount component charset.
    pub fn parse_mount(path: &str) -> Result<Self, Error> {
        let Some(rest) = path.strip_prefix('/') else {
            return Err(Error::config(format!("mount path must start with '/': {path:?}")));
        };
        let (rest, wildcard) = match rest.strip_suffix('*') {
            Some(rest) => match rest.strip_suffix('/') {
                Some(rest) => (rest, true),
                None if rest.is_empty() => (rest, true),
                None => {
                    return Err(Error::config(format!("malformed mount wildcard: {path:?}")))
                }
            },
            None => match rest.strip_suffix('/') {
                Some(rest) => (rest, false),
                None => (rest, false),
            },
        };
        let mut components = Vec::new();
        if !rest.is_empty() {
            for component in rest.split('/') {
                if !valid_mount_component(component) {
                    return Err(Error::config(format!(
                        "invalid mount path component {component:?} in {path:?}"
                    )));
                }
                components.push(component.to_owned());
            }
        }
        Ok(Self {
            components,
            wildcard,
        })
    }

    /// Splits a concrete request path into components, ignoring empty
    /// segments. The query string must already be stripped.
    pub fn from_request_path(path: &str) -> Self {
        let components = path
            .split('/')
            .filter(|component| !component.is_empty())
            .map(str::to_owned)
            .collect();
        Self {
            components,
            wildcard: false,
        }
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Renders with a leading slash and a trailing slash after the last
    /// component, the way mount bases read: `/florp/`, `/`.
    pub fn as_base_string(&self) -> String {
        let mut out = String::from("/");
        for component in &self.components {
            out.push_str(component);
            out.push('/');
        }
        out
    }

    /// Renders as a path remainder: `/index.html`, or `/` when empty.
    pub fn as_extra_string(&self) -> String {
        if self.components.is_empty() {
            return String::from("/");
        }
        let mut out = String::new();
        for component in &self.components {
            out.push('/');
            out.push_str(component);
        }
        out
    }
}

fn valid_mount_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let Some((&first, rest)) = bytes.split_first() else {
        return false;
    };
    let Some((&last, _)) = bytes.split_last() else {
        return false;
    };
    first.is_ascii_alphanumeric()
        && last.is_ascii_alphanumeric()
        && rest
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return f.write_str(if self.wildcard { "/*" } else { "/" });
        }
        for component in &self.components {
            write!(f, "/{component}")?;
        }
        if self.wildcard {
            f.write_str("/*")?;
        }
        Ok(())
    }
}
