use std::collections::HashMap;
use std::fmt;

use super::hostname::HostMap;
use super::{HostnameKey, PathKey};
use crate::Error;

/// A mount: one application made reachable at a host/path prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: HostnameKey,
    pub path: PathKey,
    pub application: String,
}

impl Mount {
    /// Parses an `at` pattern of the form `//<host-pattern>/<path>/`.
    ///
    /// A trailing `/*` is accepted and normalized away: every mount is
    /// wildcarded, matching its prefix plus any deeper path.
    pub fn parse(at: &str, application: impl Into<String>) -> Result<Self, Error> {
        let Some(rest) = at.strip_prefix("//") else {
            return Err(Error::config(format!("mount must start with '//': {at:?}")));
        };
        let Some(slash) = rest.find('/') else {
            return Err(Error::config(format!("mount is missing its path: {at:?}")));
        };
        let (host_part, path_part) = rest.split_at(slash);
        let host = HostnameKey::parse(host_part)?;
        let path = PathKey::parse_mount(path_part)?;
        Ok(Self {
            host,
            path: PathKey::new(path.components().to_vec(), true),
            application: application.into(),
        })
    }
}

impl fmt::Display for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "//{}{}", self.host, self.path.as_base_string())
    }
}

/// One match yielded by [`RoutingTable::find`]: the application name, the
/// matched prefix, and the remainder of the request path beyond it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub application: String,
    pub base: PathKey,
    pub extra: PathKey,
}

/// A two-level longest-prefix map from `(hostname, path)` to application
/// names.
///
/// The outer level keys on reversed hostname labels, so a front wildcard
/// (`*.example.com`) is a prefix relation; the inner level keys on path
/// components with trailing wildcards. Lookups walk both levels without
/// locking; the table is built at configuration time and immutable once the
/// owning endpoint starts.
#[derive(Debug, Default)]
pub struct RoutingTable {
    hosts: HostMap<PathNode>,
}

#[derive(Debug, Default)]
struct PathNode {
    children: HashMap<String, PathNode>,
    exact: Option<String>,
    wildcard: Option<String>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mount. Duplicate host/path pairs are a configuration error.
    pub fn insert_mount(&mut self, mount: &Mount) -> Result<(), Error> {
        self.insert(&mount.host, &mount.path, &mount.application)
    }

    /// Adds one `(host, path) -> application` entry.
    pub fn insert(
        &mut self,
        host: &HostnameKey,
        path: &PathKey,
        application: &str,
    ) -> Result<(), Error> {
        let paths = self
            .hosts
            .slot_mut(host)
            .get_or_insert_with(PathNode::default);

        let mut node = paths;
        for component in path.components() {
            node = node.children.entry(component.clone()).or_default();
        }
        let slot = if path.is_wildcard() {
            &mut node.wildcard
        } else {
            &mut node.exact
        };
        if slot.is_some() {
            return Err(Error::config(format!(
                "duplicate mount for //{host}{path}"
            )));
        }
        *slot = Some(application.to_owned());
        Ok(())
    }

    /// Looks up candidate applications for a request, most specific first.
    ///
    /// The host match is resolved once (exact beats wildcard, deeper
    /// wildcard beats shallower, bare `*` last); within it, matches iterate
    /// from the longest path prefix to the shortest, which is the
    /// fallthrough order when an application declines.
    pub fn find(&self, host: &str, path: &str) -> RouteMatches {
        let Some(paths) = self.hosts.find_name(host) else {
            return RouteMatches::empty();
        };

        let request = PathKey::from_request_path(path);
        let components = request.components();

        // Wildcard slots along the walk, shallowest first.
        let mut stack: Vec<(usize, &String)> = Vec::new();
        let mut node = Some(paths);
        if let Some(app) = paths.wildcard.as_ref() {
            stack.push((0, app));
        }
        for (depth, component) in components.iter().enumerate() {
            let Some(child) = node.and_then(|n| n.children.get(component)) else {
                node = None;
                break;
            };
            if let Some(app) = child.wildcard.as_ref() {
                stack.push((depth + 1, app));
            }
            node = Some(child);
        }

        let mut matches = Vec::new();
        if let Some(app) = node.and_then(|n| n.exact.as_ref()) {
            matches.push(route_match(components, components.len(), false, app));
        }
        for (depth, app) in stack.into_iter().rev() {
            matches.push(route_match(components, depth, true, app));
        }
        RouteMatches {
            matches: matches.into_iter(),
        }
    }
}

fn route_match(components: &[String], depth: usize, wildcard: bool, app: &str) -> RouteMatch {
    RouteMatch {
        application: app.to_owned(),
        base: PathKey::new(components[..depth].to_vec(), wildcard),
        extra: PathKey::new(components[depth..].to_vec(), false),
    }
}

/// Fallthrough cursor over the matches for one request, most specific
/// first.
#[derive(Debug)]
pub struct RouteMatches {
    matches: std::vec::IntoIter<RouteMatch>,
}

impl RouteMatches {
    fn empty() -> Self {
        Self {
            matches: Vec::new().into_iter(),
        }
    }
}

impl Iterator for RouteMatches {
    type Item = RouteMatch;

    fn next(&mut self) -> Option<Self::Item> {
        self.matches.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    fn table(mounts: &[(&str, &str)]) -> RoutingTable {
        let mut table = RoutingTable::new();
        for (at, app) in mounts {
            table
                .insert_mount(&Mount::parse(at, *app).unwrap())
                .unwrap();
        }
        table
    }

    fn apps(table: &RoutingTable, host: &str, path: &str) -> Vec<String> {
        table
            .find(host, path)
            .map(|route| route.application)
            .collect()
    }

    #[test]
    fn most_specific_path_wins() {
        let table = table(&[("//*/", "s1"), ("//*/florp/", "s2")]);

        let route = table
            .find("anything.example", "/florp/index.html")
            .next()
            .unwrap();
        assert_eq!(route.application, "s2");
        assert_eq!(route.base.as_base_string(), "/florp/");
        assert_eq!(route.extra.as_extra_string(), "/index.html");

        let route = table.find("anything.example", "/other.html").next().unwrap();
        assert_eq!(route.application, "s1");
        assert_eq!(route.base.as_base_string(), "/");
        assert_eq!(route.extra.as_extra_string(), "/other.html");
    }

    #[test]
    fn fallthrough_iterates_to_less_specific() {
        let table = table(&[("//*/", "s1"), ("//*/florp/", "s2")]);
        assert_eq!(apps(&table, "x.example", "/florp/nope"), ["s2", "s1"]);
        assert_eq!(apps(&table, "x.example", "/a/b/c"), ["s1"]);
    }

    #[test]
    fn specificity_strictly_decreases() {
        let table = table(&[
            ("//*/", "root"),
            ("//*/a/", "a"),
            ("//*/a/b/", "ab"),
            ("//*/a/b/c/", "abc"),
        ]);
        let bases: Vec<usize> = table
            .find("h.example", "/a/b/c/d")
            .map(|route| route.base.len())
            .collect();
        assert_eq!(bases, [3, 2, 1, 0]);
    }

    #[test]
    fn exact_host_beats_wildcard() {
        let table = table(&[
            ("//milk.com/", "exact"),
            ("//*.milk.com/", "subwild"),
            ("//*/", "any"),
        ]);
        assert_eq!(apps(&table, "milk.com", "/x"), ["exact"]);
        assert_eq!(apps(&table, "a.milk.com", "/x"), ["subwild"]);
        assert_eq!(apps(&table, "other.example", "/x"), ["any"]);
    }

    #[test]
    fn longest_host_wildcard_wins() {
        let table = table(&[("//*.b.example/", "deep"), ("//*.example/", "shallow")]);
        assert_eq!(apps(&table, "a.b.example", "/"), ["deep"]);
        assert_eq!(apps(&table, "c.example", "/"), ["shallow"]);
    }

    #[test]
    fn unmatched_host_yields_nothing() {
        let table = table(&[("//milk.com/", "only")]);
        assert!(apps(&table, "other.example", "/").is_empty());
    }

    #[test]
    fn duplicate_mounts_are_rejected() {
        let mut table = RoutingTable::new();
        let mount = Mount::parse("//*/florp/", "app").unwrap();
        table.insert_mount(&mount).unwrap();
        let again = Mount::parse("//*/florp/*", "other").unwrap();
        assert!(table.insert_mount(&again).is_err());
    }

    #[derive(Debug, Clone)]
    struct MountPattern(String);

    impl Arbitrary for MountPattern {
        fn arbitrary(g: &mut Gen) -> Self {
            let labels = ["com", "example", "milk", "a1", "x-y"];
            let comps = ["florp", "a", "b2", "x_y", "v1.2"];

            let host = if bool::arbitrary(g) {
                let mut host = String::new();
                if bool::arbitrary(g) {
                    host.push_str("*.");
                }
                let n = usize::arbitrary(g) % 3 + 1;
                for i in 0..n {
                    if i > 0 {
                        host.push('.');
                    }
                    host.push_str(g.choose(&labels).unwrap());
                }
                host
            } else {
                String::from("*")
            };

            let mut path = String::from("/");
            for _ in 0..(usize::arbitrary(g) % 3) {
                path.push_str(g.choose(&comps).unwrap());
                path.push('/');
            }
            if bool::arbitrary(g) {
                path.push('*');
            }
            MountPattern(format!("//{host}{path}"))
        }
    }

    #[quickcheck]
    fn mount_round_trips_normalized(pattern: MountPattern) -> bool {
        let mount = Mount::parse(&pattern.0, "app").unwrap();
        let rendered = mount.to_string();
        // Rendering is normalized; a second round trip is a fixed point.
        Mount::parse(&rendered, "app").unwrap().to_string() == rendered
            && Mount::parse(&rendered, "app").unwrap() == mount
    }
}
