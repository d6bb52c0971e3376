//! Hierarchical request routing: hostname and path keys, mount parsing, and
//! the two-level longest-prefix table with fallthrough.

mod hostname;
mod path;
mod table;

pub use hostname::HostnameKey;
pub(crate) use hostname::HostMap;
pub use path::PathKey;
pub use table::{Mount, RouteMatch, RouteMatches, RoutingTable};
