//! The application interface: the seam concrete request handlers plug into.

mod redirector;

pub use redirector::Redirector;

use async_trait::async_trait;
use http::Request;

use crate::body::Body;
use crate::component::Component;
use crate::routing::PathKey;
use crate::BoxError;

/// What a routing lookup resolved for one candidate application: the
/// matched mount prefix and the remainder of the request path beyond it.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub base: PathKey,
    pub extra: PathKey,
}

/// The tri-state result of an application handling attempt.
pub enum Outcome {
    /// The application produced a response.
    Handled(http::Response<Body>),
    /// The application did not serve this request; routing continues with
    /// the next less-specific mount.
    Declined,
    /// The handler failed. The endpoint translates this to a `500` and
    /// logs the error code.
    Error(BoxError),
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Handled(response) => {
                f.debug_tuple("Handled").field(&response.status()).finish()
            }
            Outcome::Declined => f.write_str("Declined"),
            Outcome::Error(error) => f.debug_tuple("Error").field(error).finish(),
        }
    }
}

/// A mounted request handler.
///
/// Applications are full lifecycle participants: they are initialized,
/// started, and stopped by the component tree like any service. `handle`
/// takes the request by reference so a declining application leaves it
/// intact for the next candidate.
#[async_trait]
pub trait Application: Component {
    async fn handle(&self, request: &Request<Body>, dispatch: &Dispatch) -> Outcome;
}
