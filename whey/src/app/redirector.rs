use async_trait::async_trait;
use http::{header, Request, Response, StatusCode, Uri};
use serde::{Deserialize, Serialize};

use super::{Application, Dispatch, Outcome};
use crate::body::Body;
use crate::component::Component;
use crate::Error;

/// Options for `class = "redirector"` applications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectorConfig {
    /// Absolute URL prefix to redirect to. Must end with `/`.
    pub target: String,
}

/// An application that answers every request with a permanent redirect,
/// appending the dispatch remainder and query string to its target prefix.
pub struct Redirector {
    name: String,
    target: String,
}

impl Redirector {
    pub fn new(name: impl Into<String>, config: RedirectorConfig) -> Result<Self, Error> {
        let target = config.target;
        if !target.ends_with('/') {
            return Err(Error::config(format!(
                "redirector target must end with '/': {target:?}"
            )));
        }
        if target.parse::<Uri>().is_err() {
            return Err(Error::config(format!(
                "redirector target is not a valid URL: {target:?}"
            )));
        }
        Ok(Self {
            name: name.into(),
            target,
        })
    }
}

#[async_trait]
impl Component for Redirector {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Application for Redirector {
    async fn handle(&self, request: &Request<Body>, dispatch: &Dispatch) -> Outcome {
        let mut location = format!("{}{}", self.target, dispatch.extra.components().join("/"));
        if let Some(query) = request.uri().query() {
            location.push('?');
            location.push_str(query);
        }

        let response = Response::builder()
            .status(StatusCode::PERMANENT_REDIRECT)
            .header(header::LOCATION, location)
            .body(Body::empty());
        match response {
            Ok(response) => Outcome::Handled(response),
            Err(error) => Outcome::Error(error.into()),
        }
    }
}
