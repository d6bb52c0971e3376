//! HTTP body utilities.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};

/// A type-erased HTTP body used for responses produced by applications and
/// by the endpoint itself (`404`, `429`, `500` synthesis).
pub struct Body(BoxBody<Bytes, crate::BoxError>);

impl Body {
    /// Create a new `Body` that wraps another [`http_body::Body`].
    pub fn new<B>(body: B) -> Self
    where
        B: HttpBody<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<crate::BoxError>,
    {
        Self(body.map_err(Into::into).boxed())
    }

    /// Create a new `Body` with no data.
    pub fn empty() -> Self {
        Self::new(Empty::new())
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::new(Full::from(bytes))
    }
}

impl From<String> for Body {
    fn from(body: String) -> Self {
        Self::new(Full::from(body))
    }
}

impl From<&'static str> for Body {
    fn from(body: &'static str) -> Self {
        Self::new(Full::from(body))
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = crate::BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.0).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.0.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.0.size_hint()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body").finish()
    }
}
