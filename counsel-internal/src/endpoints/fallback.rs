use axum::extract::Request;

use crate::error::{Error, ErrorDetails};

pub async fn handle_404(req: Request) -> Error {
    Error::new(ErrorDetails::RouteNotFound {
        path: req.uri().path().to_string(),
        method: req.method().to_string(),
    })
}
