use axum::extract::State;
use http::StatusCode;
use tokio_util::sync::CancellationToken;

pub(super) async fn readyz(State(ready): State<CancellationToken>) -> (StatusCode, &'static str) {
    if ready.is_cancelled() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}
