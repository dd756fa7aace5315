//! Wire surface for the port rendezvous.
//!
//! One connection per request. A publisher carries `?set=<port>`; a
//! consumer's request blocks until the key resolves and receives the
//! decimal text of the port as its sole payload.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use mlgrid_id::GroupId;

use super::{PortRendezvous, RendezvousKey};

#[derive(Debug, Deserialize)]
struct RendezvousQuery {
    /// Present on publisher requests: the port value to resolve to.
    set: Option<u16>,
}

/// Builds the rendezvous router.
pub fn router(rendezvous: Arc<PortRendezvous>) -> Router {
    Router::new()
        .route("/rendezvous/{group_id}/{port_name}", get(exchange))
        .layer(TraceLayer::new_for_http())
        .with_state(rendezvous)
}

/// Serves the rendezvous surface until shutdown is signaled.
pub async fn serve(
    rendezvous: Arc<PortRendezvous>,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "port rendezvous listening");

    axum::serve(listener, router(rendezvous))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

async fn exchange(
    State(rendezvous): State<Arc<PortRendezvous>>,
    Path((group_id, port_name)): Path<(String, String)>,
    Query(query): Query<RendezvousQuery>,
) -> Response {
    let group = match group_id.parse::<GroupId>() {
        Ok(group) => group,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid group id: {e}")).into_response()
        }
    };
    let key = RendezvousKey { group, port_name };

    match query.set {
        Some(port) => {
            rendezvous.publish(key, port);
            StatusCode::OK.into_response()
        }
        None => match rendezvous.await_port(key).await {
            Some(port) => port.to_string().into_response(),
            // Reset while waiting; the caller should retry against the new
            // generation.
            None => StatusCode::GONE.into_response(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), 1024).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn publisher_then_consumer_round_trip() {
        let rendezvous = Arc::new(PortRendezvous::new());
        let group = GroupId::new();

        let publish = Request::builder()
            .uri(format!("/rendezvous/{group}/c10d?set=29500"))
            .body(Body::empty())
            .unwrap();
        let response = router(Arc::clone(&rendezvous)).oneshot(publish).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let consume = Request::builder()
            .uri(format!("/rendezvous/{group}/c10d"))
            .body(Body::empty())
            .unwrap();
        let response = router(Arc::clone(&rendezvous)).oneshot(consume).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "29500");
    }

    #[tokio::test]
    async fn consumer_blocks_until_publish() {
        let rendezvous = Arc::new(PortRendezvous::new());
        let group = GroupId::new();

        let consumer = tokio::spawn({
            let rendezvous = Arc::clone(&rendezvous);
            let uri = format!("/rendezvous/{group}/c10d");
            async move {
                let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
                router(rendezvous).oneshot(request).await.unwrap()
            }
        });
        tokio::task::yield_now().await;

        rendezvous.publish(
            RendezvousKey {
                group,
                port_name: "c10d".to_string(),
            },
            31000,
        );

        let response = consumer.await.unwrap();
        assert_eq!(body_text(response).await, "31000");
    }

    #[tokio::test]
    async fn malformed_group_id_is_rejected() {
        let rendezvous = Arc::new(PortRendezvous::new());
        let request = Request::builder()
            .uri("/rendezvous/not-a-group/c10d?set=1")
            .body(Body::empty())
            .unwrap();
        let response = router(rendezvous).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
