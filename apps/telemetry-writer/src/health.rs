use anyhow::Result;
use std::path::Path;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic_health::server::{health_reporter, HealthReporter};
use tonic_health::ServingStatus;

pub const SERVICE_NAME: &str = "telemetry-writer";

/// Serves gRPC health on a Unix socket. The service reports SERVING while
/// the subscriber holds an active subscription.
pub async fn serve_uds(
    socket_path: &str,
    subscribed: watch::Receiver<bool>,
    shutdown: CancellationToken,
) -> Result<()> {
    if Path::new(socket_path).exists() {
        tokio::fs::remove_file(socket_path).await.ok();
    }

    let uds = UnixListener::bind(socket_path)?;
    let (reporter, health_service) = health_reporter();
    let follower = tokio::spawn(follow_subscription(reporter, subscribed));

    let incoming = UnixListenerStream::new(uds);
    tracing::info!(socket = socket_path, "health endpoint listening");
    let served = Server::builder()
        .add_service(health_service)
        .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
        .await;

    follower.abort();
    tokio::fs::remove_file(socket_path).await.ok();
    served?;
    Ok(())
}

async fn follow_subscription(mut reporter: HealthReporter, mut subscribed: watch::Receiver<bool>) {
    loop {
        let status = if *subscribed.borrow_and_update() {
            ServingStatus::Serving
        } else {
            ServingStatus::NotServing
        };
        reporter.set_service_status(SERVICE_NAME, status).await;
        if subscribed.changed().await.is_err() {
            reporter
                .set_service_status(SERVICE_NAME, ServingStatus::NotServing)
                .await;
            break;
        }
    }
}
