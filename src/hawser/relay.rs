use std::time::Duration;

use tokio::{io::AsyncWriteExt, time};

use crate::hawser::session::BoxedStream;

/// How one proxied connection ended. All variants converge on the same
/// terminal action: both sides are shut down and dropped, exactly once.
#[derive(Debug)]
pub enum RelayOutcome {
    /// One side reached EOF and both directions drained.
    Closed { to_dialed: u64, to_accepted: u64 },
    /// The absolute deadline elapsed before the transfer finished.
    TimedOut,
    /// A read or write failed mid-transfer.
    Failed(std::io::Error),
}

struct ActiveConnGuard;

impl ActiveConnGuard {
    fn new() -> Self {
        metrics::counter!("hawser_connections_total").increment(1);
        metrics::gauge!("hawser_active_connections").increment(1.0);
        Self
    }
}

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        metrics::gauge!("hawser_active_connections").decrement(1.0);
    }
}

/// Copy bytes between the accepted and dialed sides until either direction
/// completes, bounded by one absolute deadline covering the whole pair.
///
/// The deadline applies symmetrically to both sides and bounds the worst-case
/// lifetime of a stalled connection even if no byte ever flows. Errors are
/// terminal for this connection only; retrying is the accept loop's business,
/// and only for the next connection.
pub async fn relay(
    mut accepted: BoxedStream,
    mut dialed: BoxedStream,
    idle_timeout: Duration,
) -> RelayOutcome {
    let _active = ActiveConnGuard::new();

    let copy = tokio::io::copy_bidirectional(&mut accepted, &mut dialed);

    let outcome = if idle_timeout > Duration::from_millis(0) {
        match time::timeout(idle_timeout, copy).await {
            Ok(Ok((to_dialed, to_accepted))) => RelayOutcome::Closed {
                to_dialed,
                to_accepted,
            },
            Ok(Err(err)) => RelayOutcome::Failed(err),
            Err(_) => RelayOutcome::TimedOut,
        }
    } else {
        match copy.await {
            Ok((to_dialed, to_accepted)) => RelayOutcome::Closed {
                to_dialed,
                to_accepted,
            },
            Err(err) => RelayOutcome::Failed(err),
        }
    };

    // Best-effort shutdown before drop; already-closed is not an error.
    let _ = accepted.shutdown().await;
    let _ = dialed.shutdown().await;

    if let RelayOutcome::Closed {
        to_dialed,
        to_accepted,
    } = &outcome
    {
        metrics::counter!("hawser_bytes_outbound_total").increment(*to_dialed);
        metrics::counter!("hawser_bytes_inbound_total").increment(*to_accepted);
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn relays_bytes_both_ways_until_eof() {
        let (mut client, accepted_side) = tokio::io::duplex(1024);
        let (dialed_side, mut upstream) = tokio::io::duplex(1024);

        let task = tokio::spawn(relay(
            Box::new(accepted_side),
            Box::new(dialed_side),
            Duration::from_secs(5),
        ));

        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();

        let mut req = vec![0u8; 4];
        upstream.read_exact(&mut req).await.unwrap();
        assert_eq!(&req, b"ping");

        upstream.write_all(b"pong!").await.unwrap();
        drop(upstream);

        let mut resp = Vec::new();
        client.read_to_end(&mut resp).await.unwrap();
        assert_eq!(&resp, b"pong!");

        match task.await.unwrap() {
            RelayOutcome::Closed {
                to_dialed,
                to_accepted,
            } => {
                assert_eq!(to_dialed, 4);
                assert_eq!(to_accepted, 5);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn idle_pair_is_cut_at_the_deadline() {
        let (mut client, accepted_side) = tokio::io::duplex(64);
        let (dialed_side, mut upstream) = tokio::io::duplex(64);

        let started = tokio::time::Instant::now();
        let outcome = relay(
            Box::new(accepted_side),
            Box::new(dialed_side),
            Duration::from_millis(100),
        )
        .await;

        assert!(matches!(outcome, RelayOutcome::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(2));

        // Both sides were dropped: the peers observe EOF.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(upstream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deadline_bounds_active_connections_too() {
        let (mut client, accepted_side) = tokio::io::duplex(1024);
        let (dialed_side, mut upstream) = tokio::io::duplex(1024);

        let task = tokio::spawn(relay(
            Box::new(accepted_side),
            Box::new(dialed_side),
            Duration::from_millis(200),
        ));

        // Keep trickling data; the absolute deadline must still fire.
        let feeder = tokio::spawn(async move {
            loop {
                if client.write_all(b"x").await.is_err() {
                    break;
                }
                let mut buf = [0u8; 16];
                let _ = upstream.read(&mut buf).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let outcome = task.await.unwrap();
        assert!(matches!(outcome, RelayOutcome::TimedOut));
        feeder.abort();
    }

    #[tokio::test]
    async fn zero_timeout_disables_the_deadline() {
        let (mut client, accepted_side) = tokio::io::duplex(64);
        let (dialed_side, upstream) = tokio::io::duplex(64);

        let task = tokio::spawn(relay(
            Box::new(accepted_side),
            Box::new(dialed_side),
            Duration::from_millis(0),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        client.shutdown().await.unwrap();
        drop(upstream);

        assert!(matches!(
            task.await.unwrap(),
            RelayOutcome::Closed { .. } | RelayOutcome::Failed(_)
        ));
    }
}
