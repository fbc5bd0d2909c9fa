//! JSON-lines bridge to an external worker pool.
//!
//! Dispatched work leaves on stdout, one envelope per line; worker progress
//! comes back on stdin as [`DispatchEvent`] lines:
//!
//! ```text
//! → {"dispatch_id":"…","run_id":"…","queue":"backup",…,"expires_at":"…"}
//! ← {"event":"started","run_id":"…","dispatch_id":"…"}
//! ← {"event":"completed","run_id":"…","result":{"devices":12}}
//! ```

use std::io::BufRead;
use std::sync::Arc;

use cadence_scheduler::{dispatch::LaneReceivers, Clock, DispatchEnvelope, DispatchEvent};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Buffered lines between the lane forwarders and the stdout writer.
const OUTBOUND_BUFFER: usize = 256;

/// Serialize one envelope as a single output line (no trailing newline).
pub fn envelope_line(envelope: &DispatchEnvelope) -> serde_json::Result<String> {
    serde_json::to_string(envelope)
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_event_line(line: &str) -> serde_json::Result<Option<DispatchEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

/// Forward every lane to stdout until shutdown. Envelopes that expired while
/// queued are dropped; the janitor fails their runs after the TTL.
pub async fn forward_lanes(
    lanes: LaneReceivers,
    clock: Arc<dyn Clock>,
    shutdown: watch::Receiver<bool>,
) {
    let (line_tx, mut line_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    for (queue, mut lane) in lanes {
        let line_tx = line_tx.clone();
        let clock = clock.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    envelope = lane.recv() => {
                        let Some(envelope) = envelope else { break };
                        if envelope.is_expired(clock.now()) {
                            warn!(%queue, run_id = %envelope.request.run_id, "dropping expired envelope");
                            continue;
                        }
                        match envelope_line(&envelope) {
                            Ok(line) => {
                                if line_tx.send(line).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => error!(%queue, "envelope serialization failed: {e}"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(%queue, "lane forwarder stopped");
        });
    }
    drop(line_tx);

    let mut stdout = tokio::io::stdout();
    while let Some(line) = line_rx.recv().await {
        let written = async {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await
        }
        .await;
        if let Err(e) = written {
            error!("stdout closed, stopping lane bridge: {e}");
            break;
        }
    }
    info!("lane bridge stopped");
}

/// Read worker events from stdin on a dedicated thread and hand them to the
/// completion listener.
///
/// A plain thread rather than a runtime task: a blocked stdin read must not
/// hold up runtime shutdown. The thread ends at EOF or once the listener is
/// gone.
pub fn read_events(events: mpsc::Sender<DispatchEvent>) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("cadence-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        error!("reading stdin failed: {e}");
                        return;
                    }
                };
                match parse_event_line(&line) {
                    Ok(Some(event)) => {
                        if events.blocking_send(event).is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("ignoring malformed event line: {e}"),
                }
            }
            info!("stdin closed, no more worker events");
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_scheduler::{DispatchRequest, JobType, Parameters, Queue};
    use chrono::{TimeZone, Utc};

    #[test]
    fn envelope_line_is_flat_json() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let envelope = DispatchEnvelope {
            dispatch_id: "d-1".into(),
            request: DispatchRequest {
                run_id: "r-1".into(),
                template_ref: "tpl".into(),
                job_type: JobType::Backup,
                parameters: Parameters::new(),
                target_scope: vec!["sw-1".into()],
                queue: Queue::Backup,
            },
            submitted_at: at,
            expires_at: at + chrono::Duration::hours(1),
        };
        let line = envelope_line(&envelope).unwrap();
        assert!(!line.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["run_id"], "r-1");
        assert_eq!(value["queue"], "backup");
        assert_eq!(value["job_type"], "backup");
    }

    #[test]
    fn event_lines_parse_or_are_skipped() {
        assert!(parse_event_line("   ").unwrap().is_none());
        assert!(parse_event_line("not json").is_err());
        let event = parse_event_line(r#"{"event":"failed","run_id":"r-1","error":"timeout"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            DispatchEvent::Failed {
                run_id: "r-1".into(),
                error: "timeout".into()
            }
        );
    }
}
