//! Switch event stream
//!
//! WebSocket consumer for the switch's event feed: call offers, answer
//! confirmations, playback completion, hangups and DTMF. Reconnects with
//! backoff; events are forwarded as typed values on a channel the engine
//! drains.

use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::types::ChannelId;

/// Typed view of the switch's event feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchEvent {
    /// A new channel entered our application
    CallOffered {
        channel: ChannelId,
        caller: Option<String>,
    },
    /// The channel was answered
    ChannelAnswered { channel: ChannelId },
    /// An artifact finished playing on the channel
    PlaybackFinished { channel: ChannelId },
    /// The channel went away (caller hangup or switch teardown)
    ChannelDestroyed { channel: ChannelId },
    /// DTMF digit pressed
    Dtmf { channel: ChannelId, digit: char },
}

#[derive(Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    channel: Option<String>,
    caller: Option<String>,
    digit: Option<String>,
}

fn parse_event(text: &str) -> Option<SwitchEvent> {
    let wire: WireEvent = match serde_json::from_str(text) {
        Ok(wire) => wire,
        Err(e) => {
            // Malformed envelope: count and drop, never disturb the calls
            warn!(error = %e, "unparseable switch event");
            return None;
        }
    };
    let channel = ChannelId(wire.channel?);

    match wire.kind.as_str() {
        "StasisStart" | "CallOffered" => Some(SwitchEvent::CallOffered {
            channel,
            caller: wire.caller,
        }),
        "ChannelStateChange" | "ChannelAnswered" => {
            Some(SwitchEvent::ChannelAnswered { channel })
        }
        "PlaybackFinished" => Some(SwitchEvent::PlaybackFinished { channel }),
        "StasisEnd" | "ChannelDestroyed" => Some(SwitchEvent::ChannelDestroyed { channel }),
        "ChannelDtmfReceived" => {
            let digit = wire.digit.and_then(|d| d.chars().next())?;
            Some(SwitchEvent::Dtmf { channel, digit })
        }
        other => {
            debug!(kind = other, "ignoring switch event");
            None
        }
    }
}

/// Connect to the switch event socket and pump events until shutdown.
/// Reconnects with capped exponential backoff.
pub fn spawn_event_stream(
    ws_url: String,
    events: mpsc::UnboundedSender<SwitchEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut backoff = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                break;
            }

            match connect_async(ws_url.as_str()).await {
                Ok((mut stream, _)) => {
                    info!(url = %ws_url, "switch event stream connected");
                    backoff = Duration::from_secs(1);

                    loop {
                        tokio::select! {
                            message = stream.next() => match message {
                                Some(Ok(Message::Text(text))) => {
                                    if let Some(event) = parse_event(text.as_str()) {
                                        if events.send(event).is_err() {
                                            return;
                                        }
                                    }
                                }
                                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                                Some(Ok(Message::Close(_))) | None => {
                                    warn!("switch event stream closed");
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!(error = %e, "switch event stream error");
                                    break;
                                }
                            },
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "switch event connection failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            backoff = (backoff * 2).min(Duration::from_secs(30));
        }
        debug!("switch event stream stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_call_offered() {
        let event = parse_event(
            r#"{"type":"StasisStart","channel":"chan-42","caller":"+15550100"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            SwitchEvent::CallOffered {
                channel: ChannelId::from("chan-42"),
                caller: Some("+15550100".into()),
            }
        );
    }

    #[test]
    fn test_parse_playback_finished() {
        let event =
            parse_event(r#"{"type":"PlaybackFinished","channel":"chan-42"}"#).unwrap();
        assert_eq!(
            event,
            SwitchEvent::PlaybackFinished {
                channel: ChannelId::from("chan-42")
            }
        );
    }

    #[test]
    fn test_parse_dtmf() {
        let event =
            parse_event(r#"{"type":"ChannelDtmfReceived","channel":"c","digit":"7"}"#).unwrap();
        assert_eq!(
            event,
            SwitchEvent::Dtmf {
                channel: ChannelId::from("c"),
                digit: '7'
            }
        );
    }

    #[test]
    fn test_unknown_and_malformed_dropped() {
        assert!(parse_event(r#"{"type":"SomethingElse","channel":"c"}"#).is_none());
        assert!(parse_event("not json at all").is_none());
        assert!(parse_event(r#"{"type":"StasisStart"}"#).is_none());
    }
}
