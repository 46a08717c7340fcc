//! Multi-key operator.
//!
//! Commands that name keys on different slots (`MGET`, `MSET`, `DEL`) cannot
//! be forwarded whole. The operator splits them into per-key sub-requests,
//! routes each through the dispatcher like any other request, joins the
//! replies in argument order, and delivers one combined reply under the
//! originating sequence number so client-visible ordering is untouched.

use std::collections::BTreeMap;

use ferry_core::{key_slot, Slot};
use ferry_resp::{command_frame, Command, RespValue};
use tokio::sync::mpsc;
use tracing::debug;

use crate::dispatcher::DispatcherHandle;
use crate::error::ProxyResult;
use crate::request::{PipelineRequest, PipelineResponse};

/// Runs the multi-key command in its own task.
pub(crate) fn handle(
    command: Command,
    seq: u64,
    back: mpsc::Sender<PipelineResponse>,
    dispatcher: DispatcherHandle,
) {
    tokio::spawn(async move {
        debug!(command = command.name(), seq, "fanning out multi-key command");
        let payload = execute(&command, &dispatcher).await;
        let req = PipelineRequest::new(command.into_raw(), Slot::new(0), seq, back);
        req.respond(payload).await;
    });
}

/// Fans out the sub-requests and combines their replies.
async fn execute(command: &Command, dispatcher: &DispatcherHandle) -> ProxyResult<RespValue> {
    let Some(subs) = split(command) else {
        return Ok(RespValue::error(format!(
            "ERR wrong number of arguments for '{}' command",
            command.name().to_ascii_lowercase()
        )));
    };

    let count = subs.len();
    let (sub_tx, mut sub_rx) = mpsc::channel(count);
    for (index, (key, frame)) in subs.into_iter().enumerate() {
        let req = PipelineRequest::new(frame, key_slot(&key), index as u64, sub_tx.clone());
        dispatcher.schedule(req).await;
    }
    drop(sub_tx);

    let mut replies: BTreeMap<u64, ProxyResult<RespValue>> = BTreeMap::new();
    while let Some(resp) = sub_rx.recv().await {
        replies.insert(resp.req.seq, resp.payload);
    }

    combine(command.name(), replies.into_values().collect())
}

/// Splits a multi-key command into `(key, sub-request frame)` pairs.
fn split(command: &Command) -> Option<Vec<(Vec<u8>, bytes::Bytes)>> {
    let args = command.args();
    match command.name() {
        "MGET" | "DEL" if args.len() > 1 => {
            let op: &[u8] = if command.name() == "MGET" { b"GET" } else { b"DEL" };
            Some(
                args[1..]
                    .iter()
                    .map(|key| (key.to_vec(), command_frame(&[op, &key[..]])))
                    .collect(),
            )
        }
        "MSET" if args.len() > 2 && args.len() % 2 == 1 => Some(
            args[1..]
                .chunks(2)
                .map(|pair| {
                    (
                        pair[0].to_vec(),
                        command_frame(&[b"SET", &pair[0][..], &pair[1][..]]),
                    )
                })
                .collect(),
        ),
        _ => None,
    }
}

/// Combines sub-replies into the single client-facing reply.
///
/// The first failed sub-request fails the whole command; the first error
/// *reply* (a redirection, say) is surfaced as the combined reply.
fn combine(name: &str, replies: Vec<ProxyResult<RespValue>>) -> ProxyResult<RespValue> {
    let mut values = Vec::with_capacity(replies.len());
    for reply in replies {
        let value = reply?;
        if value.as_error().is_some() {
            return Ok(value);
        }
        values.push(value);
    }

    match name {
        "MGET" => Ok(RespValue::Array(values)),
        "MSET" => Ok(RespValue::ok()),
        "DEL" => {
            let mut removed = 0;
            for value in values {
                if let RespValue::Integer(n) = value {
                    removed += n;
                }
            }
            Ok(RespValue::Integer(removed))
        }
        _ => Ok(RespValue::error("ERR unsupported multi-key command")),
    }
}
