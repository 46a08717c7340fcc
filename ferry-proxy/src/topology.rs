//! Topology queries against the cluster.
//!
//! The proxy learns slot ownership by issuing the topology query (`CLUSTER
//! SLOTS`) to its startup nodes, first one to answer wins. The reply is an
//! array of range entries:
//!
//! ```text
//! 1) 1) (integer) start
//!    2) (integer) end
//!    3) 1) "master-ip"  2) (integer) port  ...
//!    4) 1) "replica-ip" 2) (integer) port ...   (zero or more)
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use ferry_core::{Slot, SLOT_COUNT};
use ferry_resp::{cluster_slots_frame, decode_value, RespValue};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;

use crate::error::{ProxyError, ProxyResult};
use crate::pool::ConnPool;
use crate::request::SlotInfo;

/// Queries each startup node in order until one answers, and parses the
/// reply into slot range assignments.
///
/// # Errors
///
/// Returns `AllNodesFailed` if every node fails, or a parse error if a node
/// answers with a malformed reply.
pub async fn fetch_slot_table(
    pool: &ConnPool,
    nodes: &[Arc<str>],
    read_timeout: Duration,
) -> ProxyResult<Vec<SlotInfo>> {
    for addr in nodes {
        match query_node(pool, addr, read_timeout).await {
            Ok(infos) => return Ok(infos),
            Err(err) => {
                warn!(addr = %addr, error = %err, "topology query failed, trying next startup node");
            }
        }
    }
    Err(ProxyError::AllNodesFailed)
}

/// Runs the topology query against one node.
async fn query_node(
    pool: &ConnPool,
    addr: &Arc<str>,
    read_timeout: Duration,
) -> ProxyResult<Vec<SlotInfo>> {
    let mut conn = pool.get(addr).await?;
    conn.write_all(&cluster_slots_frame()).await?;
    conn.flush().await?;

    let mut buf = BytesMut::with_capacity(16 * 1024);
    let reply = loop {
        if let Some(value) = decode_value(&mut buf)? {
            break value;
        }
        let read = tokio::time::timeout(read_timeout, conn.read_buf(&mut buf))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "topology query timed out")
            })?;
        if read? == 0 {
            return Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during topology query",
            )));
        }
    };

    let infos = parse_slot_infos(&reply)?;
    pool.release(addr, conn).await;
    Ok(infos)
}

/// Parses a topology reply into slot range assignments.
///
/// # Errors
///
/// Returns `Topology` if the reply does not have the documented shape.
pub fn parse_slot_infos(reply: &RespValue) -> ProxyResult<Vec<SlotInfo>> {
    let RespValue::Array(entries) = reply else {
        return Err(malformed("reply is not an array"));
    };

    let mut infos = Vec::with_capacity(entries.len());
    for entry in entries {
        let RespValue::Array(fields) = entry else {
            return Err(malformed("range entry is not an array"));
        };
        if fields.len() < 3 {
            return Err(malformed("range entry is missing the master"));
        }

        let start = parse_slot(&fields[0])?;
        let end = parse_slot(&fields[1])?;
        if start > end {
            return Err(malformed("range start exceeds end"));
        }

        let master = parse_node(&fields[2])?;
        let mut replicas = Vec::with_capacity(fields.len() - 3);
        for field in &fields[3..] {
            replicas.push(parse_node(field)?);
        }

        infos.push(SlotInfo::new(start, end, master, replicas));
    }
    Ok(infos)
}

fn parse_slot(value: &RespValue) -> ProxyResult<Slot> {
    let RespValue::Integer(raw) = value else {
        return Err(malformed("slot bound is not an integer"));
    };
    u16::try_from(*raw)
        .ok()
        .filter(|slot| *slot < SLOT_COUNT)
        .map(Slot::new)
        .ok_or_else(|| malformed("slot bound out of range"))
}

/// Parses a `[ip, port, ...]` node entry into `ip:port`.
fn parse_node(value: &RespValue) -> ProxyResult<Arc<str>> {
    let RespValue::Array(fields) = value else {
        return Err(malformed("node entry is not an array"));
    };
    let Some(RespValue::Bulk(ip)) = fields.first() else {
        return Err(malformed("node entry is missing the address"));
    };
    let Some(RespValue::Integer(port)) = fields.get(1) else {
        return Err(malformed("node entry is missing the port"));
    };
    let ip = std::str::from_utf8(ip).map_err(|_| malformed("node address is not UTF-8"))?;
    Ok(Arc::from(format!("{ip}:{port}")))
}

fn malformed(message: &str) -> ProxyError {
    ProxyError::Topology {
        message: message.to_string(),
    }
}
