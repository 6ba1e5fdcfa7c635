//! bulk download of the readings log

use crate::protocol::download_head;
use crate::registry::ClientSink;
use crate::store::LogFile;

use anyhow::Result;
use chrono::{Local, TimeZone};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// bytes per body write
pub const EXPORT_CHUNK: usize = 32 * 1024;

/// stream the whole log to `sink` while holding the log lock
///
/// returns the body bytes sent.
pub async fn stream_export(log: LogFile, sink: ClientSink) -> Result<u64> {
    let held = log.lock_export().await;
    let len = held.len()?;
    let filename = export_filename(held.bounds()?);
    let mut file = held.reader().await?;

    // the one place two locks are held together: log first, then the sink.
    // nothing takes a sink and then the log.
    let mut sink = sink.lock().await;
    sink.write_all(download_head(&filename, len).as_bytes()).await?;

    let mut buf = vec![0u8; EXPORT_CHUNK];
    let mut sent = 0u64;
    while sent < len {
        let want = buf.len().min((len - sent) as usize);
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n]).await?;
        sent += n as u64;
    }
    sink.flush().await?;
    Ok(sent)
}

/// `<first>__<last>.rws` in local time, or `readings.rws` for an empty log
pub fn export_filename(bounds: Option<(u32, u32)>) -> String {
    match bounds {
        Some((first, last)) => format!("{}__{}.rws", stamp(first), stamp(last)),
        None => "readings.rws".to_string(),
    }
}

fn stamp(timestamp: u32) -> String {
    match Local.timestamp_opt(i64::from(timestamp), 0).single() {
        Some(t) => t.format("%Y.%m.%d_%H.%M.%S").to_string(),
        None => timestamp.to_string(),
    }
}
