//! Tunnel transport loops
//!
//! Two tasks per tunnel:
//!
//! - the **read loop** pulls frames off the channel (exact 4-byte length,
//!   then payload), decodes them, and hands each message to the dispatch
//!   core. EOF, I/O errors, and framing errors close the tunnel.
//! - the **flush loop** drains the tunnel save queue whenever a write left
//!   bytes behind, and lifts the all-flows suspension once the channel
//!   caught up.
//!
//! A message is delivered whole or the tunnel is closed; there is no
//! partial-message delivery.

use std::future::poll_fn;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::{debug, info_span, warn, Instrument};

use super::{BoxReader, Tunnel};
use crate::error::TunnelError;
use crate::message::{decode_payload, LENGTH_FIELD_LEN, MAX_FRAME_LEN};

pub(crate) async fn read_loop(tunnel: Arc<Tunnel>, mut reader: BoxReader) {
    let span = info_span!("tunnel_read", tunnel = tunnel.id());
    async {
        let mut shutdown = tunnel.shutdown_signal();
        let result = tokio::select! {
            _ = shutdown.changed() => Ok(()),
            result = run_read(&tunnel, &mut reader) => result,
        };
        match result {
            Ok(()) => debug!("read loop finished"),
            Err(TunnelError::Io(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                debug!("peer closed the tunnel transport");
            }
            Err(e) => warn!("tunnel read failed: {}", e),
        }
        tunnel.close();
    }
    .instrument(span)
    .await;
}

async fn run_read(tunnel: &Arc<Tunnel>, reader: &mut BoxReader) -> Result<(), TunnelError> {
    loop {
        let mut length_field = [0u8; LENGTH_FIELD_LEN];
        reader.read_exact(&mut length_field).await?;

        let length = u32::from_le_bytes(length_field) as usize;
        if !(LENGTH_FIELD_LEN..=MAX_FRAME_LEN).contains(&length) {
            return Err(crate::error::FrameError::LengthOutOfRange { length }.into());
        }

        let mut payload = vec![0u8; length - LENGTH_FIELD_LEN];
        reader.read_exact(&mut payload).await?;

        let message = decode_payload(&payload)?;
        tunnel.handle_message(message).await;
    }
}

pub(crate) async fn flush_loop(tunnel: Arc<Tunnel>) {
    let span = info_span!("tunnel_flush", tunnel = tunnel.id());
    async {
        let mut shutdown = tunnel.shutdown_signal();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                () = tunnel.writable_notify().notified() => {}
            }
            if tunnel.is_closed() {
                break;
            }
            let drained = tokio::select! {
                _ = shutdown.changed() => break,
                result = poll_fn(|cx| tunnel.poll_drain_sink(cx)) => result,
            };
            match drained {
                Ok(()) => tunnel.queue_drained(),
                Err(e) => {
                    warn!("transport drain failed: {}", e);
                    tunnel.close();
                    break;
                }
            }
        }
        debug!("flush loop finished");
    }
    .instrument(span)
    .await;
}
