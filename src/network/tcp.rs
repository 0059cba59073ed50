use std::io::{self, ErrorKind};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::codec::Codec;
use crate::service::Shutdown;
use crate::session::{CloseReason, Listener, Outbound, Session};
use crate::{ServError, ServResult};

/// Single task that owns all I/O of one TCP session.
///
/// The pump multiplexes the inbound stream, the outbound queue, close
/// requests and the endpoint shutdown broadcast. Because nothing else ever
/// touches the stream or the accumulation buffer, no locking is needed on
/// the read path and listener callbacks are naturally serialized.
pub(crate) struct SessionPump<C: Codec, L: Listener<C::Msg>> {
    pub session: Arc<Session<C::Msg>>,
    pub codec: Arc<C>,
    pub listener: Arc<L>,
    pub outbound_rx: mpsc::Receiver<Outbound<C::Msg>>,
    pub shutdown: Shutdown,
    pub read_buffer_size: usize,
}

impl<C: Codec, L: Listener<C::Msg>> SessionPump<C, L> {
    pub(crate) async fn run(self, stream: TcpStream) -> CloseReason {
        let SessionPump {
            session,
            codec,
            listener,
            mut outbound_rx,
            mut shutdown,
            read_buffer_size,
        } = self;

        let (mut reader, writer) = stream.into_split();
        let mut writer = BufWriter::new(writer);
        let mut buffer = BytesMut::with_capacity(read_buffer_size);
        let mut encode_buf = BytesMut::new();

        let reason = loop {
            tokio::select! {
                read = reader.read_buf(&mut buffer) => {
                    match read {
                        Ok(0) => {
                            if buffer.is_empty() {
                                // peer closed the connection gracefully
                                break CloseReason::PeerClosed;
                            }
                            // peer went away mid-frame
                            let err = ServError::Io(io::Error::new(
                                ErrorKind::ConnectionReset,
                                "connection reset by peer",
                            ));
                            listener.on_exception(&session, &err);
                            break CloseReason::IoError;
                        }
                        Ok(n) => {
                            trace!(session_id = session.id(), bytes = n, "read");
                            session.touch_recv();
                            if let Err(e) = dispatch(&codec, &listener, &session, &mut buffer) {
                                listener.on_exception(&session, &e);
                                break CloseReason::ProtocolError;
                            }
                        }
                        Err(e) => {
                            listener.on_exception(&session, &e.into());
                            break CloseReason::IoError;
                        }
                    }
                }
                outbound = outbound_rx.recv() => {
                    let Some(outbound) = outbound else {
                        break CloseReason::Disconnected;
                    };
                    if let Err(e) = write_outbound(&*codec, &mut writer, &mut encode_buf, outbound).await {
                        let reason = match e {
                            ServError::Codec(_) => CloseReason::ProtocolError,
                            _ => CloseReason::IoError,
                        };
                        listener.on_exception(&session, &e);
                        break reason;
                    }
                    session.touch_send();
                }
                _ = session.closed() => {
                    break session
                        .requested_close_reason()
                        .unwrap_or(CloseReason::Disconnected);
                }
                _ = shutdown.recv() => {
                    debug!(session_id = session.id(), "session pump received shutdown signal");
                    break CloseReason::Disconnected;
                }
            }
        };

        // on a clean local close, drain messages enqueued before the close so
        // the ordered-delivery guarantee covers them
        if matches!(reason, CloseReason::Disconnected | CloseReason::PeerClosed) {
            while let Ok(outbound) = outbound_rx.try_recv() {
                if write_outbound(&*codec, &mut writer, &mut encode_buf, outbound)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;

        finish(&session, &*listener, reason);
        reason
    }
}

fn dispatch<C: Codec, L: Listener<C::Msg>>(
    codec: &Arc<C>,
    listener: &Arc<L>,
    session: &Arc<Session<C::Msg>>,
    buffer: &mut BytesMut,
) -> ServResult<()> {
    while let Some(msg) = codec.decode(buffer)? {
        listener.on_receive(session, msg);
    }
    Ok(())
}

// takes the message by value: messages are only `Send`, so the pump future
// must not borrow them across the write awaits
async fn write_outbound<C: Codec>(
    codec: &C,
    writer: &mut BufWriter<OwnedWriteHalf>,
    encode_buf: &mut BytesMut,
    outbound: Outbound<C::Msg>,
) -> ServResult<()> {
    let msg = match outbound {
        Outbound::Msg(msg) => msg,
        // destination is fixed by the connected stream
        Outbound::MsgTo(msg, _) => msg,
    };
    encode_buf.clear();
    codec.encode(&msg, encode_buf)?;
    writer.write_all(encode_buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Terminal transition shared by the TCP and UDP pumps.
pub(crate) fn finish<M: Send + 'static, L: Listener<M>>(
    session: &Arc<Session<M>>,
    listener: &L,
    reason: CloseReason,
) {
    if session.transition_closed() {
        debug!(session_id = session.id(), %reason, "session closed");
        listener.on_close(session, reason);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use bytes::Buf;

    use super::*;

    struct CellCodec;

    impl Codec for CellCodec {
        type Msg = Cell<u8>;

        fn encode(&self, msg: &Cell<u8>, dst: &mut BytesMut) -> ServResult<()> {
            dst.extend_from_slice(&[msg.get()]);
            Ok(())
        }

        fn decode(&self, src: &mut BytesMut) -> ServResult<Option<Cell<u8>>> {
            if src.is_empty() {
                return Ok(None);
            }
            Ok(Some(Cell::new(src.get_u8())))
        }
    }

    struct Sink;

    impl Listener<Cell<u8>> for Sink {
        fn on_receive(&self, _session: &Arc<Session<Cell<u8>>>, _msg: Cell<u8>) {}
    }

    // the pump future must stay spawnable when messages are `Send` but not
    // `Sync`; this fails to compile if the pump ever borrows one across an
    // await
    #[test]
    fn test_pump_future_is_send() {
        fn require_send<F: Send>(_f: F) {}
        fn check(pump: SessionPump<CellCodec, Sink>, stream: TcpStream) {
            require_send(pump.run(stream));
        }
        let _ = check;
    }
}
